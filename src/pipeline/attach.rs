//! Attach phase: move staged partition directories into the final table.
//!
//! Attach faults are logged per partition and do not stop the remaining
//! partitions; the whole load is restartable, so a partial attach is
//! left as-is rather than rolled back.

use std::path::Path;

use log::{error, info};

use crate::table::{partition_row_count, Table};

/// `(partition dir name, owning worker)` in canonical partition order.
pub(crate) type Assignment = (String, usize);

/// Renames each staged partition into the final table and attaches it.
/// Returns the names that made it, in order.
pub(crate) fn attach_partitions(
    final_table: &mut Table,
    work_dir: &Path,
    assignments: &[Assignment],
) -> crate::Result<Vec<String>> {
    let mut attached = Vec::with_capacity(assignments.len());
    for (partition, worker) in assignments {
        let staged = work_dir
            .join(format!("{}__{}", final_table.name(), worker))
            .join(partition);
        let target = final_table.partition_dir(partition);

        let rows = match partition_row_count(&staged, final_table.schema()) {
            Ok(rows) => rows,
            Err(e) => {
                error!("partition {}: cannot size staged data: {}", partition, e);
                continue;
            }
        };
        if let Err(e) = std::fs::rename(&staged, &target) {
            error!(
                "partition {}: rename into final table failed: {}",
                partition, e
            );
            continue;
        }
        if let Err(e) = final_table.attach_partition(partition, rows) {
            error!("partition {}: attach failed: {}", partition, e);
            continue;
        }
        info!("partition {}: attached {} rows", partition, rows);
        attached.push(partition.clone());
    }
    Ok(attached)
}
