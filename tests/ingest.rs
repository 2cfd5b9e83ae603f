//! End-to-end loads through the public API, verified against the
//! on-disk table layout.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use parload::{Atomicity, ColumnType, LoadError, LoadRequest, Loader, PartitionBy, Settings};
use tempfile::TempDir;

struct Env {
    _root: TempDir,
    input_root: PathBuf,
    work_root: PathBuf,
    db_root: PathBuf,
}

impl Env {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let input_root = root.path().join("in");
        let work_root = root.path().join("work");
        let db_root = root.path().join("db");
        for dir in [&input_root, &work_root, &db_root].iter() {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self {
            _root: root,
            input_root,
            work_root,
            db_root,
        }
    }

    fn settings(&self, workers: usize) -> Settings {
        Settings::new(&self.input_root, &self.work_root, &self.db_root)
            .with_workers(workers)
            .with_min_chunk_size(16 * 1024)
    }

    fn write_input(&self, name: &str, content: &[u8]) {
        std::fs::write(self.input_root.join(name), content).unwrap();
    }

    fn partition_dir(&self, table: &str, partition: &str) -> PathBuf {
        self.db_root.join(table).join(partition)
    }

    fn work_dir(&self, table: &str) -> PathBuf {
        self.work_root.join(table)
    }
}

fn read_i64s(path: &Path) -> Vec<i64> {
    let mut bytes = Vec::new();
    File::open(path).unwrap().read_to_end(&mut bytes).unwrap();
    bytes.chunks_exact(8).map(LittleEndian::read_i64).collect()
}

fn read_i32s(path: &Path) -> Vec<i32> {
    let mut bytes = Vec::new();
    File::open(path).unwrap().read_to_end(&mut bytes).unwrap();
    bytes.chunks_exact(4).map(LittleEndian::read_i32).collect()
}

/// Symbol dictionary values in key order.
fn read_symbols(path: &Path) -> Vec<String> {
    let mut bytes = Vec::new();
    File::open(path).unwrap().read_to_end(&mut bytes).unwrap();
    let mut values = Vec::new();
    let mut pos = 0;
    while pos + 4 <= bytes.len() {
        let len = LittleEndian::read_u32(&bytes[pos..pos + 4]) as usize;
        pos += 4;
        values.push(String::from_utf8(bytes[pos..pos + len].to_vec()).unwrap());
        pos += len;
    }
    values
}

/// String column value of one row, through its offset file.
fn read_str_value(partition: &Path, column: &str, row: usize) -> Option<Vec<u8>> {
    let offsets = {
        let mut bytes = Vec::new();
        File::open(partition.join(format!("{}.x", column)))
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        bytes
            .chunks_exact(8)
            .map(LittleEndian::read_u64)
            .collect::<Vec<_>>()
    };
    let mut data = Vec::new();
    File::open(partition.join(format!("{}.d", column)))
        .unwrap()
        .read_to_end(&mut data)
        .unwrap();
    let at = offsets[row] as usize;
    let len = LittleEndian::read_u32(&data[at..at + 4]);
    if len == u32::MAX {
        return None;
    }
    Some(data[at + 4..at + 4 + len as usize].to_vec())
}

fn micros(s: &str) -> i64 {
    DateTime::parse_from_rfc3339(s).unwrap().timestamp_micros()
}

#[test]
fn test_single_worker_two_day_partitions() {
    let env = Env::new();
    env.write_input(
        "trades.csv",
        b"t,v\n2020-01-01T00:00:00Z,1\n2020-01-02T00:00:00Z,2\n",
    );
    let loader = Loader::new(env.settings(1)).unwrap();
    let request = LoadRequest::builder("trades", "trades.csv")
        .partition_by(PartitionBy::Day)
        .build()
        .unwrap();
    let summary = loader.load(&request).unwrap();

    assert_eq!(summary.workers, 1);
    assert_eq!(summary.rows_indexed, 2);
    assert_eq!(summary.rows_loaded, 2);
    assert_eq!(summary.rows_rejected, 0);
    assert_eq!(
        summary.partitions,
        vec!["2020-01-01".to_string(), "2020-01-02".to_string()]
    );

    for (partition, value) in [("2020-01-01", 1i64), ("2020-01-02", 2i64)].iter() {
        let dir = env.partition_dir("trades", partition);
        assert!(dir.is_dir());
        assert_eq!(read_i64s(&dir.join("t.d")).len(), 1);
        assert_eq!(read_i64s(&dir.join("v.d")), vec![*value]);
    }
    assert!(!env.work_dir("trades").exists());
}

#[test]
fn test_multi_worker_quoted_field_across_chunk_boundary() {
    let env = Env::new();
    let base = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();
    let padding = "p".repeat(800);

    // The payload of the quoted field on data line 5000: about one
    // mebibyte, with embedded newlines, delimiters and doubled quotes.
    let payload = "part,one\npart\"two\"\n".repeat(55_000);
    let quoted = format!("\"{}\"", payload.replace('"', "\"\""));

    let special = 5000usize;
    let total_rows = 20_000usize;
    let mut data = String::with_capacity(18 * 1024 * 1024);
    data.push_str("ts,sym,note\n");
    for i in 0..total_rows {
        let ts = (base + Duration::milliseconds(i as i64))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        if i == special {
            data.push_str(&format!("{},s{},{}\n", ts, i % 4, quoted));
        } else {
            data.push_str(&format!("{},s{},v{}{}\n", ts, i % 4, i, padding));
        }
    }
    assert!(data.len() > 16 * 1024 * 1024);
    env.write_input("big.csv", data.as_bytes());

    let settings = Settings::new(&env.input_root, &env.work_root, &env.db_root)
        .with_workers(4)
        .with_min_chunk_size(4 * 1024 * 1024);
    let loader = Loader::new(settings).unwrap();
    let request = LoadRequest::builder("big", "big.csv")
        .partition_by(PartitionBy::Day)
        .build()
        .unwrap();
    let summary = loader.load(&request).unwrap();

    assert_eq!(summary.rows_indexed, total_rows as u64);
    assert_eq!(summary.rows_loaded, total_rows as u64);
    assert_eq!(summary.timestamp_errors, 0);
    assert_eq!(summary.partitions, vec!["2020-03-01".to_string()]);

    let dir = env.partition_dir("big", "2020-03-01");
    let timestamps = read_i64s(&dir.join("ts.d"));
    assert_eq!(timestamps.len(), total_rows);
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(timestamps[0], base.timestamp_micros());

    // The quoted field survived the chunk boundary intact; rows are in
    // timestamp order, so data line 5000 is row 5000.
    let note = read_str_value(&dir, "note", special).unwrap();
    assert_eq!(note, payload.as_bytes());

    // Symbol keys resolve to the expected cycling values.
    let dict = read_symbols(&env.db_root.join("big").join("sym.sym"));
    let keys = read_i32s(&dir.join("sym.k"));
    for row in [0usize, 1, 4999, 5000, 5001, 19_999].iter() {
        assert_eq!(dict[keys[*row] as usize], format!("s{}", row % 4));
    }
}

#[test]
fn test_worker_counts_agree() {
    let env = Env::new();
    let base = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
    let mut data = String::new();
    let rows = 5000usize;
    for i in 0..rows {
        let ts = (base + Duration::seconds(i as i64 * 20))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        data.push_str(&format!("{},{}\n", ts, i));
    }
    env.write_input("steady.csv", data.as_bytes());

    let mut baseline: Option<Vec<(String, usize)>> = None;
    for workers in [1usize, 2, 4, 8].iter() {
        let loader = Loader::new(env.settings(*workers)).unwrap();
        let request = LoadRequest::builder("steady", "steady.csv")
            .partition_by(PartitionBy::Day)
            .build()
            .unwrap();
        let summary = loader.load(&request).unwrap();
        assert_eq!(summary.rows_indexed, rows as u64, "workers = {}", workers);
        assert_eq!(summary.rows_loaded, rows as u64, "workers = {}", workers);

        let mut shape = Vec::new();
        for partition in &summary.partitions {
            let dir = env.partition_dir("steady", partition);
            let timestamps = read_i64s(&dir.join("f0.d"));
            assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
            shape.push((partition.clone(), timestamps.len()));
        }
        assert_eq!(shape.iter().map(|(_, n)| n).sum::<usize>(), rows);
        match &baseline {
            None => baseline = Some(shape),
            Some(expected) => assert_eq!(&shape, expected, "workers = {}", workers),
        }
        std::fs::remove_dir_all(env.db_root.join("steady")).unwrap();
    }
}

#[test]
fn test_odd_parity_chunk_start_matches_single_worker() {
    let env = Env::new();
    // A quoted field with newlines big enough to swallow several tiny
    // chunks, so later chunk starts fall inside the quotes.
    let blob = "line one\nline two\nline,three\n".repeat(40);
    let mut data = String::new();
    data.push_str("2022-01-01T00:00:00Z,plain\n");
    data.push_str(&format!("2022-01-01T00:00:01Z,\"{}\"\n", blob));
    for i in 2..50 {
        data.push_str(&format!("2022-01-01T00:00:{:02}Z,v{}\n", i, i));
    }
    env.write_input("quoted.csv", data.as_bytes());

    let mut results = Vec::new();
    for workers in [1usize, 4].iter() {
        let settings = Settings::new(&env.input_root, &env.work_root, &env.db_root)
            .with_workers(*workers)
            .with_min_chunk_size(128);
        let loader = Loader::new(settings).unwrap();
        let request = LoadRequest::builder("quoted", "quoted.csv")
            .partition_by(PartitionBy::Day)
            .build()
            .unwrap();
        let summary = loader.load(&request).unwrap();
        let dir = env.partition_dir("quoted", "2022-01-01");
        results.push((
            summary.rows_loaded,
            read_i64s(&dir.join("f0.d")),
            read_str_value(&dir, "f1", 1),
        ));
        std::fs::remove_dir_all(env.db_root.join("quoted")).unwrap();
    }

    assert_eq!(results[0].0, 50);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0].2.as_deref(), Some(blob.as_bytes()));
}

#[test]
fn test_skip_row_atomicity() {
    let env = Env::new();
    env.write_input(
        "rows.csv",
        b"ts,qty\n\
          2020-01-01T00:00:00Z,1\n\
          2020-01-01T00:00:01Z,2\n\
          2020-01-01T00:00:02Z,3\n\
          2020-01-01T00:00:03Z,4\n\
          2020-01-01T00:00:04Z,5\n\
          2020-01-01T00:00:05Z,6\n\
          2020-01-01T00:00:06Z,7\n\
          2020-01-01T00:00:07Z,8\n\
          2020-01-01T00:00:08Z,not-a-number\n\
          2020-01-01T00:00:09Z,10\n",
    );
    // Sample only the head so the bad value cannot demote the column.
    let settings = env.settings(2).with_sample_lines(5);
    let loader = Loader::new(settings).unwrap();
    let request = LoadRequest::builder("rows", "rows.csv")
        .partition_by(PartitionBy::Day)
        .atomicity(Atomicity::SkipRow)
        .build()
        .unwrap();
    let summary = loader.load(&request).unwrap();

    assert_eq!(summary.rows_indexed, 10);
    assert_eq!(summary.rows_loaded, 9);
    assert_eq!(summary.rows_rejected, 1);

    let dir = env.partition_dir("rows", "2020-01-01");
    let quantities = read_i64s(&dir.join("qty.d"));
    assert_eq!(quantities, vec![1, 2, 3, 4, 5, 6, 7, 8, 10]);
    assert_eq!(read_i64s(&dir.join("ts.d")).len(), 9);
}

#[test]
fn test_skip_column_nulls_field() {
    let env = Env::new();
    env.write_input(
        "cols.csv",
        b"ts,qty\n\
          2020-01-01T00:00:00Z,1\n\
          2020-01-01T00:00:01Z,2\n\
          2020-01-01T00:00:02Z,3\n\
          2020-01-01T00:00:03Z,oops\n",
    );
    let settings = env.settings(1).with_sample_lines(3);
    let loader = Loader::new(settings).unwrap();
    let request = LoadRequest::builder("cols", "cols.csv")
        .partition_by(PartitionBy::Day)
        .atomicity(Atomicity::SkipColumn)
        .build()
        .unwrap();
    let summary = loader.load(&request).unwrap();

    assert_eq!(summary.rows_loaded, 4);
    assert_eq!(summary.fields_nulled, 1);
    let quantities = read_i64s(&env.partition_dir("cols", "2020-01-01").join("qty.d"));
    assert_eq!(quantities, vec![1, 2, 3, i64::MIN]);
}

#[test]
fn test_symbol_merge_across_workers() {
    let env = Env::new();
    // Two partitions, two workers: each staging table builds its own
    // dictionary, with "b" seen by both.
    env.write_input(
        "syms.csv",
        b"ts,sym\n\
          2020-01-01T00:00:00Z,a\n\
          2020-01-01T00:00:01Z,b\n\
          2020-01-02T00:00:00Z,b\n\
          2020-01-02T00:00:01Z,c\n",
    );
    let loader = Loader::new(env.settings(2)).unwrap();
    let request = LoadRequest::builder("syms", "syms.csv")
        .partition_by(PartitionBy::Day)
        .column_type("sym", ColumnType::Symbol)
        .build()
        .unwrap();
    let summary = loader.load(&request).unwrap();
    assert_eq!(summary.rows_loaded, 4);
    assert_eq!(summary.partitions.len(), 2);

    let dict = read_symbols(&env.db_root.join("syms").join("sym.sym"));
    assert_eq!(dict.len(), 3, "one key per distinct value: {:?}", dict);

    let day1 = read_i32s(&env.partition_dir("syms", "2020-01-01").join("sym.k"));
    let day2 = read_i32s(&env.partition_dir("syms", "2020-01-02").join("sym.k"));
    assert_eq!(dict[day1[0] as usize], "a");
    assert_eq!(dict[day1[1] as usize], "b");
    assert_eq!(dict[day2[0] as usize], "b");
    assert_eq!(dict[day2[1] as usize], "c");
    // All rows referencing "b" resolve to one key.
    assert_eq!(day1[1], day2[0]);
}

#[test]
fn test_restart_is_idempotent() {
    let env = Env::new();
    env.write_input(
        "again.csv",
        b"2020-05-01T10:00:00Z,1\n2020-05-02T10:00:00Z,2\n2020-05-01T11:00:00Z,3\n",
    );
    let loader = Loader::new(env.settings(2)).unwrap();
    let request = LoadRequest::builder("again", "again.csv")
        .partition_by(PartitionBy::Day)
        .build()
        .unwrap();

    let first = loader.load(&request).unwrap();
    let first_rows: Vec<Vec<i64>> = first
        .partitions
        .iter()
        .map(|p| read_i64s(&env.partition_dir("again", p).join("f0.d")))
        .collect();

    std::fs::remove_dir_all(env.db_root.join("again")).unwrap();
    let second = loader.load(&request).unwrap();
    let second_rows: Vec<Vec<i64>> = second
        .partitions
        .iter()
        .map(|p| read_i64s(&env.partition_dir("again", p).join("f0.d")))
        .collect();

    assert_eq!(first.rows_loaded, second.rows_loaded);
    assert_eq!(first.partitions, second.partitions);
    assert_eq!(first_rows, second_rows);
}

#[test]
fn test_failure_removes_work_directory() {
    let env = Env::new();
    env.write_input(
        "fatal.csv",
        b"ts,qty\n\
          2020-01-01T00:00:00Z,1\n\
          2020-01-01T00:00:01Z,2\n\
          2020-01-01T00:00:02Z,3\n\
          2020-01-01T00:00:03Z,bad\n",
    );
    let settings = env.settings(1).with_sample_lines(3);
    let loader = Loader::new(settings).unwrap();
    let request = LoadRequest::builder("fatal", "fatal.csv")
        .partition_by(PartitionBy::Day)
        .atomicity(Atomicity::SkipAll)
        .build()
        .unwrap();
    let err = loader.load(&request);
    assert!(matches!(err, Err(LoadError::PartitionAborted { .. })));

    assert!(!env.work_dir("fatal").exists());
    // No partition was attached to the target.
    assert!(!env.db_root.join("fatal").join("_partitions").exists());
    assert!(!env.partition_dir("fatal", "2020-01-01").exists());
}

#[test]
fn test_second_load_into_loaded_table_is_rejected() {
    let env = Env::new();
    env.write_input("twice.csv", b"2020-01-01T00:00:00Z,1\n");
    let loader = Loader::new(env.settings(1)).unwrap();
    let request = LoadRequest::builder("twice", "twice.csv")
        .partition_by(PartitionBy::Day)
        .build()
        .unwrap();
    loader.load(&request).unwrap();

    let err = loader.load(&request);
    assert!(matches!(err, Err(LoadError::TargetTableNotEmpty(_))));
}

#[test]
fn test_empty_input_is_a_configuration_error() {
    let env = Env::new();
    env.write_input("empty.csv", b"");
    let loader = Loader::new(env.settings(1)).unwrap();
    let request = LoadRequest::builder("empty", "empty.csv")
        .partition_by(PartitionBy::Day)
        .build()
        .unwrap();
    assert!(matches!(
        loader.load(&request),
        Err(LoadError::EmptyInput(_))
    ));
    assert!(!env.work_dir("empty").exists());
}

#[test]
fn test_delimiter_auto_detection() {
    let env = Env::new();
    env.write_input(
        "semi.csv",
        b"2020-01-01T00:00:00Z;1\n2020-01-01T00:00:01Z;2\n",
    );
    let loader = Loader::new(env.settings(1)).unwrap();
    let request = LoadRequest::builder("semi", "semi.csv")
        .partition_by(PartitionBy::Day)
        .build()
        .unwrap();
    let summary = loader.load(&request).unwrap();
    assert_eq!(summary.rows_loaded, 2);
    let quantities = read_i64s(&env.partition_dir("semi", "2020-01-01").join("f1.d"));
    assert_eq!(quantities, vec![1, 2]);
}

#[test]
fn test_hour_partitioning() {
    let env = Env::new();
    env.write_input(
        "hourly.csv",
        b"2020-01-01T05:10:00Z,1\n2020-01-01T06:20:00Z,2\n2020-01-01T05:50:00Z,3\n",
    );
    let loader = Loader::new(env.settings(2)).unwrap();
    let request = LoadRequest::builder("hourly", "hourly.csv")
        .partition_by(PartitionBy::Hour)
        .build()
        .unwrap();
    let summary = loader.load(&request).unwrap();
    assert_eq!(
        summary.partitions,
        vec!["2020-01-01T05".to_string(), "2020-01-01T06".to_string()]
    );
    let five = read_i64s(&env.partition_dir("hourly", "2020-01-01T05").join("f0.d"));
    assert_eq!(five.len(), 2);
    assert!(five.iter().all(|&ts| {
        ts >= micros("2020-01-01T05:00:00Z") && ts < micros("2020-01-01T06:00:00Z")
    }));
}
