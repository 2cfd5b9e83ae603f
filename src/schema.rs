//! Column types and first-lines detection of delimiter, header and schema.
//!
//! Detection is a heuristic over a bounded sample of the file head, as is
//! usual for bulk loaders: it is cheap, it is deterministic, and callers
//! that know better override it per column on the request.

use csv::ByteRecord;
use memchr::memchr_iter;

use crate::config::LoadRequest;
use crate::errors::LoadError;

/// Candidate delimiters probed by the detector, in preference order.
const DELIMITER_CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Lines inspected by the delimiter detector.
const DELIMITER_PROBE_LINES: usize = 10;

/// Longest sampled value a column may have and still be typed as a symbol.
const MAX_SYMBOL_LEN: usize = 64;

/// Storage type of one column.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Epoch microseconds, 8 bytes per row.
    Timestamp,
    /// 8-byte signed integer.
    Long,
    /// 8-byte float.
    Double,
    /// Interned string, stored as a 4-byte dictionary key.
    Symbol,
    /// Arbitrary string, stored out of line.
    Str,
}

impl ColumnType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            ColumnType::Timestamp => 0,
            ColumnType::Long => 1,
            ColumnType::Double => 2,
            ColumnType::Symbol => 3,
            ColumnType::Str => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ColumnType::Timestamp,
            1 => ColumnType::Long,
            2 => ColumnType::Double,
            3 => ColumnType::Symbol,
            4 => ColumnType::Str,
            _ => return None,
        })
    }
}

/// One column of the target table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

/// Schema of the target table plus what the detector learned about the
/// input file itself (header presence).
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<Column>,
    timestamp_index: usize,
    has_header: bool,
}

impl Schema {
    pub(crate) fn new(columns: Vec<Column>, timestamp_index: usize, has_header: bool) -> Self {
        Self {
            columns,
            timestamp_index,
            has_header,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Index of the designated timestamp column.
    pub fn timestamp_index(&self) -> usize {
        self.timestamp_index
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }

    pub(crate) fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }
}

/// Parses timestamp fields into epoch microseconds (UTC).
#[derive(Debug, Clone)]
pub struct TimestampParser {
    format: Option<String>,
}

impl TimestampParser {
    pub fn new(format: Option<&str>) -> Self {
        Self {
            format: format.map(String::from),
        }
    }

    /// `None` for anything that is not a timestamp under the configured
    /// format; naive datetimes are taken as UTC.
    pub fn parse(&self, bytes: &[u8]) -> Option<i64> {
        let text = std::str::from_utf8(bytes).ok()?.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(format) = &self.format {
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, format) {
                return Some(dt.and_utc().timestamp_micros());
            }
            if let Ok(dt) = chrono::DateTime::parse_from_str(text, format) {
                return Some(dt.timestamp_micros());
            }
            // Date-only formats such as %Y%m%d resolve to midnight.
            return chrono::NaiveDate::parse_from_str(text, format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_micros());
        }
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
            return Some(dt.timestamp_micros());
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(dt.and_utc().timestamp_micros());
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
            return Some(dt.and_utc().timestamp_micros());
        }
        chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp_micros())
    }
}

pub(crate) fn parse_long(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

pub(crate) fn parse_double(bytes: &[u8]) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Detects the column delimiter from the first probed lines.
///
/// Quoted delimiters skew the counts, which is acceptable for a probe:
/// a candidate only wins when it appears on every line, and consistent
/// per-line counts beat inconsistent ones.
pub(crate) fn detect_delimiter(sample: &[u8]) -> crate::Result<u8> {
    let mut lines: Vec<&[u8]> = Vec::with_capacity(DELIMITER_PROBE_LINES);
    let mut start = 0usize;
    for end in memchr_iter(b'\n', sample) {
        if end > start {
            lines.push(&sample[start..end]);
        }
        start = end + 1;
        if lines.len() == DELIMITER_PROBE_LINES {
            break;
        }
    }
    if lines.is_empty() && start < sample.len() {
        lines.push(&sample[start..]);
    }
    if lines.is_empty() {
        return Err(LoadError::DelimiterNotDetected);
    }

    let mut best: Option<(bool, u64, u8)> = None;
    for &candidate in DELIMITER_CANDIDATES.iter() {
        let counts: Vec<u64> = lines
            .iter()
            .map(|line| line.iter().filter(|&&b| b == candidate).count() as u64)
            .collect();
        let min = *counts.iter().min().unwrap_or(&0);
        let max = *counts.iter().max().unwrap_or(&0);
        if min == 0 {
            continue;
        }
        let key = (min == max, min, candidate);
        let better = match best {
            None => true,
            Some((consistent, score, _)) => (min == max, min) > (consistent, score),
        };
        if better {
            best = Some(key);
        }
    }
    best.map(|(_, _, candidate)| candidate)
        .ok_or(LoadError::DelimiterNotDetected)
}

/// Lexes up to `limit` records from the sampled head of the file.
///
/// When the sample was cut short of the file, the last record may be
/// truncated mid-field and is dropped.
pub(crate) fn sample_records(
    sample: &[u8],
    truncated: bool,
    delimiter: u8,
    limit: usize,
) -> crate::Result<Vec<ByteRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(sample);
    let mut records = Vec::new();
    let mut record = ByteRecord::new();
    while records.len() < limit && reader.read_byte_record(&mut record)? {
        records.push(record.clone());
    }
    if truncated && records.len() > 1 {
        records.pop();
    }
    Ok(records)
}

/// Detects header presence and column types from sampled records and
/// applies the request's overrides, producing the table schema.
pub(crate) fn detect_schema(
    records: &[ByteRecord],
    request: &LoadRequest,
    ts_parser: &TimestampParser,
) -> crate::Result<Schema> {
    if records.is_empty() {
        return Err(LoadError::NoTimestampColumn);
    }
    let column_count = records.iter().map(|r| r.len()).max().unwrap_or(0);

    let has_header = if request.force_header {
        true
    } else if records.len() > 1 {
        let body_types = detect_types(&records[1..], column_count, ts_parser);
        header_disagrees(&records[0], &body_types, ts_parser)
    } else {
        false
    };

    let body = if has_header { &records[1..] } else { records };
    let types = detect_types(body, column_count, ts_parser);

    let mut columns: Vec<Column> = (0..column_count)
        .map(|i| {
            let name = if has_header {
                records[0]
                    .get(i)
                    .map(|bytes| sanitize_name(bytes, i))
                    .unwrap_or_else(|| format!("f{}", i))
            } else {
                format!("f{}", i)
            };
            Column { name, ty: types[i] }
        })
        .collect();

    for (name, ty) in &request.column_types {
        if let Some(column) = columns.iter_mut().find(|c| &c.name == name) {
            column.ty = *ty;
        }
    }

    let timestamp_index = match &request.timestamp_column {
        Some(name) => {
            let index = columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| LoadError::TimestampColumnNotFound(name.clone()))?;
            columns[index].ty = ColumnType::Timestamp;
            index
        }
        None => columns
            .iter()
            .position(|c| c.ty == ColumnType::Timestamp)
            .ok_or(LoadError::NoTimestampColumn)?,
    };

    Ok(Schema::new(columns, timestamp_index, has_header))
}

fn detect_types(records: &[ByteRecord], column_count: usize, ts: &TimestampParser) -> Vec<ColumnType> {
    (0..column_count)
        .map(|i| {
            let values: Vec<&[u8]> = records
                .iter()
                .filter_map(|r| r.get(i))
                .filter(|v| !v.is_empty())
                .collect();
            detect_column_type(&values, ts)
        })
        .collect()
}

fn detect_column_type(values: &[&[u8]], ts: &TimestampParser) -> ColumnType {
    if values.is_empty() {
        return ColumnType::Str;
    }
    // Timestamp comes first: under a configured format a timestamp can
    // be all digits and would otherwise be taken for a long.
    if values.iter().all(|v| ts.parse(v).is_some()) {
        return ColumnType::Timestamp;
    }
    if values.iter().all(|v| parse_long(v).is_some()) {
        return ColumnType::Long;
    }
    if values.iter().all(|v| parse_double(v).is_some()) {
        return ColumnType::Double;
    }
    let max_len = values.iter().map(|v| v.len()).max().unwrap_or(0);
    let mut distinct: Vec<&[u8]> = values.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    if max_len <= MAX_SYMBOL_LEN && distinct.len() * 2 <= values.len() {
        ColumnType::Symbol
    } else {
        ColumnType::Str
    }
}

/// The first record is a header when none of its values parse under the
/// types detected from the body; a single first-record value that does
/// parse under its column's type keeps the record as data. String-typed
/// columns accept anything and carry no signal, so at least one column
/// must be non-string-typed for a header to be declared at all.
fn header_disagrees(first: &ByteRecord, body_types: &[ColumnType], ts: &TimestampParser) -> bool {
    let mut typed_columns = 0usize;
    for (i, ty) in body_types.iter().enumerate() {
        let value = first.get(i).unwrap_or(b"");
        let parses = match ty {
            ColumnType::Long => parse_long(value).is_some(),
            ColumnType::Double => parse_double(value).is_some(),
            ColumnType::Timestamp => ts.parse(value).is_some(),
            _ => continue,
        };
        typed_columns += 1;
        if parses {
            return false;
        }
    }
    typed_columns > 0
}

/// Column names become file names; anything outside `[A-Za-z0-9_]`
/// is replaced.
fn sanitize_name(bytes: &[u8], index: usize) -> String {
    let name: String = String::from_utf8_lossy(bytes)
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        format!("f{}", index)
    } else {
        name
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::LoadRequest;
    use crate::partition::PartitionBy;

    fn request() -> LoadRequest {
        LoadRequest::builder("t", "t.csv")
            .partition_by(PartitionBy::Day)
            .build()
            .unwrap()
    }

    fn schema_of(sample: &[u8], request: &LoadRequest) -> crate::Result<Schema> {
        let parser = TimestampParser::new(request.timestamp_format.as_deref());
        let records = sample_records(sample, false, b',', 100).unwrap();
        detect_schema(&records, request, &parser)
    }

    #[test]
    fn test_detect_delimiter_comma() {
        assert_eq!(detect_delimiter(b"a,b,c\nd,e,f\n").unwrap(), b',');
    }

    #[test]
    fn test_detect_delimiter_prefers_consistent() {
        // Semicolon count is identical on both lines, comma count is not.
        assert_eq!(detect_delimiter(b"a;b,c,,\nd;e\n").unwrap(), b';');
    }

    #[test]
    fn test_detect_delimiter_none() {
        assert!(matches!(
            detect_delimiter(b"justoneword\nandanother\n"),
            Err(LoadError::DelimiterNotDetected)
        ));
    }

    #[test]
    fn test_detects_header_and_types() {
        let schema = schema_of(
            b"ts,price,qty\n2020-01-01T00:00:00Z,1.5,10\n2020-01-02T00:00:00Z,2.5,20\n",
            &request(),
        )
        .unwrap();
        assert!(schema.has_header());
        assert_eq!(schema.timestamp_index(), 0);
        let types: Vec<ColumnType> = schema.columns().iter().map(|c| c.ty).collect();
        assert_eq!(
            types,
            vec![ColumnType::Timestamp, ColumnType::Double, ColumnType::Long]
        );
        assert_eq!(schema.columns()[1].name, "price");
    }

    #[test]
    fn test_partially_parseable_first_record_is_data() {
        // "id" fails as a long, but "3.14" parses as a double and the
        // last value as a timestamp, so the first record stays data and
        // the mixed first column degrades to a string type.
        let schema = schema_of(
            b"id,3.14,2020-01-01T00:00:00Z\n\
              1,2.71,2020-01-02T00:00:00Z\n\
              2,1.41,2020-01-03T00:00:00Z\n",
            &request(),
        )
        .unwrap();
        assert!(!schema.has_header());
        assert_eq!(schema.columns()[0].name, "f0");
        assert_eq!(schema.columns()[0].ty, ColumnType::Str);
        assert_eq!(schema.columns()[1].ty, ColumnType::Double);
        assert_eq!(schema.timestamp_index(), 2);
    }

    #[test]
    fn test_all_string_columns_never_declare_a_header() {
        let request = LoadRequest::builder("t", "t.csv")
            .partition_by(PartitionBy::Day)
            .timestamp_column("f1")
            .build()
            .unwrap();
        // Every column is string-typed from the body, so the first
        // record carries no header signal.
        let schema = schema_of(
            b"alpha,2020-01-01T00:00:00Z\nbravo,2020-01-02T00:00:00Z\n",
            &request,
        );
        // f1 is a timestamp, so only f0 is string-typed; force the case
        // by checking header_disagrees directly on string-only types.
        assert!(schema.is_ok());
        let first = csv::ByteRecord::from(vec!["name", "note"]);
        let parser = TimestampParser::new(None);
        assert!(!header_disagrees(
            &first,
            &[ColumnType::Str, ColumnType::Str],
            &parser
        ));
    }

    #[test]
    fn test_headerless_gets_generated_names() {
        let schema = schema_of(
            b"2020-01-01T00:00:00Z,1\n2020-01-02T00:00:00Z,2\n",
            &request(),
        )
        .unwrap();
        assert!(!schema.has_header());
        assert_eq!(schema.columns()[0].name, "f0");
        assert_eq!(schema.columns()[1].ty, ColumnType::Long);
    }

    #[test]
    fn test_no_timestamp_column_is_an_error() {
        assert!(matches!(
            schema_of(b"1,2\n3,4\n", &request()),
            Err(LoadError::NoTimestampColumn)
        ));
    }

    #[test]
    fn test_named_timestamp_column() {
        let request = LoadRequest::builder("t", "t.csv")
            .partition_by(PartitionBy::Day)
            .timestamp_column("when")
            .build()
            .unwrap();
        let schema = schema_of(
            b"id,when\n1,2020-01-01T00:00:00Z\n2,2020-01-02T00:00:00Z\n",
            &request,
        )
        .unwrap();
        assert_eq!(schema.timestamp_index(), 1);
    }

    #[test]
    fn test_column_type_override() {
        let request = LoadRequest::builder("t", "t.csv")
            .partition_by(PartitionBy::Day)
            .column_type("sym", ColumnType::Symbol)
            .build()
            .unwrap();
        let schema = schema_of(
            b"ts,sym\n2020-01-01T00:00:00Z,abc\n2020-01-02T00:00:00Z,xyz\n",
            &request,
        )
        .unwrap();
        assert_eq!(schema.columns()[1].ty, ColumnType::Symbol);
    }

    #[test]
    fn test_timestamp_parser_formats() {
        let parser = TimestampParser::new(None);
        assert!(parser.parse(b"2020-01-01T00:00:00Z").is_some());
        assert!(parser.parse(b"2020-01-01T00:00:00.123456Z").is_some());
        assert!(parser.parse(b"2020-01-01 12:30:00").is_some());
        assert!(parser.parse(b"2020-01-01").is_some());
        assert!(parser.parse(b"not a time").is_none());

        let custom = TimestampParser::new(Some("%d/%m/%Y %H:%M"));
        assert!(custom.parse(b"31/12/2020 23:59").is_some());
        assert!(custom.parse(b"2020-01-01T00:00:00Z").is_none());
    }

    #[test]
    fn test_all_digit_timestamps_beat_longs() {
        // Under a %Y%m%d format the values are both valid longs and
        // valid timestamps; the timestamp check runs first.
        let values: Vec<&[u8]> = vec![b"20200101", b"20200102"];
        let compact = TimestampParser::new(Some("%Y%m%d"));
        assert_eq!(detect_column_type(&values, &compact), ColumnType::Timestamp);
        // Without that format the same bytes are plain longs.
        let default = TimestampParser::new(None);
        assert_eq!(detect_column_type(&values, &default), ColumnType::Long);
    }

    #[test]
    fn test_symbol_heuristic() {
        let parser = TimestampParser::new(None);
        let repetitive: Vec<&[u8]> = vec![b"aa", b"bb", b"aa", b"bb", b"aa", b"bb"];
        assert_eq!(
            detect_column_type(&repetitive, &parser),
            ColumnType::Symbol
        );
        let unique: Vec<&[u8]> = vec![b"aa", b"bb", b"cc", b"dd"];
        assert_eq!(detect_column_type(&unique, &parser), ColumnType::Str);
    }
}
