//! Tabular payloads and the bulk writer that lands them in SQLite.
//!
//! A payload is either a whole frame (an arrow [`RecordBatch`]) or a single named
//! [`Series`]. Column types are taken from the arrow schema and declared on the
//! SQLite table; SQLite's affinity rules take it from there.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Int64Array};
use arrow::compute::{cast_with_options, concat_batches, CastOptions};
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType as ArrowType, Field, Float64Type, Int64Type, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use crate::config::{CsvReadOptions, IfExists};
use crate::error::{BridgeError, Result};
use crate::value::Value;

/// Column name used for a series' row labels.
pub const INDEX_COLUMN: &str = "index";

/// A single named column, optionally carrying its own row labels.
#[derive(Debug, Clone)]
pub struct Series {
    name: String,
    values: ArrayRef,
    index: Option<ArrayRef>,
}

impl Series {
    pub fn new(name: impl Into<String>, values: ArrayRef) -> Self {
        Self {
            name: name.into(),
            values,
            index: None,
        }
    }

    /// Replace the positional `0..n` labels with explicit ones.
    pub fn with_index(mut self, index: ArrayRef) -> Self {
        self.index = Some(index);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn into_batch(self) -> Result<RecordBatch> {
        let len = self.values.len();
        let index = match self.index {
            Some(index) => {
                if index.len() != len {
                    return Err(BridgeError::UnsupportedPayload(format!(
                        "series '{}' has {} values but {} index labels",
                        self.name,
                        len,
                        index.len()
                    )));
                }
                index
            }
            None => Arc::new(Int64Array::from_iter_values(0..len as i64)) as ArrayRef,
        };
        let schema = Schema::new(vec![
            Field::new(INDEX_COLUMN, index.data_type().clone(), true),
            Field::new(&self.name, self.values.data_type().clone(), true),
        ]);
        Ok(RecordBatch::try_new(Arc::new(schema), vec![index, self.values])?)
    }
}

/// In-memory data handed to [`crate::sqlite::load_payload_to_table`].
#[derive(Debug, Clone)]
pub enum Payload {
    /// Multi-column table; written without an index column.
    Frame(RecordBatch),
    /// Single named column; written with its index labels.
    Series(Series),
}

impl Payload {
    pub fn num_rows(&self) -> usize {
        match self {
            Payload::Frame(batch) => batch.num_rows(),
            Payload::Series(series) => series.len(),
        }
    }

    pub(crate) fn into_batch(self) -> Result<RecordBatch> {
        match self {
            Payload::Frame(batch) => Ok(batch),
            Payload::Series(series) => series.into_batch(),
        }
    }
}

impl From<RecordBatch> for Payload {
    fn from(batch: RecordBatch) -> Self {
        Payload::Frame(batch)
    }
}

impl From<Series> for Payload {
    fn from(series: Series) -> Self {
        Payload::Series(series)
    }
}

/// Declared SQLite column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Real,
    Text,
    Blob,
    Timestamp,
    Date,
}

impl DataType {
    pub fn from_arrow(data_type: &ArrowType) -> Self {
        match data_type {
            ArrowType::Boolean => DataType::Integer,
            t if t.is_integer() => DataType::Integer,
            t if t.is_floating() => DataType::Real,
            ArrowType::Binary | ArrowType::LargeBinary => DataType::Blob,
            ArrowType::Date32 | ArrowType::Date64 => DataType::Date,
            ArrowType::Timestamp(_, _) => DataType::Timestamp,
            _ => DataType::Text,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Real => "REAL",
            DataType::Text => "TEXT",
            DataType::Blob => "BLOB",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Date => "DATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    pub fn from_schema(name: &str, schema: &Schema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|field| ColumnDefinition {
                name: field.name().clone(),
                data_type: DataType::from_arrow(field.data_type()),
            })
            .collect();
        Self {
            name: name.to_string(),
            columns,
        }
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_identifier(&c.name), c.data_type.as_sql()))
            .collect();
        format!(
            "CREATE TABLE {} ({});",
            quote_identifier(&self.name),
            columns.join(", ")
        )
    }

    pub fn insert_sql(&self) -> String {
        let names: Vec<String> = self
            .columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect();
        let placeholders: Vec<String> = (1..=self.columns.len())
            .map(|i| format!("?{i}"))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({});",
            quote_identifier(&self.name),
            names.join(", "),
            placeholders.join(", ")
        )
    }
}

/// Quote an identifier for generated DDL/DML.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Timestamp rendering for temporal payload columns: space separated, fraction
/// only when present.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Read a whole CSV file into one batch, inferring column types.
///
/// Numeric and boolean columns keep their inferred types. Columns that merely
/// look like dates or times are read as text so they land exactly as written.
pub fn read_csv(path: impl AsRef<Path>, options: &CsvReadOptions) -> Result<RecordBatch> {
    let path = path.as_ref();
    let format = options.to_format()?;

    let file = File::open(path).map_err(|e| BridgeError::io(path, e))?;
    let (inferred, _) = format.infer_schema(BufReader::new(file), options.max_read_records)?;
    if inferred.fields().is_empty() {
        return Err(BridgeError::EmptyCsv(path.to_path_buf()));
    }
    let schema = Arc::new(keep_temporal_as_text(&inferred));

    let file = File::open(path).map_err(|e| BridgeError::io(path, e))?;
    let reader = ReaderBuilder::new(Arc::clone(&schema))
        .with_format(format)
        .build(file)?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

fn keep_temporal_as_text(schema: &Schema) -> Schema {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| {
            if field.data_type().is_temporal() {
                Field::new(field.name(), ArrowType::Utf8, field.is_nullable())
            } else {
                field.as_ref().clone()
            }
        })
        .collect();
    Schema::new(fields)
}

/// Convert one arrow column into SQLite values.
pub(crate) fn column_values(array: &ArrayRef) -> Result<Vec<Value>> {
    let values = match array.data_type() {
        ArrowType::Null => vec![Value::Null; array.len()],
        ArrowType::Boolean => array
            .as_boolean()
            .iter()
            .map(|v| v.map_or(Value::Null, |b| Value::Integer(i64::from(b))))
            .collect(),
        t if t.is_integer() => {
            let widened = cast_with_options(array, &ArrowType::Int64, &checked_cast())?;
            widened
                .as_primitive::<Int64Type>()
                .iter()
                .map(|v| v.map_or(Value::Null, Value::Integer))
                .collect()
        }
        t if t.is_floating() => {
            let widened = cast_with_options(array, &ArrowType::Float64, &checked_cast())?;
            widened
                .as_primitive::<Float64Type>()
                .iter()
                .map(|v| v.map_or(Value::Null, Value::Real))
                .collect()
        }
        ArrowType::Utf8 => array
            .as_string::<i32>()
            .iter()
            .map(|v| v.map_or(Value::Null, Value::from))
            .collect(),
        ArrowType::LargeUtf8 => array
            .as_string::<i64>()
            .iter()
            .map(|v| v.map_or(Value::Null, Value::from))
            .collect(),
        ArrowType::Binary => array
            .as_binary::<i32>()
            .iter()
            .map(|v| v.map_or(Value::Null, |b| Value::Blob(b.to_vec())))
            .collect(),
        ArrowType::LargeBinary => array
            .as_binary::<i64>()
            .iter()
            .map(|v| v.map_or(Value::Null, |b| Value::Blob(b.to_vec())))
            .collect(),
        _ => {
            let options = FormatOptions::default()
                .with_timestamp_format(Some(TIMESTAMP_FORMAT))
                .with_timestamp_tz_format(Some(TIMESTAMP_FORMAT));
            let formatter = ArrayFormatter::try_new(array.as_ref(), &options)?;
            (0..array.len())
                .map(|i| {
                    if array.is_null(i) {
                        Value::Null
                    } else {
                        Value::Text(formatter.value(i).to_string())
                    }
                })
                .collect()
        }
    };
    Ok(values)
}

/// Widening casts that fail on overflow instead of producing NULL.
fn checked_cast() -> CastOptions<'static> {
    CastOptions {
        safe: false,
        ..Default::default()
    }
}

/// Whether a table or view already holds `table` (names compare case-insensitively).
pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Written(usize),
    TableExists,
}

/// A batch converted to SQLite values, ready to insert.
struct PendingWrite {
    definition: TableDefinition,
    columns: Vec<Vec<Value>>,
    rows: usize,
}

impl PendingWrite {
    fn new(table: &str, batch: &RecordBatch) -> Result<Self> {
        let columns = batch
            .columns()
            .iter()
            .map(column_values)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            definition: TableDefinition::from_schema(table, &batch.schema()),
            columns,
            rows: batch.num_rows(),
        })
    }

    fn create(&self, conn: &Connection) -> Result<()> {
        let sql = self.definition.create_sql();
        debug!(%sql, "creating table");
        conn.execute_batch(&sql)?;
        Ok(())
    }

    fn insert(&self, conn: &Connection) -> Result<usize> {
        let mut stmt = conn.prepare(&self.definition.insert_sql())?;
        for row in 0..self.rows {
            stmt.execute(params_from_iter(self.columns.iter().map(|col| &col[row])))?;
        }
        Ok(self.rows)
    }
}

/// Create `table` from a batch. Table creation and every insert share one
/// transaction, so a failure part way leaves the database as it was.
pub(crate) fn write_batch(
    conn: &mut Connection,
    table: &str,
    batch: &RecordBatch,
    if_exists: IfExists,
) -> Result<WriteOutcome> {
    let pending = PendingWrite::new(table, batch)?;

    let tx = conn.transaction()?;
    if table_exists(&tx, table)? {
        match if_exists {
            IfExists::Fail => return Ok(WriteOutcome::TableExists),
            IfExists::Replace => {
                tx.execute_batch(&format!("DROP TABLE {};", quote_identifier(table)))?;
            }
        }
    }
    pending.create(&tx)?;
    let written = pending.insert(&tx)?;
    tx.commit()?;
    Ok(WriteOutcome::Written(written))
}

/// Append a batch to `table`, creating it first when absent. Same single
/// transaction as [`write_batch`].
pub(crate) fn append_batch(
    conn: &mut Connection,
    table: &str,
    batch: &RecordBatch,
) -> Result<usize> {
    let pending = PendingWrite::new(table, batch)?;

    let tx = conn.transaction()?;
    if !table_exists(&tx, table)? {
        pending.create(&tx)?;
    }
    let written = pending.insert(&tx)?;
    tx.commit()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BooleanArray, Float64Array, StringArray, TimestampSecondArray, UInt64Array};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn people() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("id", ArrowType::Int64, false),
            Field::new("name", ArrowType::Utf8, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("ada"), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn infers_csv_column_types() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "id,price,flag,name").unwrap();
        writeln!(tmp, "1,3.5,true,alpha").unwrap();
        writeln!(tmp, "2,4.25,false,beta").unwrap();

        let batch = read_csv(tmp.path(), &CsvReadOptions::default()).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &ArrowType::Int64);
        assert_eq!(schema.field(1).data_type(), &ArrowType::Float64);
        assert_eq!(schema.field(2).data_type(), &ArrowType::Boolean);
        assert_eq!(schema.field(3).data_type(), &ArrowType::Utf8);
    }

    #[test]
    fn honours_custom_delimiter() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "a;b").unwrap();
        writeln!(tmp, "1;x").unwrap();

        let options = CsvReadOptions {
            delimiter: b';',
            ..Default::default()
        };
        let batch = read_csv(tmp.path(), &options).unwrap();
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(1).name(), "b");
    }

    #[test]
    fn missing_csv_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_csv(dir.path().join("nope.csv"), &CsvReadOptions::default()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn maps_arrow_types_to_declared_sql_types() {
        assert_eq!(DataType::from_arrow(&ArrowType::Int32), DataType::Integer);
        assert_eq!(DataType::from_arrow(&ArrowType::UInt8), DataType::Integer);
        assert_eq!(DataType::from_arrow(&ArrowType::Boolean), DataType::Integer);
        assert_eq!(DataType::from_arrow(&ArrowType::Float32), DataType::Real);
        assert_eq!(DataType::from_arrow(&ArrowType::Utf8), DataType::Text);
        assert_eq!(DataType::from_arrow(&ArrowType::Binary), DataType::Blob);
        assert_eq!(DataType::from_arrow(&ArrowType::Date32), DataType::Date);
        assert_eq!(DataType::from_arrow(&ArrowType::Null), DataType::Text);
    }

    #[test]
    fn generated_sql_quotes_identifiers() {
        let def = TableDefinition::from_schema("my table", &people().schema());
        assert_eq!(
            def.create_sql(),
            r#"CREATE TABLE "my table" ("id" INTEGER, "name" TEXT);"#
        );
        assert_eq!(
            def.insert_sql(),
            r#"INSERT INTO "my table" ("id", "name") VALUES (?1, ?2);"#
        );
        assert_eq!(quote_identifier(r#"a"b"#), r#""a""b""#);
    }

    #[test]
    fn converts_columns_with_nulls() {
        let flags: ArrayRef = Arc::new(BooleanArray::from(vec![Some(true), None]));
        assert_eq!(
            column_values(&flags).unwrap(),
            vec![Value::Integer(1), Value::Null]
        );
        let reals: ArrayRef = Arc::new(Float64Array::from(vec![Some(0.5), None]));
        assert_eq!(
            column_values(&reals).unwrap(),
            vec![Value::Real(0.5), Value::Null]
        );
    }

    #[test]
    fn series_gets_positional_index() {
        let series = Series::new("score", Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0])));
        let batch = Payload::from(series).into_batch().unwrap();
        assert_eq!(batch.schema().field(0).name(), INDEX_COLUMN);
        assert_eq!(batch.schema().field(1).name(), "score");
        assert_eq!(
            column_values(batch.column(0)).unwrap(),
            vec![Value::Integer(0), Value::Integer(1), Value::Integer(2)]
        );
    }

    #[test]
    fn series_index_length_must_match() {
        let series = Series::new("x", Arc::new(Int64Array::from(vec![1, 2])))
            .with_index(Arc::new(Int64Array::from(vec![10])));
        assert!(matches!(
            Payload::from(series).into_batch(),
            Err(BridgeError::UnsupportedPayload(_))
        ));
    }

    #[test]
    fn fail_mode_leaves_existing_table_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        let batch = people();
        assert_eq!(
            write_batch(&mut conn, "people", &batch, IfExists::Fail).unwrap(),
            WriteOutcome::Written(2)
        );
        assert_eq!(
            write_batch(&mut conn, "people", &batch, IfExists::Fail).unwrap(),
            WriteOutcome::TableExists
        );
        assert_eq!(append_batch(&mut conn, "people", &batch).unwrap(), 2);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM people", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 4);

        write_batch(&mut conn, "people", &batch, IfExists::Replace).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM people", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn csv_dates_and_datetimes_stay_as_written() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "id,at,day").unwrap();
        writeln!(tmp, "1,2024-01-02 10:00:00,2024-01-02").unwrap();
        writeln!(tmp, "2,2024-03-04 05:06:07,2024-03-04").unwrap();

        let batch = read_csv(tmp.path(), &CsvReadOptions::default()).unwrap();
        assert_eq!(batch.schema().field(1).data_type(), &ArrowType::Utf8);
        assert_eq!(batch.schema().field(2).data_type(), &ArrowType::Utf8);
        assert_eq!(
            column_values(batch.column(1)).unwrap(),
            vec![
                Value::from("2024-01-02 10:00:00"),
                Value::from("2024-03-04 05:06:07")
            ]
        );
        assert_eq!(
            column_values(batch.column(2)).unwrap()[0],
            Value::from("2024-01-02")
        );
    }

    #[test]
    fn missing_value_markers_read_as_null() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "id,score,label").unwrap();
        writeln!(tmp, "1,NA,null").unwrap();
        writeln!(tmp, "2,3,N/A").unwrap();
        writeln!(tmp, "3,,x").unwrap();

        let batch = read_csv(tmp.path(), &CsvReadOptions::default()).unwrap();
        assert_eq!(batch.schema().field(1).data_type(), &ArrowType::Int64);
        assert_eq!(
            column_values(batch.column(1)).unwrap(),
            vec![Value::Null, Value::Integer(3), Value::Null]
        );
        assert_eq!(
            column_values(batch.column(2)).unwrap(),
            vec![Value::Null, Value::Null, Value::from("x")]
        );
    }

    #[test]
    fn null_tokens_can_be_switched_off() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "code").unwrap();
        writeln!(tmp, "NA").unwrap();

        let options = CsvReadOptions {
            null_tokens: Vec::new(),
            ..Default::default()
        };
        let batch = read_csv(tmp.path(), &options).unwrap();
        assert_eq!(column_values(batch.column(0)).unwrap(), vec![Value::from("NA")]);
    }

    #[test]
    fn unsigned_overflow_is_an_error() {
        let big: ArrayRef = Arc::new(UInt64Array::from(vec![1, u64::MAX]));
        assert!(matches!(column_values(&big), Err(BridgeError::Arrow(_))));

        let small: ArrayRef = Arc::new(UInt64Array::from(vec![1, 2]));
        assert_eq!(
            column_values(&small).unwrap(),
            vec![Value::Integer(1), Value::Integer(2)]
        );
    }

    #[test]
    fn timestamps_render_space_separated() {
        // 2024-01-02 10:00:00 UTC
        let stamps: ArrayRef = Arc::new(TimestampSecondArray::from(vec![1_704_189_600]));
        assert_eq!(
            column_values(&stamps).unwrap(),
            vec![Value::from("2024-01-02 10:00:00")]
        );
    }

    #[test]
    fn existing_names_match_case_insensitively() {
        let mut conn = Connection::open_in_memory().unwrap();
        let batch = people();
        write_batch(&mut conn, "people", &batch, IfExists::Fail).unwrap();
        assert_eq!(
            write_batch(&mut conn, "People", &batch, IfExists::Fail).unwrap(),
            WriteOutcome::TableExists
        );

        conn.execute_batch("CREATE VIEW roster AS SELECT name FROM people;")
            .unwrap();
        assert!(table_exists(&conn, "ROSTER").unwrap());
        assert_eq!(
            write_batch(&mut conn, "roster", &batch, IfExists::Fail).unwrap(),
            WriteOutcome::TableExists
        );
    }
}
