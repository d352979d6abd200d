//! The database bridge: one connection per call, one unit of work, then close.
//!
//! Table names are spliced into SQL text as given. The caller is trusted.

use std::fs;
use std::path::Path;

use rusqlite::{Batch, Connection, Statement};
use tracing::{debug, info, warn};

use crate::config::{CreateTableOptions, IfExists};
use crate::error::{BridgeError, Result};
use crate::frame::{append_batch, read_csv, write_batch, Payload, WriteOutcome};
use crate::value::{ResultSet, Row, Value};

/// How a [`create_csv_table`] call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CsvLoadOutcome {
    /// The CSV file does not exist; the database was never opened.
    SourceMissing,
    /// Rows were written and the table's first rows read back.
    Loaded {
        rows_written: usize,
        preview: ResultSet,
    },
    /// The table already existed and overwrite was off; nothing was written.
    TableExists { preview: ResultSet },
}

impl CsvLoadOutcome {
    pub fn preview(&self) -> Option<&ResultSet> {
        match self {
            CsvLoadOutcome::SourceMissing => None,
            CsvLoadOutcome::Loaded { preview, .. } | CsvLoadOutcome::TableExists { preview } => {
                Some(preview)
            }
        }
    }
}

/// Open (creating if absent) the database file. The handle closes on drop.
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    info!("Connected to SQLite database at '{}'.", db_path.display());
    Ok(conn)
}

/// Load a CSV file into `table_name`, then echo back its first five rows.
pub fn create_csv_table(
    csv_path: impl AsRef<Path>,
    db_path: impl AsRef<Path>,
    table_name: &str,
    overwrite: bool,
) -> Result<CsvLoadOutcome> {
    create_csv_table_with(
        csv_path,
        db_path,
        table_name,
        &CreateTableOptions::new(overwrite),
    )
}

pub fn create_csv_table_with(
    csv_path: impl AsRef<Path>,
    db_path: impl AsRef<Path>,
    table_name: &str,
    options: &CreateTableOptions,
) -> Result<CsvLoadOutcome> {
    let csv_path = csv_path.as_ref();
    let batch = match read_csv(csv_path, &options.csv) {
        Ok(batch) => batch,
        Err(err) if err.is_not_found() => {
            warn!("Error: The file '{}' was not found.", csv_path.display());
            return Ok(CsvLoadOutcome::SourceMissing);
        }
        Err(err) => return Err(err),
    };
    info!("CSV file '{}' located successfully.", csv_path.display());

    let mut conn = open_connection(db_path.as_ref())?;
    let if_exists = if options.overwrite {
        IfExists::Replace
    } else {
        IfExists::Fail
    };
    let written = match write_batch(&mut conn, table_name, &batch, if_exists)? {
        WriteOutcome::Written(rows) => {
            info!("Data loaded into table '{table_name}' successfully.");
            Some(rows)
        }
        WriteOutcome::TableExists => {
            warn!("'{table_name}' table already exists. Data loading failed.");
            None
        }
    };

    let preview = fetch_all(
        &conn,
        &format!("SELECT * FROM {table_name} LIMIT {};", options.preview_rows),
    )?;
    info!("First {} rows of '{table_name}':", options.preview_rows);
    for row in preview.iter() {
        info!("{row}");
    }

    Ok(match written {
        Some(rows_written) => CsvLoadOutcome::Loaded {
            rows_written,
            preview,
        },
        None => CsvLoadOutcome::TableExists { preview },
    })
}

/// Append a frame or series to `table_name`, creating the table if needed.
/// Returns the number of rows written.
pub fn load_payload_to_table(
    payload: impl Into<Payload>,
    db_path: impl AsRef<Path>,
    table_name: &str,
) -> Result<usize> {
    let batch = payload.into().into_batch()?;
    let mut conn = open_connection(db_path.as_ref())?;

    let rows = append_batch(&mut conn, table_name, &batch)?;
    info!("Added {rows} entries to '{table_name}'.");
    Ok(rows)
}

/// Run one SQL statement verbatim and fetch every row it produces.
///
/// Returns `None` when the statement yields no rows. Text holding more than one
/// statement is rejected before anything runs.
pub fn query_db(sql: &str, db_path: impl AsRef<Path>) -> Result<Option<ResultSet>> {
    let conn = open_connection(db_path.as_ref())?;
    let results = fetch_all(&conn, sql)?.non_empty();
    if let Some(results) = &results {
        info!("Query returned {} results.", results.len());
    }
    Ok(results)
}

/// Run every statement of a script file in order.
///
/// The result is the row set of the script's last statement when that statement
/// is a query that returned rows, otherwise `None`. Rows of earlier statements
/// are stepped through and dropped.
pub fn execute_sql_script(
    script_path: impl AsRef<Path>,
    db_path: impl AsRef<Path>,
) -> Result<Option<ResultSet>> {
    let script_path = script_path.as_ref();
    let script =
        fs::read_to_string(script_path).map_err(|e| BridgeError::io(script_path, e))?;
    info!("SQL script '{}' loaded successfully.", script_path.display());

    let conn = open_connection(db_path.as_ref())?;
    Ok(run_script(&conn, &script)?.and_then(ResultSet::non_empty))
}

/// List every table in the database, in catalog order.
pub fn print_tables(db_path: impl AsRef<Path>) -> Result<Vec<String>> {
    let catalog = query_db("SELECT name FROM sqlite_schema WHERE type='table';", db_path)?;
    let tables: Vec<String> = catalog
        .map(|results| {
            results
                .into_iter()
                .filter_map(|row| match row.into_values().into_iter().next() {
                    Some(Value::Text(name)) => Some(name),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    info!("Tables found:");
    for table in &tables {
        info!("{table}");
    }
    Ok(tables)
}

/// Drop `table_name` if it exists.
pub fn delete_table(db_path: impl AsRef<Path>, table_name: &str) -> Result<()> {
    query_db(&format!("DROP TABLE IF EXISTS {table_name};"), db_path)?;
    info!("Table '{table_name}' deleted successfully if it existed.");
    Ok(())
}

fn fetch_all(conn: &Connection, sql: &str) -> Result<ResultSet> {
    debug!(%sql, "executing statement");
    let mut batch = Batch::new(conn, sql);
    let Some(mut stmt) = batch.next()? else {
        return Ok(ResultSet::default());
    };
    if batch.next()?.is_some() {
        return Err(BridgeError::MultipleStatements(sql.to_string()));
    }
    collect_rows(&mut stmt)
}

fn collect_rows(stmt: &mut Statement<'_>) -> Result<ResultSet> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut collected = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(Value::from(row.get_ref(idx)?));
        }
        collected.push(Row::from(values));
    }
    Ok(ResultSet::new(columns, collected))
}

/// Step through each statement of `script`. Yields the final statement's rows
/// when it returns columns, `None` when it does not.
fn run_script(conn: &Connection, script: &str) -> Result<Option<ResultSet>> {
    let mut batch = Batch::new(conn, script);
    let mut last = None;
    while let Some(mut stmt) = batch.next()? {
        last = if stmt.column_count() > 0 {
            Some(collect_rows(&mut stmt)?)
        } else {
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
            None
        };
    }
    Ok(last)
}
