//! SQLite convenience layer for CSV and tabular data.
//!
//! # Intention
//!
//! - Load CSV files and in-memory frames into SQLite tables.
//! - Run ad-hoc queries and scripts, list tables, drop tables.
//! - Each call opens its own connection and closes it before returning.
//!
//! # Architectural Boundaries
//!
//! - Only SQLite/database glue belongs here.
//! - No pooling, migrations, query building or validation.

pub mod config;
pub mod error;
pub mod frame;
pub mod sqlite;
pub mod value;

pub use config::{CreateTableOptions, CsvReadOptions, IfExists};
pub use error::{BridgeError, Result};
pub use frame::{read_csv, Payload, Series};
pub use sqlite::{
    create_csv_table, create_csv_table_with, delete_table, execute_sql_script,
    load_payload_to_table, print_tables, query_db, CsvLoadOutcome,
};
pub use value::{ResultSet, Row, Value};
