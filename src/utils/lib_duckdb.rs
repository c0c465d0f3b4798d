use duckdb::{AccessMode, Config, Connection};

use super::retry::RetryPolicy;

pub trait WithRetry {
    /// Use this function for DDL that may collide with another process
    /// holding the database file.
    fn execute_batch_with_retry(&self, sql: &str, retry: RetryPolicy) -> Result<(), duckdb::Error>;
}

impl WithRetry for Connection {
    fn execute_batch_with_retry(&self, sql: &str, retry: RetryPolicy) -> Result<(), duckdb::Error> {
        retry.run(|| self.execute_batch(sql), |_| true)
    }
}

/// Open a DuckDB connection, waiting for a lock held by another process.
pub fn open_with_retry(
    duckdb_path: &str,
    retry: RetryPolicy,
    access_mode: AccessMode,
) -> Result<Connection, duckdb::Error> {
    retry.run(
        || {
            let config = Config::default().access_mode(same_mode(&access_mode))?;
            Connection::open_with_flags(duckdb_path, config)
        },
        |_| true,
    )
}

// AccessMode isn't Clone, and each attempt needs its own.
fn same_mode(mode: &AccessMode) -> AccessMode {
    match mode {
        AccessMode::Automatic => AccessMode::Automatic,
        AccessMode::ReadOnly => AccessMode::ReadOnly,
        AccessMode::ReadWrite => AccessMode::ReadWrite,
    }
}
