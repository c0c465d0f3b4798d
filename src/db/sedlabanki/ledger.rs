use duckdb::{params_from_iter, types::Value, AccessMode, Connection};
use itertools::Itertools;
use log::info;
use thiserror::Error;

use super::grid::LabeledSeries;
use super::schema::{Label, LedgerSchema, RowLabels};
use crate::utils::lib_duckdb::{open_with_retry, WithRetry};
use crate::utils::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

/// Append-only table with one row per (labels, date, value).  There is no
/// uniqueness constraint, loading the same release twice duplicates it.
pub struct Ledger {
    conn: Connection,
    table: String,
    columns: Vec<Label>,
}

impl Ledger {
    pub fn open(
        duckdb_path: &str,
        schema: &LedgerSchema,
        retry: RetryPolicy,
    ) -> Result<Ledger, LedgerError> {
        let conn = open_with_retry(duckdb_path, retry, AccessMode::ReadWrite)?;
        Ledger::with_connection(conn, schema, retry)
    }

    pub fn in_memory(schema: &LedgerSchema) -> Result<Ledger, LedgerError> {
        Ledger::with_connection(Connection::open_in_memory()?, schema, RetryPolicy::none())
    }

    fn with_connection(
        conn: Connection,
        schema: &LedgerSchema,
        retry: RetryPolicy,
    ) -> Result<Ledger, LedgerError> {
        let ledger = Ledger {
            conn,
            table: schema.table.clone(),
            columns: schema.labels.columns(),
        };
        ledger.conn.execute_batch_with_retry(&ledger.create_table_sql(), retry)?;
        Ok(ledger)
    }

    fn create_table_sql(&self) -> String {
        let labels = self
            .columns
            .iter()
            .map(|c| format!("    {} VARCHAR,\n", c.column()))
            .join("");
        format!(
            r#"
CREATE SEQUENCE IF NOT EXISTS {table}_id_seq START 1;
CREATE TABLE IF NOT EXISTS {table} (
    id BIGINT DEFAULT nextval('{table}_id_seq') PRIMARY KEY,
    "date" VARCHAR,
    institute VARCHAR NOT NULL,
{labels}    value BIGINT
);
"#,
            table = self.table,
            labels = labels,
        )
    }

    fn insert_sql(&self) -> String {
        let columns = self.columns.iter().map(|c| c.column()).collect_vec();
        let names = ["\"date\"", "institute"]
            .into_iter()
            .chain(columns.iter().copied())
            .chain(["value"])
            .join(", ");
        let placeholders = vec!["?"; columns.len() + 3].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({});",
            self.table, names, placeholders
        )
    }

    fn label_values(&self, labels: &RowLabels) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| match labels.get(*c) {
                Some(v) => Value::Text(v.to_string()),
                None => Value::Null,
            })
            .collect()
    }

    /// Insert every point in one transaction.  Return the number of rows inserted.
    pub fn load(&mut self, series: &[LabeledSeries]) -> Result<usize, LedgerError> {
        let sql = self.insert_sql();
        let rows: Vec<Vec<Value>> = series
            .iter()
            .flat_map(|s| {
                let labels = self.label_values(&s.labels);
                s.points.iter().map(move |(date, value)| {
                    let mut row = Vec::with_capacity(labels.len() + 3);
                    row.push(date.clone().map_or(Value::Null, Value::Text));
                    row.push(Value::Text(s.labels.institute.clone()));
                    row.extend(labels.iter().cloned());
                    row.push(value.map_or(Value::Null, Value::BigInt));
                    row
                })
            })
            .collect();

        let tx = self.conn.transaction()?;
        let mut n = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                n += stmt.execute(params_from_iter(row))?;
            }
        }
        tx.commit()?;
        info!("inserted {} rows into {}", n, self.table);
        Ok(n)
    }

    pub fn row_count(&self) -> Result<usize, LedgerError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {};", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// The (date, value) pairs stored for these labels, in insertion order.
    pub fn get_series(
        &self,
        labels: &RowLabels,
    ) -> Result<Vec<(Option<String>, Option<i64>)>, LedgerError> {
        let filters = self
            .columns
            .iter()
            .map(|c| format!("\nAND {} IS NOT DISTINCT FROM ?", c.column()))
            .join("");
        let query = format!(
            r#"
SELECT "date", value
FROM {}
WHERE institute = ?{}
ORDER BY id;
"#,
            self.table, filters
        );
        let mut params = vec![Value::Text(labels.institute.clone())];
        params.extend(self.label_values(labels));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((row.get::<usize, Option<String>>(0)?, row.get::<usize, Option<i64>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
