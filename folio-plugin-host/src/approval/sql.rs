//! Minimal parameterized-statement executor

use super::store::StoreError;
use async_trait::async_trait;

/// SQL dialect of the backing database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `n`
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite | Dialect::MySql => "?".to_string(),
        }
    }

    /// Comma-separated placeholders for parameters `1..=count`
    pub fn placeholders(&self, count: usize) -> String {
        (1..=count)
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `INSERT` that leaves an existing row with the same key untouched
    pub fn insert_if_absent(&self, table: &str, columns: &[&str]) -> String {
        let values = self.placeholders(columns.len());
        let columns = columns.join(", ");
        match self {
            Dialect::MySql => format!("INSERT IGNORE INTO {} ({}) VALUES ({})", table, columns, values),
            Dialect::Sqlite | Dialect::Postgres => format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
                table, columns, values
            ),
        }
    }

    /// Column type used for flags
    pub fn bool_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BOOLEAN",
            Dialect::Sqlite => "INTEGER",
            Dialect::MySql => "TINYINT(1)",
        }
    }

    /// Column type used for short identifiers
    pub fn text_type(&self) -> &'static str {
        match self {
            Dialect::MySql => "VARCHAR(191)",
            Dialect::Sqlite | Dialect::Postgres => "TEXT",
        }
    }
}

/// Statement parameter or result column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Flags come back as integers from databases without a boolean type
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        SqlValue::Integer(i)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Bool(b)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// Runs parameterized statements against the host's database
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run a statement, returning the number of affected rows
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;

    /// Run a query, returning every row as positional values
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, StoreError>;

    /// Release the connection
    async fn close(&self) {}
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::{Dialect, SqlValue, StatementExecutor};
    use crate::approval::store::StoreError;
    use async_trait::async_trait;
    use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
    use sqlx::query::Query;
    use sqlx::{Row, Sqlite, ValueRef};

    /// [`StatementExecutor`] over an sqlx SQLite pool
    #[derive(Debug, Clone)]
    pub struct SqliteExecutor {
        pool: SqlitePool,
    }

    impl SqliteExecutor {
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }

        /// Open a pool from a URL such as `sqlite://folio.db?mode=rwc`
        pub async fn connect(url: &str) -> Result<Self, StoreError> {
            let pool = SqlitePoolOptions::new()
                .max_connections(4)
                .connect(url)
                .await
                .map_err(StoreError::backend)?;
            Ok(Self::new(pool))
        }

        /// Single-connection in-memory database
        pub async fn in_memory() -> Result<Self, StoreError> {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .map_err(StoreError::backend)?;
            Ok(Self::new(pool))
        }

        pub fn pool(&self) -> &SqlitePool {
            &self.pool
        }
    }

    fn bind<'q>(
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
        params: &'q [SqlValue],
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        for param in params {
            query = match param {
                SqlValue::Null => query.bind(None::<i64>),
                SqlValue::Bool(b) => query.bind(*b),
                SqlValue::Integer(i) => query.bind(*i),
                SqlValue::Text(s) => query.bind(s.as_str()),
            };
        }
        query
    }

    fn decode(row: &SqliteRow) -> Result<Vec<SqlValue>, StoreError> {
        let mut values = Vec::with_capacity(row.len());
        for i in 0..row.len() {
            let raw = row.try_get_raw(i).map_err(StoreError::backend)?;
            if raw.is_null() {
                values.push(SqlValue::Null);
            } else if let Ok(v) = row.try_get::<i64, _>(i) {
                values.push(SqlValue::Integer(v));
            } else {
                let v = row.try_get::<String, _>(i).map_err(StoreError::backend)?;
                values.push(SqlValue::Text(v));
            }
        }
        Ok(values)
    }

    #[async_trait]
    impl StatementExecutor for SqliteExecutor {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
            let result = bind(sqlx::query(sql), params)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
            Ok(result.rows_affected())
        }

        async fn query(
            &self,
            sql: &str,
            params: &[SqlValue],
        ) -> Result<Vec<Vec<SqlValue>>, StoreError> {
            let rows = bind(sqlx::query(sql), params)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::backend)?;
            rows.iter().map(decode).collect()
        }

        async fn close(&self) {
            self.pool.close().await;
        }
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExecutor;
