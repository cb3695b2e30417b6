//! Approval storage
//!
//! Provides trait-based approval storage so the host can keep approvals in
//! its own database.

use super::sql::{SqlValue, StatementExecutor};
use crate::hooks::HookKey;
use async_trait::async_trait;
use folio_plugin_api::HookEvent;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Name of the table holding hook registrations
pub const HOOKS_TABLE: &str = "plugin_hooks";

/// Error type for approval store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Approval store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Hook not registered: {0}")]
    NotFound(String),

    #[error("Malformed row in {table}: {reason}")]
    Malformed { table: &'static str, reason: String },
}

impl StoreError {
    /// Wrap a backend error
    pub fn backend(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(e))
    }
}

/// Persisted hook registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredHook {
    pub plugin: String,
    pub event: HookEvent,
    pub table: String,
    pub priority: i32,
    pub approved: bool,
    /// RFC 3339 time of the last approval change
    pub approved_at: Option<String>,
    /// Identity behind the last approval change
    pub approved_by: Option<String>,
}

impl StoredHook {
    pub fn key(&self) -> HookKey {
        HookKey::new(self.plugin.clone(), self.event, self.table.clone())
    }
}

/// Trait for approval storage
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Create the backing table if it does not exist
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Persist a hook if absent and return its approval flag
    async fn upsert_hook(&self, key: &HookKey, priority: i32) -> Result<bool, StoreError>;

    /// Change a registered hook's approval flag
    async fn set_hook_approval(
        &self,
        key: &HookKey,
        approved: bool,
        actor: &str,
    ) -> Result<(), StoreError>;

    /// Every registered hook
    async fn list_hooks(&self) -> Result<Vec<StoredHook>, StoreError>;

    /// Forget every hook of a plugin
    async fn remove_plugin(&self, plugin: &str) -> Result<(), StoreError>;

    /// Release the backing handle
    async fn close(&self) {}
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

// ============================================================================
// In-memory store
// ============================================================================

/// Approval store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryApprovalStore {
    hooks: RwLock<BTreeMap<HookKey, StoredHook>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_hook(&self, key: &HookKey, priority: i32) -> Result<bool, StoreError> {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        let stored = hooks.entry(key.clone()).or_insert_with(|| StoredHook {
            plugin: key.plugin.clone(),
            event: key.event,
            table: key.table.clone(),
            priority,
            approved: false,
            approved_at: None,
            approved_by: None,
        });
        Ok(stored.approved)
    }

    async fn set_hook_approval(
        &self,
        key: &HookKey,
        approved: bool,
        actor: &str,
    ) -> Result<(), StoreError> {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        let stored = hooks
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        stored.approved = approved;
        stored.approved_at = Some(now_rfc3339());
        stored.approved_by = Some(actor.to_string());
        Ok(())
    }

    async fn list_hooks(&self) -> Result<Vec<StoredHook>, StoreError> {
        Ok(self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn remove_plugin(&self, plugin: &str) -> Result<(), StoreError> {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.plugin != plugin);
        Ok(())
    }
}

// ============================================================================
// SQL store
// ============================================================================

const COLUMNS: [&str; 7] = [
    "plugin_name",
    "event",
    "table_name",
    "priority",
    "approved",
    "approved_at",
    "approved_by",
];

/// Approval store over any [`StatementExecutor`]
#[derive(Debug)]
pub struct SqlApprovalStore<E> {
    executor: E,
}

impl<E: StatementExecutor> SqlApprovalStore<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn key_params(key: &HookKey) -> [SqlValue; 3] {
        [
            SqlValue::from(key.plugin.as_str()),
            SqlValue::from(key.event.as_str()),
            SqlValue::from(key.table.as_str()),
        ]
    }

    fn key_filter(&self, first: usize) -> String {
        let d = self.executor.dialect();
        format!(
            "plugin_name = {} AND event = {} AND table_name = {}",
            d.placeholder(first),
            d.placeholder(first + 1),
            d.placeholder(first + 2)
        )
    }

    fn parse_row(row: Vec<SqlValue>) -> Result<StoredHook, StoreError> {
        let malformed = |reason: String| StoreError::Malformed {
            table: HOOKS_TABLE,
            reason,
        };
        let mut cols = row.into_iter();
        let mut next = |name: &str| {
            cols.next()
                .ok_or_else(|| malformed(format!("missing column {}", name)))
        };

        let plugin = next("plugin_name")?
            .into_string()
            .ok_or_else(|| malformed("plugin_name is not text".into()))?;
        let event_name = next("event")?
            .into_string()
            .ok_or_else(|| malformed("event is not text".into()))?;
        let event = HookEvent::parse(&event_name)
            .ok_or_else(|| malformed(format!("unknown event '{}'", event_name)))?;
        let table = next("table_name")?
            .into_string()
            .ok_or_else(|| malformed("table_name is not text".into()))?;
        let priority = next("priority")?
            .as_i64()
            .and_then(|p| i32::try_from(p).ok())
            .ok_or_else(|| malformed("priority is not an integer".into()))?;
        let approved = next("approved")?
            .as_bool()
            .ok_or_else(|| malformed("approved is not a flag".into()))?;
        let approved_at = next("approved_at")?.into_string();
        let approved_by = next("approved_by")?.into_string();

        Ok(StoredHook {
            plugin,
            event,
            table,
            priority,
            approved,
            approved_at,
            approved_by,
        })
    }
}

#[async_trait]
impl<E: StatementExecutor> ApprovalStore for SqlApprovalStore<E> {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let d = self.executor.dialect();
        let text = d.text_type();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             plugin_name {text} NOT NULL, \
             event {text} NOT NULL, \
             table_name {text} NOT NULL, \
             priority INTEGER NOT NULL, \
             approved {flag} NOT NULL DEFAULT {no}, \
             approved_at {text}, \
             approved_by {text}, \
             PRIMARY KEY (plugin_name, event, table_name))",
            table = HOOKS_TABLE,
            text = text,
            flag = d.bool_type(),
            no = if d == super::sql::Dialect::Postgres { "FALSE" } else { "0" },
        );
        self.executor.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn upsert_hook(&self, key: &HookKey, priority: i32) -> Result<bool, StoreError> {
        let d = self.executor.dialect();
        let insert = d.insert_if_absent(HOOKS_TABLE, &COLUMNS[..5]);
        let [plugin, event, table] = Self::key_params(key);
        self.executor
            .execute(
                &insert,
                &[
                    plugin.clone(),
                    event.clone(),
                    table.clone(),
                    SqlValue::Integer(i64::from(priority)),
                    SqlValue::Bool(false),
                ],
            )
            .await?;

        let select = format!(
            "SELECT approved FROM {} WHERE {}",
            HOOKS_TABLE,
            self.key_filter(1)
        );
        let rows = self.executor.query(&select, &[plugin, event, table]).await?;
        rows.into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(|v| v.as_bool())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn set_hook_approval(
        &self,
        key: &HookKey,
        approved: bool,
        actor: &str,
    ) -> Result<(), StoreError> {
        let d = self.executor.dialect();
        let sql = format!(
            "UPDATE {} SET approved = {}, approved_at = {}, approved_by = {} WHERE {}",
            HOOKS_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            self.key_filter(4)
        );
        let [plugin, event, table] = Self::key_params(key);
        let affected = self
            .executor
            .execute(
                &sql,
                &[
                    SqlValue::Bool(approved),
                    SqlValue::Text(now_rfc3339()),
                    SqlValue::from(actor),
                    plugin,
                    event,
                    table,
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn list_hooks(&self) -> Result<Vec<StoredHook>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY plugin_name, event, table_name",
            COLUMNS.join(", "),
            HOOKS_TABLE
        );
        self.executor
            .query(&sql, &[])
            .await?
            .into_iter()
            .map(Self::parse_row)
            .collect()
    }

    async fn remove_plugin(&self, plugin: &str) -> Result<(), StoreError> {
        let d = self.executor.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE plugin_name = {}",
            HOOKS_TABLE,
            d.placeholder(1)
        );
        self.executor.execute(&sql, &[SqlValue::from(plugin)]).await?;
        Ok(())
    }

    async fn close(&self) {
        self.executor.close().await;
    }
}
