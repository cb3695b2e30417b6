//! Persisted hook approvals
//!
//! A registered hook never fires until an administrator approves it. The
//! approval flag lives in a relational table so it survives restarts; the
//! hook engine keeps an in-memory copy loaded at registration time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   upsert/list/set   ┌──────────────────────┐
//! │    HookEngine    │ ──────────────────► │  dyn ApprovalStore   │
//! └──────────────────┘                     └──────────┬───────────┘
//!                                                     │
//!                          ┌──────────────────────────┼───────────────────┐
//!                          ▼                          ▼                   │
//!                 MemoryApprovalStore     SqlApprovalStore<E>             │
//!                                                     │                   │
//!                                                     ▼                   │
//!                                         E: StatementExecutor ◄──────────┘
//!                                          (SqliteExecutor, or the
//!                                           host's own Postgres/MySQL)
//! ```

mod sql;
mod store;

pub use sql::{Dialect, SqlValue, StatementExecutor};
#[cfg(feature = "sqlite")]
pub use sql::SqliteExecutor;
pub use store::{
    ApprovalStore, MemoryApprovalStore, SqlApprovalStore, StoreError, StoredHook, HOOKS_TABLE,
};
