//! Lifecycle hook dispatch
//!
//! Plugins declare hooks on content events (`before_create`, `after_update`,
//! ...) for one table or for every table. Hooks only fire once approved.
//!
//! ```text
//!   run_before_hooks ──► gather ──► for each entry, in order:
//!                                     get_for_hook ─► block data access ─► call ─► put
//!                                     failure: abort chain, count fault, sanitized error
//!
//!   run_after_hooks  ──► gather ──► for each entry:
//!                                     limiter slot ─► spawn worker (engine lifetime)
//!                                     worker: get_for_hook ─► reduced op budget ─► call ─► put
//! ```
//!
//! Dispatch order within one event/table is total: priority ascending, then
//! exact table before wildcard, then registration order.

mod engine;
mod error;
mod fault;
mod index;

pub use engine::{HookEngine, HookStatus};
pub use error::HookError;
pub use fault::FaultState;
pub use index::{HookEntry, HookIndex, HookKey};
