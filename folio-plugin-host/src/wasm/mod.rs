//! Wasm plugin runtime
//!
//! ```text
//!   plugins/<name>/plugin.wasm
//!        │ compile once (cached per file)
//!        ▼
//!     Module ──inspect──► capability-free instance ──► plugin_info
//!        │
//!        └──factory──► instance + CapabilitySet ──► plugin_declare ──► pool
//! ```
//!
//! Guests talk to the host only through the `folio` import module. Each call
//! gets a fresh fuel allowance, and a background ticker drives epoch
//! interruption so the pool's cancellation deadline stops runaway guests.

mod error;
mod host;
mod loader;

pub use error::WasmError;
pub use loader::{WasmRuntime, WasmVm, WasmVmFactory};
