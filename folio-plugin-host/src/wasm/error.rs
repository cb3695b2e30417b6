//! Wasm runtime error types

use crate::vm::VmError;
use std::path::PathBuf;
use thiserror::Error;
use wasmtime::Trap;

/// Errors that can occur while loading or calling a wasm plugin
#[derive(Debug, Error)]
pub enum WasmError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    #[error("Execution interrupted at deadline or by host")]
    Interrupted,
}

impl WasmError {
    /// Classify an error returned by a guest call
    pub(crate) fn from_call(function: &'static str, source: anyhow::Error) -> Self {
        match source.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => WasmError::FuelExhausted,
            Some(Trap::Interrupt) => WasmError::Interrupted,
            _ => WasmError::FunctionCall { function, source },
        }
    }

    /// Whether the error came out of guest execution, leaving the instance
    /// in an unknown state
    pub(crate) fn is_trap(&self) -> bool {
        matches!(
            self,
            WasmError::FunctionCall { .. } | WasmError::FuelExhausted | WasmError::Interrupted
        )
    }
}

impl From<WasmError> for VmError {
    fn from(e: WasmError) -> Self {
        match e {
            WasmError::FuelExhausted => VmError::FuelExhausted,
            WasmError::Interrupted => VmError::DeadlineExceeded,
            WasmError::FunctionNotFound(name) => VmError::FunctionNotFound(name),
            WasmError::FunctionCall { .. } => VmError::Trap(e.to_string()),
            WasmError::Deserialization(_) | WasmError::Serialization(_) => {
                VmError::Codec(e.to_string())
            }
            WasmError::MemoryAccess(_) => VmError::Trap(e.to_string()),
            WasmError::EngineCreation(_)
            | WasmError::Read { .. }
            | WasmError::ModuleCompilation(_)
            | WasmError::Instantiation(_) => VmError::Construction(e.to_string()),
        }
    }
}
