//! folio-plugin-sdk: SDK for writing folio Wasm plugins
//!
//! This SDK provides the guest half of the plugin ABI so a plugin only has
//! to describe itself and handle hooks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use folio_plugin_sdk::prelude::*;
//!
//! struct Slugger;
//!
//! impl Plugin for Slugger {
//!     fn info() -> PluginInfo {
//!         PluginInfo::new("slugger", "1.0.0", "Fills in missing slugs")
//!     }
//!
//!     fn declare() {
//!         host::register_hook(&HookDecl::new(HookEvent::BeforeCreate, "posts").priority(10));
//!     }
//!
//!     fn on_hook(key: &str, record: serde_json::Value) -> HookReply {
//!         if record.get("title").is_none() {
//!             return HookReply::Reject("posts need a title".into());
//!         }
//!         host::log(LogLevel::Debug, key);
//!         HookReply::Allow
//!     }
//! }
//!
//! // Generate all required exports
//! export_plugin!(Slugger);
//! ```

use std::alloc::{alloc, dealloc, Layout};

// Re-export everything from folio-plugin-api
pub use folio_plugin_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_plugin, host, memory, Plugin};
    pub use folio_plugin_api::{
        DataOp, DataRequest, DataResponse, HookDecl, HookEvent, HookReply, LogLevel, PluginInfo,
        API_VERSION, WILDCARD_TABLE,
    };
}

/// Trait that plugins must implement
pub trait Plugin {
    /// Returns the plugin manifest
    fn info() -> PluginInfo;

    /// Top-level declarations, run once for every VM the host builds.
    ///
    /// Register hooks and seed globals here.
    fn declare() {}

    /// Called once when the plugin starts
    fn on_init() -> Result<(), String> {
        Ok(())
    }

    /// Called once when the host shuts down
    fn on_shutdown() -> Result<(), String> {
        Ok(())
    }

    /// Handle a hook addressed by its `event:table` key
    fn on_hook(_key: &str, _record: serde_json::Value) -> HookReply {
        HookReply::Allow
    }
}

/// Memory utilities for Wasm plugin development
pub mod memory {
    use super::*;

    /// Allocate memory in the Wasm linear memory
    #[inline]
    pub fn plugin_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        match Layout::from_size_align(size as usize, 1) {
            Ok(layout) => unsafe { alloc(layout) as i32 },
            Err(_) => 0,
        }
    }

    /// Deallocate memory in the Wasm linear memory
    ///
    /// The ptr must have been allocated by `plugin_alloc` with the same size.
    #[inline]
    pub fn plugin_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size as usize, 1) {
            unsafe { dealloc(ptr as *mut u8, layout) }
        }
    }

    /// Serialize data and return it as an allocated buffer
    ///
    /// Returns a packed i64 containing the pointer and length.
    pub fn serialize_and_return<T: serde::Serialize>(data: &T) -> i64 {
        let bytes = rmp_serde::to_vec_named(data).unwrap_or_default();
        let len = bytes.len() as i32;
        let ptr = plugin_alloc(len);

        if ptr != 0 && len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
            }
        }

        abi::pack_ptr_len(ptr, len)
    }

    /// Copy `len` bytes starting at `ptr`
    ///
    /// # Safety
    /// The pointer must be valid for `len` bytes.
    pub unsafe fn read_bytes(ptr: i32, len: i32) -> Vec<u8> {
        if ptr == 0 || len <= 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(ptr as *const u8, len as usize).to_vec()
    }

    /// Deserialize data from a raw pointer and length
    ///
    /// # Safety
    /// The pointer must be valid and point to `len` bytes of valid MessagePack data.
    pub unsafe fn deserialize_from_ptr<T: serde::de::DeserializeOwned>(
        ptr: i32,
        len: i32,
    ) -> Option<T> {
        if ptr == 0 || len <= 0 {
            return None;
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        rmp_serde::from_slice(slice).ok()
    }

    /// Read and free a packed buffer the host allocated for us
    ///
    /// # Safety
    /// `packed` must come from a host import reply.
    pub unsafe fn take_packed(packed: i64) -> Vec<u8> {
        let (ptr, len) = abi::unpack_ptr_len(packed);
        let bytes = read_bytes(ptr, len);
        plugin_dealloc(ptr, len);
        bytes
    }
}

/// Safe wrappers around the `folio` host imports.
///
/// The imports only exist inside the host's wasm sandbox; native builds get
/// inert fallbacks so plugin crates can still run their unit tests.
pub mod host {
    use super::*;
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    #[cfg(target_arch = "wasm32")]
    mod imp {
        use crate::memory;

        #[link(wasm_import_module = "folio")]
        extern "C" {
            fn log(level: i32, ptr: i32, len: i32);
            fn hooks_register(ptr: i32, len: i32);
            fn db_execute(ptr: i32, len: i32) -> i64;
            fn global_set(key_ptr: i32, key_len: i32, val_ptr: i32, val_len: i32);
            fn global_get(key_ptr: i32, key_len: i32) -> i64;
            fn global_del(key_ptr: i32, key_len: i32);
        }

        pub fn write_log(level: i32, message: &str) {
            unsafe { log(level, message.as_ptr() as i32, message.len() as i32) }
        }

        pub fn register(bytes: &[u8]) {
            unsafe { hooks_register(bytes.as_ptr() as i32, bytes.len() as i32) }
        }

        pub fn execute(bytes: &[u8]) -> Result<Vec<u8>, String> {
            let packed = unsafe { db_execute(bytes.as_ptr() as i32, bytes.len() as i32) };
            Ok(unsafe { memory::take_packed(packed) })
        }

        pub fn set(key: &str, value: &[u8]) {
            unsafe {
                global_set(
                    key.as_ptr() as i32,
                    key.len() as i32,
                    value.as_ptr() as i32,
                    value.len() as i32,
                )
            }
        }

        pub fn get(key: &str) -> Option<Vec<u8>> {
            let packed = unsafe { global_get(key.as_ptr() as i32, key.len() as i32) };
            if packed == 0 {
                return None;
            }
            Some(unsafe { memory::take_packed(packed) })
        }

        pub fn del(key: &str) {
            unsafe { global_del(key.as_ptr() as i32, key.len() as i32) }
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    mod imp {
        pub fn write_log(_level: i32, _message: &str) {}

        pub fn register(_bytes: &[u8]) {}

        pub fn execute(_bytes: &[u8]) -> Result<Vec<u8>, String> {
            Err("host imports are only available inside the plugin runtime".to_string())
        }

        pub fn set(_key: &str, _value: &[u8]) {}

        pub fn get(_key: &str) -> Option<Vec<u8>> {
            None
        }

        pub fn del(_key: &str) {}
    }

    /// Emit a log line through the host's logger
    pub fn log(level: LogLevel, message: &str) {
        imp::write_log(level.as_i32(), message)
    }

    /// Declare a hook; only meaningful inside [`Plugin::declare`]
    pub fn register_hook(decl: &HookDecl) {
        if let Ok(bytes) = rmp_serde::to_vec_named(decl) {
            imp::register(&bytes)
        }
    }

    /// Run a data-access request.
    ///
    /// Fails inside synchronous hooks and once the per-call budget is spent.
    pub fn data(request: &DataRequest) -> Result<DataResponse, String> {
        let bytes = rmp_serde::to_vec_named(request).map_err(|e| e.to_string())?;
        let reply = imp::execute(&bytes)?;
        match rmp_serde::from_slice(&reply).map_err(|e| e.to_string())? {
            DataReply::Ok(response) => Ok(response),
            DataReply::Error(e) => Err(e),
        }
    }

    /// Bind a top-level name
    pub fn global_set<T: Serialize>(key: &str, value: &T) {
        if let Ok(bytes) = rmp_serde::to_vec_named(value) {
            imp::set(key, &bytes)
        }
    }

    /// Look up a top-level name
    pub fn global_get<T: DeserializeOwned>(key: &str) -> Option<T> {
        imp::get(key).and_then(|bytes| rmp_serde::from_slice(&bytes).ok())
    }

    /// Unbind a top-level name
    pub fn global_del(key: &str) {
        imp::del(key)
    }
}

/// Convert a lifecycle result into the wire reply
pub fn call_reply(result: Result<(), String>) -> CallReply {
    match result {
        Ok(()) => CallReply::Ok,
        Err(e) => CallReply::Error(e),
    }
}

/// Macro to export all required plugin functions
///
/// This macro generates `plugin_info`, `plugin_declare`, `plugin_on_init`,
/// `plugin_on_shutdown`, `plugin_hook`, `plugin_alloc` and `plugin_dealloc`.
///
/// # Example
///
/// ```rust,ignore
/// struct MyPlugin;
///
/// impl Plugin for MyPlugin {
///     fn info() -> PluginInfo { /* ... */ }
/// }
///
/// export_plugin!(MyPlugin);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($plugin:ty) => {
        #[no_mangle]
        pub extern "C" fn plugin_info() -> i64 {
            let info = <$plugin as $crate::Plugin>::info();
            $crate::memory::serialize_and_return(&info)
        }

        #[no_mangle]
        pub extern "C" fn plugin_declare() {
            <$plugin as $crate::Plugin>::declare()
        }

        #[no_mangle]
        pub extern "C" fn plugin_on_init() -> i64 {
            let reply = $crate::call_reply(<$plugin as $crate::Plugin>::on_init());
            $crate::memory::serialize_and_return(&reply)
        }

        #[no_mangle]
        pub extern "C" fn plugin_on_shutdown() -> i64 {
            let reply = $crate::call_reply(<$plugin as $crate::Plugin>::on_shutdown());
            $crate::memory::serialize_and_return(&reply)
        }

        #[no_mangle]
        pub extern "C" fn plugin_hook(key_ptr: i32, key_len: i32, rec_ptr: i32, rec_len: i32) -> i64 {
            let key = unsafe { $crate::memory::read_bytes(key_ptr, key_len) };
            let key = String::from_utf8_lossy(&key);
            let record: $crate::serde_json::Value = unsafe {
                $crate::memory::deserialize_from_ptr(rec_ptr, rec_len).unwrap_or_default()
            };
            let reply = <$plugin as $crate::Plugin>::on_hook(&key, record);
            $crate::memory::serialize_and_return(&reply)
        }

        #[no_mangle]
        pub extern "C" fn plugin_alloc(size: i32) -> i32 {
            $crate::memory::plugin_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn plugin_dealloc(ptr: i32, size: i32) {
            $crate::memory::plugin_dealloc(ptr, size)
        }
    };
}

#[doc(hidden)]
pub use serde_json;
