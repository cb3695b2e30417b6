//! folio-plugin-api: Shared types for the folio plugin runtime
//!
//! This crate defines the protocol between the host and a guest (wasm plugin).
//! Communication uses MessagePack serialization.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

/// Maximum length of a plugin name
pub const MAX_PLUGIN_NAME_LEN: usize = 32;

/// Table name matching every table in a hook declaration
pub const WILDCARD_TABLE: &str = "*";

/// Field injected into hook records carrying the table name
pub const RECORD_TABLE_FIELD: &str = "_table";

/// Field injected into hook records carrying the event name
pub const RECORD_EVENT_FIELD: &str = "_event";

fn current_api_version() -> u32 {
    API_VERSION
}

/// Plugin manifest returned by the guest's `plugin_info()` export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// API version for compatibility
    #[serde(default = "current_api_version")]
    pub api_version: u32,

    /// Unique plugin name (lowercase letters, digits, underscore)
    pub name: String,

    /// Plugin version
    pub version: String,

    /// Human readable description
    pub description: String,

    /// Plugin author
    #[serde(default)]
    pub author: Option<String>,

    /// License identifier
    #[serde(default)]
    pub license: Option<String>,

    /// Minimum host version this plugin runs on (dotted integers)
    #[serde(default)]
    pub min_host_version: Option<String>,

    /// Names of plugins that must be running before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Errors raised while validating a plugin manifest
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("invalid plugin name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("manifest field '{0}' is required")]
    MissingField(&'static str),

    #[error("plugin '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("invalid dependency name '{name}': {reason}")]
    InvalidDependency { name: String, reason: &'static str },

    #[error("API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("invalid version string '{0}'")]
    InvalidVersion(String),
}

/// Check a plugin name against the naming rules.
///
/// Names are 1..=32 characters of `[a-z0-9_]` and may not end with an
/// underscore.
pub fn validate_plugin_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.len() > MAX_PLUGIN_NAME_LEN {
        return Err("name longer than 32 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err("only lowercase letters, digits and underscore are allowed");
    }
    if name.ends_with('_') {
        return Err("name may not end with an underscore");
    }
    Ok(())
}

impl PluginInfo {
    /// Create a manifest with the required fields
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            api_version: API_VERSION,
            name: name.into(),
            version: version.into(),
            description: description.into(),
            author: None,
            license: None,
            min_host_version: None,
            dependencies: Vec::new(),
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Set the author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set the minimum host version
    pub fn min_host_version(mut self, version: impl Into<String>) -> Self {
        self.min_host_version = Some(version.into());
        self
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.api_version != API_VERSION {
            return Err(ManifestError::ApiVersionMismatch {
                expected: API_VERSION,
                actual: self.api_version,
            });
        }
        validate_plugin_name(&self.name).map_err(|reason| ManifestError::InvalidName {
            name: self.name.clone(),
            reason,
        })?;
        if self.version.trim().is_empty() {
            return Err(ManifestError::MissingField("version"));
        }
        if self.description.trim().is_empty() {
            return Err(ManifestError::MissingField("description"));
        }
        if let Some(min) = &self.min_host_version {
            parse_version(min)?;
        }
        for dep in &self.dependencies {
            if dep == &self.name {
                return Err(ManifestError::SelfDependency(self.name.clone()));
            }
            validate_plugin_name(dep).map_err(|reason| ManifestError::InvalidDependency {
                name: dep.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Whether this plugin accepts the given host version.
    pub fn supports_host(&self, host_version: &str) -> Result<bool, ManifestError> {
        match &self.min_host_version {
            None => Ok(true),
            Some(min) => Ok(parse_version(host_version)? >= parse_version(min)?),
        }
    }
}

/// Parse a dotted version (`1`, `1.4`, `1.4.2`) into comparable components.
///
/// Missing components count as zero; a pre-release suffix after `-` is ignored.
pub fn parse_version(version: &str) -> Result<[u64; 3], ManifestError> {
    let core = version.trim().split('-').next().unwrap_or_default();
    let mut parts = [0u64; 3];
    let mut count = 0;
    for (i, part) in core.split('.').enumerate() {
        if i >= 3 {
            return Err(ManifestError::InvalidVersion(version.to_string()));
        }
        parts[i] = part
            .parse()
            .map_err(|_| ManifestError::InvalidVersion(version.to_string()))?;
        count += 1;
    }
    if count == 0 {
        return Err(ManifestError::InvalidVersion(version.to_string()));
    }
    Ok(parts)
}

/// Content lifecycle event a hook can observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforePublish,
    AfterPublish,
}

impl HookEvent {
    /// All events, in declaration order
    pub const ALL: [HookEvent; 8] = [
        HookEvent::BeforeCreate,
        HookEvent::AfterCreate,
        HookEvent::BeforeUpdate,
        HookEvent::AfterUpdate,
        HookEvent::BeforeDelete,
        HookEvent::AfterDelete,
        HookEvent::BeforePublish,
        HookEvent::AfterPublish,
    ];

    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeCreate => "before_create",
            HookEvent::AfterCreate => "after_create",
            HookEvent::BeforeUpdate => "before_update",
            HookEvent::AfterUpdate => "after_update",
            HookEvent::BeforeDelete => "before_delete",
            HookEvent::AfterDelete => "after_delete",
            HookEvent::BeforePublish => "before_publish",
            HookEvent::AfterPublish => "after_publish",
        }
    }

    /// Whether the event runs synchronously before the operation commits
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            HookEvent::BeforeCreate
                | HookEvent::BeforeUpdate
                | HookEvent::BeforeDelete
                | HookEvent::BeforePublish
        )
    }

    /// Parse a wire name
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == s)
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook declaration sent by the guest through `hooks_register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDecl {
    /// Event to observe
    pub event: HookEvent,

    /// Table name, or `*` for every table
    pub table: String,

    /// Lower runs first
    #[serde(default = "HookDecl::default_priority")]
    pub priority: i32,
}

impl HookDecl {
    /// Create a declaration with the default priority
    pub fn new(event: HookEvent, table: impl Into<String>) -> Self {
        Self {
            event,
            table: table.into(),
            priority: Self::default_priority(),
        }
    }

    /// Set the priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn default_priority() -> i32 {
        100
    }

    /// Whether this declaration matches any table
    pub fn is_wildcard(&self) -> bool {
        self.table == WILDCARD_TABLE
    }

    /// Key the guest uses to look up the handler (`event:table`)
    pub fn handler_key(&self) -> String {
        handler_key(self.event, &self.table)
    }
}

/// Build a handler key from an event and table
pub fn handler_key(event: HookEvent, table: &str) -> String {
    format!("{}:{}", event.as_str(), table)
}

/// Reply of a hook handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookReply {
    /// Let the operation continue
    Allow,

    /// Veto the operation with a reason
    Reject(String),
}

/// Reply of a lifecycle call (`plugin_on_init`, `plugin_on_shutdown`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallReply {
    Ok,
    Error(String),
}

/// Guest log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Decode the level passed to the `log` import
    pub fn from_i32(level: i32) -> Self {
        match level {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    /// Encode for the `log` import
    pub fn as_i32(&self) -> i32 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

/// Data-access operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOp {
    Query,
    Insert,
    Update,
    Delete,
}

/// Data-access request sent through `db_execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub op: DataOp,
    pub table: String,

    /// Equality filter (object of column -> value)
    #[serde(default)]
    pub filter: serde_json::Value,

    /// Column values for insert/update
    #[serde(default)]
    pub values: serde_json::Value,

    #[serde(default)]
    pub limit: Option<u32>,
}

impl DataRequest {
    /// Create a query against a table
    pub fn query(table: impl Into<String>) -> Self {
        Self {
            op: DataOp::Query,
            table: table.into(),
            filter: serde_json::Value::Null,
            values: serde_json::Value::Null,
            limit: None,
        }
    }
}

/// Data-access response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    #[serde(default)]
    pub rows: Vec<serde_json::Value>,

    #[serde(default)]
    pub rows_affected: u64,
}

/// Envelope returned to the guest by `db_execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataReply {
    Ok(DataResponse),
    Error(String),
}

/// Guest ABI: export/import names and pointer packing
pub mod abi {
    /// Import module under which host functions are linked
    pub const IMPORT_MODULE: &str = "folio";

    pub const EXPORT_MEMORY: &str = "memory";
    pub const EXPORT_ALLOC: &str = "plugin_alloc";
    pub const EXPORT_DEALLOC: &str = "plugin_dealloc";
    pub const EXPORT_INFO: &str = "plugin_info";
    pub const EXPORT_DECLARE: &str = "plugin_declare";
    pub const EXPORT_ON_INIT: &str = "plugin_on_init";
    pub const EXPORT_ON_SHUTDOWN: &str = "plugin_on_shutdown";
    pub const EXPORT_HOOK: &str = "plugin_hook";

    pub const IMPORT_LOG: &str = "log";
    pub const IMPORT_HOOKS_REGISTER: &str = "hooks_register";
    pub const IMPORT_DB_EXECUTE: &str = "db_execute";
    pub const IMPORT_GLOBAL_SET: &str = "global_set";
    pub const IMPORT_GLOBAL_GET: &str = "global_get";
    pub const IMPORT_GLOBAL_DEL: &str = "global_del";

    /// Pack a pointer and length into a single i64 value
    #[inline]
    pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
        ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
    }

    /// Unpack ptr and len from a packed i64
    #[inline]
    pub fn unpack_ptr_len(packed: i64) -> (i32, i32) {
        let ptr = (packed >> 32) as i32;
        let len = (packed & 0xFFFFFFFF) as i32;
        (ptr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_name_rules() {
        assert!(validate_plugin_name("seo_tools").is_ok());
        assert!(validate_plugin_name("a1").is_ok());
        assert!(validate_plugin_name(&"a".repeat(32)).is_ok());

        assert!(validate_plugin_name("").is_err());
        assert!(validate_plugin_name(&"a".repeat(33)).is_err());
        assert!(validate_plugin_name("SeoTools").is_err());
        assert!(validate_plugin_name("seo-tools").is_err());
        assert!(validate_plugin_name("seo_").is_err());
    }

    #[test]
    fn test_manifest_validation() {
        let info = PluginInfo::new("audit_log", "1.0.0", "Records changes");
        assert!(info.validate().is_ok());

        let missing = PluginInfo::new("audit_log", "1.0.0", "  ");
        assert_eq!(
            missing.validate(),
            Err(ManifestError::MissingField("description"))
        );

        let looped = PluginInfo::new("audit_log", "1.0.0", "x").depends_on("audit_log");
        assert!(matches!(
            looped.validate(),
            Err(ManifestError::SelfDependency(_))
        ));

        let bad_dep = PluginInfo::new("audit_log", "1.0.0", "x").depends_on("Core");
        assert!(matches!(
            bad_dep.validate(),
            Err(ManifestError::InvalidDependency { .. })
        ));
    }

    #[test]
    fn test_host_version_gate() {
        let info = PluginInfo::new("search", "0.2.0", "Search index").min_host_version("1.4");
        assert!(info.supports_host("1.4.0").unwrap());
        assert!(info.supports_host("2.0.0").unwrap());
        assert!(!info.supports_host("1.3.9").unwrap());
        assert!(parse_version("1.x").is_err());
    }

    #[test]
    fn test_manifest_serialization() {
        let info = PluginInfo::new("search", "0.2.0", "Search index").depends_on("core");
        let bytes = rmp_serde::to_vec(&info).unwrap();
        let decoded: PluginInfo = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_hook_decl_key() {
        let decl = HookDecl::new(HookEvent::BeforeCreate, "posts");
        assert_eq!(decl.handler_key(), "before_create:posts");
        assert_eq!(decl.priority, 100);
        assert!(HookDecl::new(HookEvent::AfterDelete, "*").is_wildcard());
        assert_eq!(HookEvent::parse("after_update"), Some(HookEvent::AfterUpdate));
        assert!(HookEvent::BeforePublish.is_before());
        assert!(!HookEvent::AfterCreate.is_before());
    }

    #[test]
    fn test_pack_unpack() {
        let packed = abi::pack_ptr_len(0x1234_5678, 0x100);
        assert_eq!(abi::unpack_ptr_len(packed), (0x1234_5678, 0x100));
    }
}
