use super::HookKey;
use thiserror::Error;

/// Error returned to callers of synchronous hook dispatch
///
/// `Display` is a stable public message that is safe to show end users.
/// The plugin-originated text is kept apart and only reachable through
/// [`HookError::detail`], for server logs.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("the operation was rejected by a content hook")]
    Rejected { key: HookKey, detail: String },

    #[error("a content hook failed")]
    Failed { key: HookKey, detail: String },

    #[error("a content hook timed out")]
    TimedOut { key: HookKey, detail: String },

    #[error("content hooks are temporarily unavailable")]
    Unavailable { key: HookKey, detail: String },

    #[error("the record could not be prepared for content hooks")]
    InvalidRecord { detail: String },
}

impl HookError {
    /// Original error text, for server logs only
    pub fn detail(&self) -> &str {
        match self {
            HookError::Rejected { detail, .. }
            | HookError::Failed { detail, .. }
            | HookError::TimedOut { detail, .. }
            | HookError::Unavailable { detail, .. }
            | HookError::InvalidRecord { detail } => detail,
        }
    }

    /// Hook that failed, if a handler was involved
    pub fn key(&self) -> Option<&HookKey> {
        match self {
            HookError::Rejected { key, .. }
            | HookError::Failed { key, .. }
            | HookError::TimedOut { key, .. }
            | HookError::Unavailable { key, .. } => Some(key),
            HookError::InvalidRecord { .. } => None,
        }
    }

    /// Whether the failure counts against the hook's fault state
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            HookError::Rejected { .. } | HookError::Failed { .. } | HookError::TimedOut { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_plugin_api::HookEvent;

    #[test]
    fn test_display_never_leaks_detail() {
        let err = HookError::Failed {
            key: HookKey::new("seo", HookEvent::BeforeCreate, "posts"),
            detail: "SELECT * FROM secrets failed: password=hunter2".to_string(),
        };
        assert_eq!(err.to_string(), "a content hook failed");
        assert!(err.detail().contains("hunter2"));
        assert_eq!(err.key().map(|k| k.plugin.as_str()), Some("seo"));
    }
}
