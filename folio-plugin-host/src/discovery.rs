//! Plugin discovery and directory scanning
//!
//! A plugin is a subdirectory of the plugin root holding the runtime's
//! initializer file. Its manifest is read by running the initializer in a
//! throwaway VM that has no host capabilities.

use crate::vm::{PluginRuntime, VmError};
use folio_plugin_api::{ManifestError, PluginInfo};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during plugin discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Failed to read directory: {0}")]
    ReadDirectory(#[source] std::io::Error),

    #[error("Failed to read manifest of {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: VmError,
    },

    #[error("Invalid manifest in {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },

    #[error("Plugin '{name}' requires host {required}, running {host}")]
    UnsupportedHost {
        name: String,
        required: String,
        host: String,
    },

    #[error("Plugin name '{name}' in {path} already declared by {first}")]
    Duplicate {
        name: String,
        path: PathBuf,
        first: PathBuf,
    },
}

/// A plugin found on disk with a valid manifest
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub info: PluginInfo,
    pub dir: PathBuf,
    pub initializer: PathBuf,
}

/// Result of plugin discovery
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    /// Plugins with valid, unique manifests, in directory name order
    pub plugins: Vec<DiscoveredPlugin>,

    /// Directories excluded from the batch (with errors)
    pub failures: Vec<(PathBuf, DiscoveryError)>,
}

impl DiscoveryResult {
    /// Returns true if every candidate directory was accepted
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of candidate directories found
    pub fn total_found(&self) -> usize {
        self.plugins.len() + self.failures.len()
    }
}

/// Plugin directory scanner
#[derive(Clone)]
pub struct PluginScanner {
    runtime: Arc<dyn PluginRuntime>,
    host_version: String,
}

impl PluginScanner {
    /// Create a scanner checking manifests against `host_version`
    pub fn new(runtime: Arc<dyn PluginRuntime>, host_version: impl Into<String>) -> Self {
        Self {
            runtime,
            host_version: host_version.into(),
        }
    }

    /// Scan the subdirectories of `dir` for plugins.
    ///
    /// Subdirectories are visited in name order; when two declare the same
    /// plugin name the first one wins.
    pub fn scan_directory(&self, dir: impl AsRef<Path>) -> Result<DiscoveryResult, DiscoveryError> {
        let dir = dir.as_ref();

        if !dir.is_dir() {
            return Err(DiscoveryError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut result = DiscoveryResult::default();
        let mut candidates = Vec::new();

        for entry in std::fs::read_dir(dir).map_err(DiscoveryError::ReadDirectory)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    result
                        .failures
                        .push((dir.to_path_buf(), DiscoveryError::ReadDirectory(e)));
                    continue;
                }
            };
            let path = entry.path();
            let initializer = path.join(self.runtime.initializer_name());
            if path.is_dir() && initializer.is_file() {
                candidates.push((path, initializer));
            }
        }
        candidates.sort();

        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for (path, initializer) in candidates {
            match self.read_manifest(&path, &initializer) {
                Ok(info) => {
                    if let Some(first) = seen.get(&info.name) {
                        let e = DiscoveryError::Duplicate {
                            name: info.name.clone(),
                            path: path.clone(),
                            first: first.clone(),
                        };
                        tracing::warn!(error = %e, "Plugin excluded");
                        result.failures.push((path, e));
                        continue;
                    }
                    tracing::debug!(plugin = %info.name, path = %path.display(), "Plugin discovered");
                    seen.insert(info.name.clone(), path.clone());
                    result.plugins.push(DiscoveredPlugin {
                        info,
                        dir: path,
                        initializer,
                    });
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Plugin excluded");
                    result.failures.push((path, e));
                }
            }
        }

        Ok(result)
    }

    fn read_manifest(&self, dir: &Path, initializer: &Path) -> Result<PluginInfo, DiscoveryError> {
        let inspect = |source| DiscoveryError::Inspect {
            path: dir.to_path_buf(),
            source,
        };
        let mut vm = self.runtime.inspect(initializer).map_err(inspect)?;
        let info = vm.read_manifest().map_err(inspect)?;

        info.validate().map_err(|source| DiscoveryError::Manifest {
            path: dir.to_path_buf(),
            source,
        })?;

        let supported = info
            .supports_host(&self.host_version)
            .map_err(|source| DiscoveryError::Manifest {
                path: dir.to_path_buf(),
                source,
            })?;
        if !supported {
            return Err(DiscoveryError::UnsupportedHost {
                name: info.name,
                required: info.min_host_version.unwrap_or_default(),
                host: self.host_version.clone(),
            });
        }
        Ok(info)
    }
}

impl std::fmt::Debug for PluginScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginScanner")
            .field("initializer", &self.runtime.initializer_name())
            .field("host_version", &self.host_version)
            .finish()
    }
}
