//! Dependency ordering
//!
//! Kahn's topological sort over declared plugin dependencies. Among plugins
//! that are ready at the same time the lexicographically smallest name goes
//! first, so the order never depends on discovery or hash order.

use folio_plugin_api::PluginInfo;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors that abort a whole load
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("plugin '{plugin}' depends on unknown plugin '{dependency}'")]
    Unknown { plugin: String, dependency: String },

    #[error("dependency cycle among plugins: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Order plugins so every plugin comes after its dependencies
pub fn resolve_order<'a, I>(plugins: I) -> Result<Vec<String>, DependencyError>
where
    I: IntoIterator<Item = &'a PluginInfo>,
{
    let plugins: BTreeMap<&str, &PluginInfo> =
        plugins.into_iter().map(|p| (p.name.as_str(), p)).collect();

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (&name, info) in &plugins {
        let deps: BTreeSet<&str> = info.dependencies.iter().map(String::as_str).collect();
        for &dep in &deps {
            if !plugins.contains_key(dep) {
                return Err(DependencyError::Unknown {
                    plugin: name.to_string(),
                    dependency: dep.to_string(),
                });
            }
            dependents.entry(dep).or_default().push(name);
        }
        in_degree.insert(name, deps.len());
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut order = Vec::with_capacity(plugins.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for &dependent in dependents.get(name).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < plugins.len() {
        let stuck = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n.to_string())
            .collect();
        return Err(DependencyError::Cycle(stuck));
    }

    Ok(order)
}
