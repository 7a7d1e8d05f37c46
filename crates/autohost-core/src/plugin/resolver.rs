//! Dependency resolution
//!
//! Pure computation over descriptors: never loads or starts anything.
//! Ordering is Kahn's algorithm with a name-ordered ready set, so the
//! output is a deterministic topological order.

use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::{host_version, PluginDescriptor};
use crate::error::DependencyError;

/// Topologically order `graph`, where each node maps to the nodes it depends on.
///
/// Dependencies come before dependents; ties break by ascending name. Edges
/// to nodes outside the graph are ignored. On a cycle, returns the cycle's
/// members in dependency order.
pub fn topological_order(graph: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>, Vec<String>> {
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (node, deps) in graph {
        let deps: BTreeSet<&str> = deps
            .iter()
            .map(String::as_str)
            .filter(|d| graph.contains_key(*d))
            .collect();
        pending.insert(node.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(node.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut order = Vec::with_capacity(graph.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        for dependent in dependents.get(node).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() == graph.len() {
        return Ok(order);
    }

    let done: HashSet<&str> = order.iter().map(String::as_str).collect();
    Err(find_cycle(graph, &done))
}

/// Walk unresolved nodes along dependency edges until a node repeats.
/// Every unresolved node has at least one unresolved dependency.
fn find_cycle(graph: &BTreeMap<String, Vec<String>>, done: &HashSet<&str>) -> Vec<String> {
    let unresolved = |name: &str| graph.contains_key(name) && !done.contains(name);
    let Some(start) = graph.keys().find(|k| unresolved(k)) else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start.as_str()];
    loop {
        let current = path[path.len() - 1];
        let next = graph
            .get(current)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .filter(|d| unresolved(d))
            .min();
        let Some(next) = next else {
            return path.into_iter().map(str::to_string).collect();
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            return path[pos..].iter().map(|s| s.to_string()).collect();
        }
        path.push(next);
    }
}

/// Computes a safe load order for a set of plugins
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    host_version: Version,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyResolver {
    /// Resolver checking against this host's version
    #[must_use]
    pub fn new() -> Self {
        Self {
            host_version: host_version(),
        }
    }

    /// Resolver checking against an explicit host version
    #[must_use]
    pub fn with_host_version(host_version: Version) -> Self {
        Self { host_version }
    }

    /// Host version plugins are checked against
    #[must_use]
    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Order `descriptors` so every plugin follows its dependencies
    pub fn resolve(&self, descriptors: &[PluginDescriptor]) -> Result<Vec<String>, DependencyError> {
        self.resolve_with(descriptors, &[])
    }

    /// Like [`resolve`](Self::resolve), with `available` plugins (already
    /// loaded) satisfying dependencies without being part of the output
    pub fn resolve_with(
        &self,
        descriptors: &[PluginDescriptor],
        available: &[PluginDescriptor],
    ) -> Result<Vec<String>, DependencyError> {
        let mut by_name: BTreeMap<&str, &PluginDescriptor> = BTreeMap::new();
        for descriptor in descriptors {
            let clashes_loaded = available.iter().any(|a| a.name == descriptor.name);
            if by_name.insert(&descriptor.name, descriptor).is_some() || clashes_loaded {
                return Err(DependencyError::DuplicatePlugin(descriptor.name.clone()));
            }
        }

        for descriptor in by_name.values() {
            if !descriptor.supports_host(&self.host_version) {
                return Err(DependencyError::IncompatibleHost {
                    plugin: descriptor.name.clone(),
                    required: descriptor
                        .min_host_version
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    host: self.host_version.to_string(),
                });
            }
            self.check_edges(descriptor, &by_name, available)?;
        }

        let graph: BTreeMap<String, Vec<String>> = by_name
            .values()
            .map(|d| {
                let deps = d.dependencies.iter().map(|dep| dep.name.clone()).collect();
                (d.name.clone(), deps)
            })
            .collect();

        topological_order(&graph).map_err(|members| DependencyError::CyclicDependency { members })
    }

    /// Check that a new version of `replacement.name` still satisfies every
    /// plugin in `dependents` that depends on it
    pub fn check_replacement(
        &self,
        replacement: &PluginDescriptor,
        dependents: &[PluginDescriptor],
    ) -> Result<(), DependencyError> {
        if !replacement.supports_host(&self.host_version) {
            return Err(DependencyError::IncompatibleHost {
                plugin: replacement.name.clone(),
                required: replacement
                    .min_host_version
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                host: self.host_version.to_string(),
            });
        }
        for dependent in dependents {
            for dep in dependent.dependencies.iter().filter(|d| d.name == replacement.name) {
                if !dep.version_req.matches(&replacement.version) {
                    return Err(DependencyError::VersionMismatch {
                        plugin: dependent.name.clone(),
                        dependency: dep.name.clone(),
                        required: dep.version_req.to_string(),
                        found: replacement.version.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_edges(
        &self,
        descriptor: &PluginDescriptor,
        by_name: &BTreeMap<&str, &PluginDescriptor>,
        available: &[PluginDescriptor],
    ) -> Result<(), DependencyError> {
        for dep in &descriptor.dependencies {
            let target = by_name
                .get(dep.name.as_str())
                .copied()
                .or_else(|| available.iter().find(|a| a.name == dep.name));
            let Some(target) = target else {
                return Err(DependencyError::MissingDependency {
                    plugin: descriptor.name.clone(),
                    dependency: dep.name.clone(),
                });
            };
            if !dep.version_req.matches(&target.version) {
                return Err(DependencyError::VersionMismatch {
                    plugin: descriptor.name.clone(),
                    dependency: dep.name.clone(),
                    required: dep.version_req.to_string(),
                    found: target.version.to_string(),
                });
            }
        }
        Ok(())
    }
}
