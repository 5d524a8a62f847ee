//! The plugin catalog and dependency resolution.
//!
//! [`PluginCatalog::resolve`] turns a bot's declared plugin list into a load
//! order:
//!
//! - disabled specs are dropped; an empty list falls back to the catalog's
//!   default plugins
//! - every remaining name must be registered, and declared at most once
//! - a plugin's dependencies are the union of its descriptor's and its spec's;
//!   each must be another enabled plugin of the same bot
//! - the order is a topological sort that, among plugins free to go next,
//!   always picks the one declared first
//!
//! Resolution is pure: it reads the catalog and the specs and nothing else, so
//! it is safe to call concurrently from any number of builds.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde_json::Value;
use tracing::{info, warn};

use fleet_core::PluginSpec;

use super::descriptor::PluginDescriptor;
use crate::error::ResolveError;

/// One entry of a resolved load order.
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub descriptor: PluginDescriptor,
    pub spec: PluginSpec,
}

impl ResolvedPlugin {
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// The spec's config map as a JSON object.
    pub fn config(&self) -> Value {
        Value::Object(self.spec.config.clone())
    }
}

/// Registry of every plugin the process can build.
#[derive(Debug, Default, Clone)]
pub struct PluginCatalog {
    descriptors: HashMap<String, PluginDescriptor>,
    defaults: Vec<String>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Registers a descriptor, replacing any previous one with the same name.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> &mut Self {
        let name = descriptor.name().to_string();
        let version = descriptor.get_version().to_string();
        if self.descriptors.insert(name.clone(), descriptor).is_some() {
            warn!(plugin = %name, "Plugin registered twice, last registration wins");
        } else {
            info!(plugin = %name, version = %version, "Plugin registered");
        }
        self
    }

    pub fn unregister(&mut self, name: &str) -> Option<PluginDescriptor> {
        let removed = self.descriptors.remove(name);
        if removed.is_some() {
            info!(plugin = %name, "Plugin unregistered");
        }
        removed
    }

    /// Sets the plugins used by definitions that declare none.
    pub fn set_defaults<I, S>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defaults = names.into_iter().map(Into::into).collect();
        self
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<&PluginDescriptor> {
        self.descriptors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Registered plugin names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.descriptors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn defaults(&self) -> &[String] {
        &self.defaults
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    // ─── Resolution ──────────────────────────────────────────────────────────

    /// Resolves `specs` into a dependency-ordered list.
    pub fn resolve(&self, specs: &[PluginSpec]) -> Result<Vec<ResolvedPlugin>, ResolveError> {
        let specs: Vec<PluginSpec> = if specs.is_empty() {
            self.defaults
                .iter()
                .filter(|name| self.contains(name))
                .map(|name| PluginSpec::named(name.as_str()))
                .collect()
        } else {
            specs.iter().filter(|s| s.enabled).cloned().collect()
        };

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.as_str(), i).is_some() {
                return Err(ResolveError::Duplicate(spec.name.clone()));
            }
        }

        let descriptors = specs
            .iter()
            .map(|spec| {
                self.get(&spec.name)
                    .ok_or_else(|| ResolveError::UnknownPlugin(spec.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Edge j → i means "j loads before i".
        let n = specs.len();
        let mut in_degree: Vec<usize> = vec![0; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, (spec, descriptor)) in specs.iter().zip(&descriptors).enumerate() {
            let mut seen = HashSet::new();
            let deps = descriptor
                .dependencies()
                .iter()
                .chain(&spec.depends_on)
                .filter(|dep| seen.insert(dep.as_str()));

            for dep in deps {
                let Some(&j) = index.get(dep.as_str()) else {
                    return Err(ResolveError::MissingDependency {
                        plugin: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                dependents[j].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm; the min-heap keeps declaration order among ties.
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }

        if order.len() != n {
            let blocked: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
            let members = cycle_members(&dependents, &blocked)
                .into_iter()
                .map(|i| specs[i].name.clone())
                .collect();
            return Err(ResolveError::Cycle { members });
        }

        Ok(order
            .into_iter()
            .map(|i| ResolvedPlugin {
                descriptor: descriptors[i].clone(),
                spec: specs[i].clone(),
            })
            .collect())
    }
}

/// Indices of every node that sits on a cycle, sorted ascending.
///
/// Only `candidates` are visited. Nodes that are merely downstream of a cycle
/// form singleton components without a self-edge and are left out.
fn cycle_members(adjacency: &[Vec<usize>], candidates: &[bool]) -> Vec<usize> {
    struct Tarjan<'a> {
        adjacency: &'a [Vec<usize>],
        candidates: &'a [bool],
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next: usize,
        members: Vec<usize>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next);
            self.low[v] = self.next;
            self.next += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            let adjacency = self.adjacency;
            for &w in &adjacency[v] {
                if !self.candidates[w] {
                    continue;
                }
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.low[v] = self.low[v].min(self.low[w]);
                    }
                    Some(iw) if self.on_stack[w] => {
                        self.low[v] = self.low[v].min(iw);
                    }
                    Some(_) => {}
                }
            }

            if Some(self.low[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                if component.len() > 1 || adjacency[v].contains(&v) {
                    self.members.extend(component);
                }
            }
        }
    }

    let n = adjacency.len();
    let mut tarjan = Tarjan {
        adjacency,
        candidates,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        members: Vec::new(),
    };
    for v in 0..n {
        if candidates[v] && tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }

    let mut members = tarjan.members;
    members.sort_unstable();
    members
}
