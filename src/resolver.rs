use std::collections::{BTreeMap, BTreeSet};

use crate::error::{GrowError, Result};
use crate::field::ValidField;
use crate::plant::Catalog;

/// Injection graph between plants.
///
/// Ordering is deterministic: among plants that are ready at the same time
/// the lexicographically smallest goes first.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    // plant -> plants it depends on
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph for every plant of the field, using each plant's
    /// catalog descriptor. Injections that point outside the field only add
    /// a node.
    pub fn for_field(field: &ValidField, catalog: &Catalog) -> Self {
        let mut resolver = Self::new();
        for name in field.plants.keys() {
            resolver.add(name);
            if let Some(descriptor) = catalog.descriptor(name) {
                for dep in descriptor.dependencies() {
                    resolver.set_dependency(name, dep);
                }
            }
        }
        resolver
    }

    pub fn add(&mut self, plant: &str) {
        self.deps.entry(plant.to_string()).or_default();
    }

    /// Records that `plant` must come after `depends_on`.
    pub fn set_dependency(&mut self, plant: &str, depends_on: &str) {
        self.add(depends_on);
        self.deps
            .entry(plant.to_string())
            .or_default()
            .insert(depends_on.to_string());
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Kahn's algorithm. Dependencies come before their dependents; a cycle
    /// fails with every plant that could not be ordered.
    pub fn sort(&self) -> Result<Vec<String>> {
        let mut remaining: BTreeMap<&str, usize> = self
            .deps
            .iter()
            .map(|(plant, deps)| (plant.as_str(), deps.len()))
            .collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (plant, deps) in &self.deps {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(plant.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(plant, _)| *plant)
            .collect();
        let mut order = Vec::with_capacity(self.deps.len());

        while let Some(plant) = ready.pop_first() {
            remaining.remove(plant);
            order.push(plant.to_string());
            for &dependent in dependents.get(plant).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if remaining.is_empty() {
            return Ok(order);
        }

        // What is left is a cycle plus plants merely waiting on it; peel off
        // the latter so the error names the cycle itself.
        let mut stuck: BTreeSet<&str> = remaining.keys().copied().collect();
        loop {
            let waiting: Vec<&str> = stuck
                .iter()
                .copied()
                .filter(|plant| {
                    !dependents
                        .get(plant)
                        .into_iter()
                        .flatten()
                        .any(|dependent| stuck.contains(dependent))
                })
                .collect();
            if waiting.is_empty() {
                break;
            }
            for plant in waiting {
                stuck.remove(plant);
            }
        }
        Err(GrowError::CyclicDependency(
            stuck.into_iter().map(str::to_string).collect(),
        ))
    }
}
