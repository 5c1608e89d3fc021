//! Grouping of guests by the packages they need.
//!
//! Every guest starts with its own [`DependencyCollection`]. Pruning removes
//! duplicate packages and merges collections with the same package set, so
//! one installation serves every guest needing exactly those packages.

use crate::types::Dependency;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Packages to install on a group of guests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCollection<G> {
    pub guests: Vec<G>,
    pub dependencies: Vec<Dependency>,
}

impl<G> DependencyCollection<G> {
    pub fn new(guest: G) -> Self {
        Self {
            guests: vec![guest],
            dependencies: Vec::new(),
        }
    }

    pub fn extend<I>(&mut self, dependencies: I)
    where
        I: IntoIterator<Item = Dependency>,
    {
        self.dependencies.extend(dependencies);
    }

    /// The package set this collection stands for.
    pub fn key(&self) -> BTreeSet<Dependency> {
        self.dependencies.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// Drop repeated entries, keeping the first occurrence of each.
pub fn dedup_dependencies(dependencies: &[Dependency]) -> Vec<Dependency> {
    let mut seen = HashSet::new();
    dependencies
        .iter()
        .filter(|dependency| seen.insert(*dependency))
        .cloned()
        .collect()
}

/// Merge collections with equal package sets.
///
/// Groups appear in the order their first guest appeared, guests keep their
/// relative order, and pruning an already pruned list changes nothing.
pub fn prune<G>(collections: Vec<DependencyCollection<G>>) -> Vec<DependencyCollection<G>> {
    let mut groups: Vec<DependencyCollection<G>> = Vec::new();
    let mut index: BTreeMap<BTreeSet<Dependency>, usize> = BTreeMap::new();

    for collection in collections {
        let dependencies = dedup_dependencies(&collection.dependencies);
        let key: BTreeSet<Dependency> = dependencies.iter().cloned().collect();

        match index.get(&key) {
            Some(position) => groups[*position].guests.extend(collection.guests),
            None => {
                index.insert(key, groups.len());
                groups.push(DependencyCollection {
                    guests: collection.guests,
                    dependencies,
                });
            }
        }
    }

    groups
}
