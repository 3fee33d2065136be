use crate::build::spec::Build;

use serde::{Deserialize, Serialize};

/// A set of builds executed in parallel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildGroup {
    pub builds: Vec<Build>,
}

impl BuildGroup {
    pub fn new(builds: Vec<Build>) -> Self {
        Self { builds }
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.builds.len()
    }
}

/// Ordered groups; group N+1 starts only after group N reached a terminal
/// state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildGroups(pub Vec<BuildGroup>);

impl BuildGroups {
    pub fn new(groups: Vec<BuildGroup>) -> Self {
        Self(groups)
    }

    /// Wraps a flat list of builds into a single parallel group - the shape
    /// v1 plugins deliver.
    pub fn single(builds: Vec<Build>) -> Self {
        Self(vec![BuildGroup::new(builds)])
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuildGroup> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(BuildGroup::is_empty)
    }

    pub fn total_builds(&self) -> usize {
        self.0.iter().map(BuildGroup::len).sum()
    }
}

impl IntoIterator for BuildGroups {
    type Item = BuildGroup;
    type IntoIter = std::vec::IntoIter<BuildGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
