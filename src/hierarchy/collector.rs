//! Explicit test registration
//!
//! Loaders hand suites and fixtures to a [`Collector`]; nothing is
//! registered implicitly.

use std::collections::{BTreeSet, HashSet};

use super::{HierarchyError, TestCase, TestSuite};
use crate::fixture::{ResourceManager, ResourceSpec};

/// Registration context threaded through collection code
#[derive(Debug, Default)]
pub struct Collector {
    module: String,
    suites: Vec<TestSuite>,
    resources: Vec<ResourceSpec>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module path stamped onto suites registered from now on
    pub fn module(&mut self, path: impl Into<String>) -> &mut Self {
        self.module = path.into();
        self
    }

    pub fn resource(&mut self, spec: ResourceSpec) -> &mut Self {
        self.resources.push(spec);
        self
    }

    pub fn suite(&mut self, mut suite: TestSuite) -> &mut Self {
        suite.stamp_module(&self.module);
        self.suites.push(suite);
        self
    }

    /// Validate uids and fixture references and freeze the tree.
    pub fn finish(self) -> Result<TestTree, HierarchyError> {
        let tree = TestTree {
            suites: self.suites,
            resources: self.resources,
        };
        tree.validate()?;
        Ok(tree)
    }
}

/// Reference to an item found by uid
#[derive(Clone, Copy, Debug)]
pub enum ItemRef<'a> {
    Suite(&'a TestSuite),
    Case {
        suite: &'a TestSuite,
        case: &'a TestCase,
    },
}

impl ItemRef<'_> {
    /// Fixtures bound by the item's suite and by the cases it runs
    pub fn resource_names(&self) -> Vec<String> {
        match self {
            ItemRef::Suite(suite) => suite
                .resources
                .iter()
                .chain(suite.cases().into_iter().flat_map(|c| c.resources.iter()))
                .map(|b| b.resource.clone())
                .collect(),
            ItemRef::Case { suite, case } => suite
                .resources
                .iter()
                .chain(case.resources.iter())
                .map(|b| b.resource.clone())
                .collect(),
        }
    }
}

/// Fixture names bound by `items`, first use first
pub fn bound_resources<'a>(items: impl IntoIterator<Item = ItemRef<'a>>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .flat_map(|item| item.resource_names())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Collected, validated tests and fixtures
#[derive(Clone, Debug, Default)]
pub struct TestTree {
    suites: Vec<TestSuite>,
    resources: Vec<ResourceSpec>,
}

impl TestTree {
    pub fn suites(&self) -> &[TestSuite] {
        &self.suites
    }

    pub fn resource_specs(&self) -> &[ResourceSpec] {
        &self.resources
    }

    /// Fresh fixture manager for one run over this tree
    pub fn resource_manager(&self) -> Result<ResourceManager, HierarchyError> {
        Ok(ResourceManager::new(self.resources.iter().cloned())?)
    }

    /// All cases with their suites, in collection order
    pub fn cases(&self) -> impl Iterator<Item = (&TestSuite, &TestCase)> {
        self.suites
            .iter()
            .flat_map(|suite| suite.cases().into_iter().map(move |case| (suite, case)))
    }

    pub fn case_count(&self) -> usize {
        self.cases().count()
    }

    pub fn find(&self, uid: &str) -> Option<ItemRef<'_>> {
        for suite in &self.suites {
            if suite.uid() == uid {
                return Some(ItemRef::Suite(suite));
            }
            if let Some(case) = suite.cases().into_iter().find(|c| c.uid() == uid) {
                return Some(ItemRef::Case { suite, case });
            }
        }
        None
    }

    /// Fixture names referenced by any suite or case, first use first
    pub fn referenced_resources(&self) -> Vec<String> {
        bound_resources(self.suites.iter().map(ItemRef::Suite))
    }

    /// Keep only cases carrying at least one of `tags` (suite tags count).
    pub fn filter_tags(&self, tags: &[String]) -> TestTree {
        if tags.is_empty() {
            return self.clone();
        }
        let wanted: BTreeSet<&str> = tags.iter().map(String::as_str).collect();

        let suites = self
            .suites
            .iter()
            .filter_map(|suite| {
                suite.retain_cases(&|case: &TestCase| {
                    suite
                        .effective_tags(case)
                        .iter()
                        .any(|t| wanted.contains(t.as_str()))
                })
            })
            .collect();

        TestTree {
            suites,
            resources: self.resources.clone(),
        }
    }

    fn validate(&self) -> Result<(), HierarchyError> {
        let known: HashSet<&str> = self.resources.iter().map(|r| r.name.as_str()).collect();
        let mut uids = HashSet::new();

        for suite in &self.suites {
            let suite_uid = suite.uid();
            if !uids.insert(suite_uid.clone()) {
                return Err(HierarchyError::DuplicateUid(suite_uid));
            }
            check_bindings(&suite_uid, suite.resources.iter(), &known)?;

            for case in suite.cases() {
                let uid = case.uid();
                if !uids.insert(uid.clone()) {
                    return Err(HierarchyError::DuplicateUid(uid));
                }
                check_bindings(&uid, case.resources.iter(), &known)?;
            }
        }

        // Surfaces duplicate fixture names and dependency cycles at collection time.
        self.resource_manager()?;
        Ok(())
    }
}

fn check_bindings<'a>(
    uid: &str,
    bindings: impl Iterator<Item = &'a super::Binding>,
    known: &HashSet<&str>,
) -> Result<(), HierarchyError> {
    for binding in bindings {
        if !known.contains(binding.resource.as_str()) {
            return Err(HierarchyError::UnknownResource {
                uid: uid.to_string(),
                resource: binding.resource.clone(),
            });
        }
    }
    Ok(())
}
