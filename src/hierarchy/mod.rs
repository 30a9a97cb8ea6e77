//! Test hierarchy
//!
//! Suites own an implicit top-level [`TestList`]; lists hold cases and nested
//! lists in collection order. The tree is immutable once collected.

mod collector;

pub use collector::{bound_resources, Collector, ItemRef, TestTree};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::executor::TestContext;
use crate::fixture::ResourceError;
use crate::models::Outcome;

/// Hierarchy errors
#[derive(Error, Debug)]
pub enum HierarchyError {
    #[error("Duplicate test uid: {0}")]
    DuplicateUid(String),

    #[error("'{uid}' requires unknown resource '{resource}'")]
    UnknownResource { uid: String, resource: String },

    #[error("No test or suite with uid '{0}'")]
    UnknownUid(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Callable test body
pub type TestBody = Arc<dyn Fn(&mut TestContext) -> Outcome + Send + Sync>;

/// Binding of a fixture into a test's namespace. The test looks the fixture
/// up by `name`; `resource` is the registered fixture it resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub resource: String,
}

impl Binding {
    pub fn new(name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
        }
    }
}

/// Suite bindings overridden by case bindings of the same name. Order is
/// suite order, with new case bindings appended.
pub fn resolve_bindings(suite: &[Binding], case: &[Binding]) -> Vec<Binding> {
    let mut effective: Vec<Binding> = suite.to_vec();
    for binding in case {
        match effective.iter_mut().find(|b| b.name == binding.name) {
            Some(existing) => *existing = binding.clone(),
            None => effective.push(binding.clone()),
        }
    }
    effective
}

/// A single test
#[derive(Clone)]
pub struct TestCase {
    pub name: String,
    pub module: String,
    pub category: String,
    pub variant: Option<String>,
    pub tags: BTreeSet<String>,
    pub resources: Vec<Binding>,
    body: TestBody,
}

impl TestCase {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&mut TestContext) -> Outcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            module: String::new(),
            category: "TestCase".to_string(),
            variant: None,
            tags: BTreeSet::new(),
            resources: Vec::new(),
            body: Arc::new(body),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Variant label distinguishing generated copies of one test
    pub fn variant(mut self, label: impl Into<String>) -> Self {
        self.variant = Some(label.into());
        self
    }

    /// Bind a fixture under its own name
    pub fn require(self, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        self.require_as(resource.clone(), resource)
    }

    /// Bind a fixture under a different name
    pub fn require_as(mut self, name: impl Into<String>, resource: impl Into<String>) -> Self {
        self.resources.push(Binding::new(name, resource));
        self
    }

    pub fn display_name(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{} [{}]", self.name, variant),
            None => self.name.clone(),
        }
    }

    /// Globally unique identifier: module, category and display name
    pub fn uid(&self) -> String {
        format!("{}:{}:{}", self.module, self.category, self.display_name())
    }

    pub fn body(&self) -> &TestBody {
        &self.body
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("uid", &self.uid())
            .field("tags", &self.tags)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

/// Entry of a test list
#[derive(Clone, Debug)]
pub enum Item {
    Case(TestCase),
    List(TestList),
}

/// Ordered container of cases and nested lists. `fail_fast` skips the rest of
/// this list after a failure in one of its direct cases.
#[derive(Clone, Debug, Default)]
pub struct TestList {
    pub fail_fast: bool,
    pub items: Vec<Item>,
}

impl TestList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn case(mut self, case: TestCase) -> Self {
        self.items.push(Item::Case(case));
        self
    }

    pub fn list(mut self, list: TestList) -> Self {
        self.items.push(Item::List(list));
        self
    }

    /// Cases in pre-order
    pub fn cases(&self) -> Vec<&TestCase> {
        let mut out = Vec::new();
        collect_cases(self, &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.cases().is_empty()
    }

    fn cases_mut(&mut self) -> Vec<&mut TestCase> {
        let mut out = Vec::new();
        for item in &mut self.items {
            match item {
                Item::Case(case) => out.push(case),
                Item::List(list) => out.extend(list.cases_mut()),
            }
        }
        out
    }

    /// Copy of this list keeping only cases accepted by `keep`; lists left
    /// empty are dropped.
    fn retain_cases(&self, keep: &dyn Fn(&TestCase) -> bool) -> TestList {
        let items = self
            .items
            .iter()
            .filter_map(|item| match item {
                Item::Case(case) if keep(case) => Some(Item::Case(case.clone())),
                Item::Case(_) => None,
                Item::List(list) => {
                    let list = list.retain_cases(keep);
                    (!list.is_empty()).then_some(Item::List(list))
                }
            })
            .collect();

        TestList {
            fail_fast: self.fail_fast,
            items,
        }
    }
}

fn collect_cases<'a>(list: &'a TestList, out: &mut Vec<&'a TestCase>) {
    for item in &list.items {
        match item {
            Item::Case(case) => out.push(case),
            Item::List(list) => collect_cases(list, out),
        }
    }
}

/// Named group of tests sharing fixtures and tags
#[derive(Clone, Debug)]
pub struct TestSuite {
    pub name: String,
    pub module: String,
    pub tags: BTreeSet<String>,
    /// Skip every remaining case of the suite after a failure anywhere in it
    pub fail_fast: bool,
    pub resources: Vec<Binding>,
    pub tests: TestList,
}

impl TestSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: String::new(),
            tags: BTreeSet::new(),
            fail_fast: false,
            resources: Vec::new(),
            tests: TestList::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn require(self, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        self.require_as(resource.clone(), resource)
    }

    pub fn require_as(mut self, name: impl Into<String>, resource: impl Into<String>) -> Self {
        self.resources.push(Binding::new(name, resource));
        self
    }

    pub fn case(mut self, case: TestCase) -> Self {
        self.tests.items.push(Item::Case(case));
        self
    }

    pub fn list(mut self, list: TestList) -> Self {
        self.tests.items.push(Item::List(list));
        self
    }

    /// Replace the implicit top-level list
    pub fn with_tests(mut self, tests: TestList) -> Self {
        self.tests = tests;
        self
    }

    pub fn uid(&self) -> String {
        format!("{}:TestSuite:{}", self.module, self.name)
    }

    pub fn cases(&self) -> Vec<&TestCase> {
        self.tests.cases()
    }

    /// Fixtures a case of this suite runs with
    pub fn effective_resources(&self, case: &TestCase) -> Vec<Binding> {
        resolve_bindings(&self.resources, &case.resources)
    }

    /// Suite tags plus the case's own tags
    pub fn effective_tags(&self, case: &TestCase) -> BTreeSet<String> {
        self.tags.union(&case.tags).cloned().collect()
    }

    pub(crate) fn stamp_module(&mut self, module: &str) {
        self.module = module.to_string();
        for case in self.tests.cases_mut() {
            case.module = module.to_string();
        }
    }

    pub(crate) fn retain_cases(&self, keep: &dyn Fn(&TestCase) -> bool) -> Option<TestSuite> {
        let tests = self.tests.retain_cases(keep);
        if tests.is_empty() {
            return None;
        }
        Some(TestSuite {
            tests,
            ..self.clone()
        })
    }
}
