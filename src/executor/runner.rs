//! Test execution runner
//!
//! Walks suites in collection order, runs each case with its fixtures and
//! applies the fail-fast rules of suites, lists and the run itself.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::context::{OutputCapture, TestContext};
use crate::fixture::{ResourceManager, Resources, Scope};
use crate::hierarchy::{
    bound_resources, HierarchyError, Item, ItemRef, TestCase, TestList, TestSuite, TestTree,
};
use crate::models::{aggregate, Outcome, RunSummary, TestResult, TestStatus};
use crate::results::SinkSet;
use crate::utils::{panic_message, Timer};

/// Whether traversal continues after a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Run-wide fail-fast tripped; nothing else may start
    Abort,
}

/// Runner options
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Abort the whole run on the first failure
    pub fail_fast: bool,
    /// Root directory of captured output; output is discarded when unset
    pub result_path: Option<PathBuf>,
}

struct SuiteWalk<'a> {
    suite: &'a TestSuite,
    results: &'a mut Vec<TestResult>,
    skip_reason: Option<String>,
}

/// Sequential test engine
pub struct Runner {
    resources: Arc<ResourceManager>,
    sinks: SinkSet,
    options: RunOptions,
}

impl Runner {
    pub fn new(resources: Arc<ResourceManager>, sinks: SinkSet) -> Self {
        Self {
            resources,
            sinks,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Run every suite of the tree
    pub fn run(&self, tree: &TestTree) -> RunSummary {
        let items = tree.suites().iter().map(ItemRef::Suite).collect();
        self.run_items(items)
    }

    /// Run the suites or cases named by `uids`, in the given order
    pub fn run_uids(&self, tree: &TestTree, uids: &[String]) -> Result<RunSummary, HierarchyError> {
        let items = uids
            .iter()
            .map(|uid| {
                tree.find(uid)
                    .ok_or_else(|| HierarchyError::UnknownUid(uid.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.run_items(items))
    }

    /// Build the non-lazy fixtures the tree references. Failures are only
    /// logged; cases requiring a failed fixture report an error later.
    pub fn build_eager(&self, tree: &TestTree) {
        self.build_eager_named(&tree.referenced_resources());
    }

    fn build_eager_named(&self, names: &[String]) {
        let failures = self.resources.build_eager(names.iter().map(String::as_str));
        for failure in &failures {
            error!("{}", failure);
        }
    }

    fn run_items(&self, items: Vec<ItemRef<'_>>) -> RunSummary {
        let timer = Timer::start("run");
        self.sinks.run_start();
        info!("Building non-lazy fixtures of the selected tests");
        self.build_eager_named(&bound_resources(items.iter().copied()));

        let mut results = Vec::new();
        for item in items {
            if self.run_item(item, &mut results) == Flow::Abort {
                info!("Fail fast: ignoring remaining tests");
                break;
            }
        }

        self.resources.shutdown();
        let summary = RunSummary::new(results);
        info!(
            "Run completed in {}ms - {} ({}/{} passed)",
            timer.elapsed_ms(),
            summary.outcome(),
            summary.passed,
            summary.total
        );
        self.sinks.run_end(&summary);
        summary
    }

    /// Run one unit, appending its results. Emits result events but no run
    /// start or end events.
    pub fn run_item(&self, item: ItemRef<'_>, results: &mut Vec<TestResult>) -> Flow {
        match item {
            ItemRef::Suite(suite) => self.run_suite(suite, results),
            ItemRef::Case { suite, case } => {
                let pinned = self.pin(suite, &[case]);
                let status = self.run_case(suite, case, results);
                self.unpin(&pinned);

                if status.is_failure() && self.options.fail_fast {
                    Flow::Abort
                } else {
                    Flow::Continue
                }
            }
        }
    }

    fn run_suite(&self, suite: &TestSuite, results: &mut Vec<TestResult>) -> Flow {
        info!("Running suite {}", suite.uid());
        let timer = Timer::start(suite.uid());
        let first = results.len();
        let pinned = self.pin(suite, &suite.cases());

        let mut walk = SuiteWalk {
            suite,
            results,
            skip_reason: None,
        };
        let flow = self.run_list(&mut walk, &suite.tests);

        self.unpin(&pinned);

        let outcome = aggregate(walk.results[first..].iter().map(|r| r.status));
        info!(
            "Suite {} {} in {}ms",
            suite.name,
            outcome,
            timer.elapsed_ms()
        );
        flow
    }

    fn run_list(&self, walk: &mut SuiteWalk<'_>, list: &TestList) -> Flow {
        for (idx, item) in list.items.iter().enumerate() {
            let case = match item {
                Item::List(inner) => {
                    if self.run_list(walk, inner) == Flow::Abort {
                        return Flow::Abort;
                    }
                    continue;
                }
                Item::Case(case) => case,
            };

            if let Some(reason) = walk.skip_reason.clone() {
                self.emit_skip(walk, case, &reason);
                continue;
            }

            let status = self.run_case(walk.suite, case, walk.results);
            if !status.is_failure() {
                continue;
            }
            if self.options.fail_fast {
                return Flow::Abort;
            }

            let reason = format!(
                "previous test '{}' failed in a fail_fast list",
                case.display_name()
            );
            if walk.suite.fail_fast {
                walk.skip_reason = Some(reason);
            } else if list.fail_fast {
                for rest in &list.items[idx + 1..] {
                    self.skip_item(walk, rest, &reason);
                }
                return Flow::Continue;
            }
        }
        Flow::Continue
    }

    fn skip_item(&self, walk: &mut SuiteWalk<'_>, item: &Item, reason: &str) {
        match item {
            Item::Case(case) => self.emit_skip(walk, case, reason),
            Item::List(list) => {
                for item in &list.items {
                    self.skip_item(walk, item, reason);
                }
            }
        }
    }

    fn emit_skip(&self, walk: &mut SuiteWalk<'_>, case: &TestCase, reason: &str) {
        let result = TestResult::skip(case.uid(), case.display_name(), reason);
        debug!("  {}", result);
        self.sinks.result(&result);
        walk.results.push(result);
    }

    /// Run a single case: capture, fixtures, body, release, report.
    fn run_case(
        &self,
        suite: &TestSuite,
        case: &TestCase,
        results: &mut Vec<TestResult>,
    ) -> TestStatus {
        let uid = case.uid();
        let timer = Timer::start(uid.clone());
        debug!("Running {}", uid);

        let capture = match &self.options.result_path {
            Some(root) => OutputCapture::open(root, &uid).unwrap_or_else(|e| {
                warn!("Could not capture output of {}: {}", uid, e);
                OutputCapture::discard()
            }),
            None => OutputCapture::discard(),
        };
        let output = capture.refs().cloned();

        let mut acquired = Vec::new();
        let mut resources = Resources::new();
        let mut failure = None;
        for binding in suite.effective_resources(case) {
            match self.resources.acquire(&binding.resource) {
                Ok(handle) => {
                    resources.insert(binding.name, handle);
                    acquired.push(binding.resource);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let outcome = match failure {
            Some(e) => Outcome::Error(e.to_string()),
            None => {
                let mut ctx = TestContext::new(uid.clone(), resources, capture);
                let body = case.body().clone();
                panic::catch_unwind(AssertUnwindSafe(|| body(&mut ctx)))
                    .unwrap_or_else(|payload| Outcome::Fail(panic_message(payload.as_ref())))
            }
        };

        for name in acquired.iter().rev() {
            self.resources.release(name);
        }

        let mut result =
            TestResult::from_outcome(uid, case.display_name(), outcome, timer.elapsed_ms());
        if let Some(output) = output {
            result = result.with_output(output);
        }
        info!("  {}", result);

        let status = result.status;
        self.sinks.result(&result);
        results.push(result);
        status
    }

    /// Pin the suite's fixtures, plus suite-scoped fixtures its cases bind,
    /// for the duration of the suite.
    fn pin(&self, suite: &TestSuite, cases: &[&TestCase]) -> Vec<String> {
        let case_bindings = cases.iter().flat_map(|case| case.resources.iter()).filter(|b| {
            self.resources
                .spec(&b.resource)
                .is_some_and(|spec| spec.scope == Scope::Suite)
        });

        let mut pinned: Vec<String> = Vec::new();
        for binding in suite.resources.iter().chain(case_bindings) {
            if pinned.contains(&binding.resource) {
                continue;
            }
            match self.resources.retain(&binding.resource) {
                Ok(()) => pinned.push(binding.resource.clone()),
                Err(e) => warn!("Could not pin fixture for {}: {}", suite.uid(), e),
            }
        }
        pinned
    }

    fn unpin(&self, pinned: &[String]) {
        for name in pinned.iter().rev() {
            self.resources.release(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FnResource, ResourceSpec, ResourceState};
    use crate::hierarchy::Collector;
    use crate::results::MemorySink;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn pass(name: &str) -> TestCase {
        TestCase::new(name, |_| Outcome::Pass)
    }

    fn fail(name: &str) -> TestCase {
        TestCase::new(name, |_| Outcome::fail("assertion failed"))
    }

    fn tree_of(suites: Vec<TestSuite>, specs: Vec<ResourceSpec>) -> TestTree {
        let mut collector = Collector::new();
        collector.module("m");
        for spec in specs {
            collector.resource(spec);
        }
        for suite in suites {
            collector.suite(suite);
        }
        collector.finish().unwrap()
    }

    fn run_tree(tree: &TestTree, options: RunOptions) -> (RunSummary, MemorySink) {
        let sinks = SinkSet::new();
        let memory = MemorySink::new();
        sinks.attach(memory.clone());
        let manager = Arc::new(tree.resource_manager().unwrap());
        let summary = Runner::new(manager, sinks).with_options(options).run(tree);
        (summary, memory)
    }

    fn statuses(summary: &RunSummary) -> Vec<(String, TestStatus)> {
        summary
            .results
            .iter()
            .map(|r| (r.name.clone(), r.status))
            .collect()
    }

    #[test]
    fn test_fail_fast_list_skips_rest_of_list_only() {
        let suite = TestSuite::new("s")
            .list(TestList::new().fail_fast().case(pass("a")).case(fail("b")).case(pass("c")))
            .case(pass("d"));
        let tree = tree_of(vec![suite], vec![]);

        let (summary, memory) = run_tree(&tree, RunOptions::default());
        assert_eq!(
            statuses(&summary),
            vec![
                ("a".to_string(), TestStatus::Pass),
                ("b".to_string(), TestStatus::Fail),
                ("c".to_string(), TestStatus::Skip),
                ("d".to_string(), TestStatus::Pass),
            ]
        );
        assert_eq!(
            summary.results[2].message.as_deref(),
            Some("previous test 'b' failed in a fail_fast list")
        );
        assert_eq!(memory.results().len(), 4);
    }

    #[test]
    fn test_nested_list_reacts_to_direct_cases_only() {
        let suite = TestSuite::new("s").list(
            TestList::new()
                .case(fail("x"))
                .list(TestList::new().fail_fast().case(pass("y")).case(pass("z"))),
        );
        let tree = tree_of(vec![suite], vec![]);

        let (summary, _) = run_tree(&tree, RunOptions::default());
        let names: Vec<_> = summary
            .results
            .iter()
            .filter(|r| r.status == TestStatus::Pass)
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, vec!["y", "z"]);
    }

    #[test]
    fn test_inner_fail_fast_resumes_after_inner_list() {
        let suite = TestSuite::new("s").list(
            TestList::new()
                .fail_fast()
                .list(TestList::new().fail_fast().case(fail("p")).case(pass("q")))
                .case(pass("r")),
        );
        let tree = tree_of(vec![suite], vec![]);

        let (summary, _) = run_tree(&tree, RunOptions::default());
        assert_eq!(
            statuses(&summary),
            vec![
                ("p".to_string(), TestStatus::Fail),
                ("q".to_string(), TestStatus::Skip),
                ("r".to_string(), TestStatus::Pass),
            ]
        );
    }

    #[test]
    fn test_suite_fail_fast_skips_across_lists() {
        let suite = TestSuite::new("s")
            .fail_fast()
            .list(TestList::new().case(fail("a")).case(pass("b")))
            .case(pass("c"));
        let other = TestSuite::new("t").case(pass("d"));
        let tree = tree_of(vec![suite, other], vec![]);

        let (summary, _) = run_tree(&tree, RunOptions::default());
        assert_eq!(
            statuses(&summary),
            vec![
                ("a".to_string(), TestStatus::Fail),
                ("b".to_string(), TestStatus::Skip),
                ("c".to_string(), TestStatus::Skip),
                ("d".to_string(), TestStatus::Pass),
            ]
        );
    }

    #[test]
    fn test_global_fail_fast_stops_without_events() {
        let tree = tree_of(
            vec![
                TestSuite::new("s").case(pass("a")).case(fail("b")).case(pass("c")),
                TestSuite::new("t").case(pass("d")),
            ],
            vec![],
        );

        let options = RunOptions {
            fail_fast: true,
            ..Default::default()
        };
        let (summary, memory) = run_tree(&tree, options);
        assert_eq!(summary.total, 2);
        assert_eq!(memory.uids(), vec!["m:TestCase:a", "m:TestCase:b"]);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_panicking_body_fails_and_run_continues() {
        let tree = tree_of(
            vec![TestSuite::new("s")
                .case(TestCase::new("boom", |_| panic!("index out of range")))
                .case(pass("after"))],
            vec![],
        );

        let (summary, _) = run_tree(&tree, RunOptions::default());
        assert_eq!(summary.results[0].status, TestStatus::Fail);
        assert_eq!(
            summary.results[0].message.as_deref(),
            Some("index out of range")
        );
        assert_eq!(summary.results[1].status, TestStatus::Pass);
    }

    #[test]
    fn test_skip_outcome_is_not_a_failure() {
        let suite = TestSuite::new("s").list(
            TestList::new()
                .fail_fast()
                .case(TestCase::new("a", |_| Outcome::skip("no gpu")))
                .case(pass("b")),
        );
        let tree = tree_of(vec![suite], vec![]);

        let (summary, _) = run_tree(&tree, RunOptions::default());
        assert_eq!(summary.results[0].message.as_deref(), Some("no gpu"));
        assert_eq!(summary.results[1].status, TestStatus::Pass);
        assert!(summary.is_success());
    }

    #[test]
    fn test_fixture_failure_is_error_and_sticky() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let spec = ResourceSpec::from_fn("gem5", move |_| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("scons exited with 2")
        })
        .build_once();

        let tree = tree_of(
            vec![TestSuite::new("s")
                .case(pass("a").require("gem5"))
                .case(pass("b").require("gem5"))
                .case(pass("c"))],
            vec![spec],
        );

        let (summary, _) = run_tree(&tree, RunOptions::default());
        assert_eq!(summary.results[0].status, TestStatus::Error);
        assert_eq!(summary.results[1].status, TestStatus::Error);
        assert_eq!(summary.results[2].status, TestStatus::Pass);
        assert!(summary.results[0]
            .message
            .as_deref()
            .unwrap()
            .contains("scons exited with 2"));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(summary.outcome(), TestStatus::Error);
    }

    #[test]
    fn test_eager_failure_does_not_abort_run() {
        let spec = ResourceSpec::from_fn("broken", |_| -> anyhow::Result<()> {
            anyhow::bail!("no compiler")
        })
        .eager();
        let tree = tree_of(
            vec![TestSuite::new("s")
                .case(pass("uses").require("broken"))
                .case(pass("plain"))],
            vec![spec],
        );

        let (summary, _) = run_tree(&tree, RunOptions::default());
        assert_eq!(summary.results[0].status, TestStatus::Error);
        assert_eq!(summary.results[1].status, TestStatus::Pass);
    }

    #[test]
    fn test_case_binding_overrides_suite_binding() {
        let tree = tree_of(
            vec![TestSuite::new("s")
                .require_as("cpu", "atomic")
                .case(TestCase::new("default", |ctx| {
                    match ctx.resource::<&str>("cpu") {
                        Some(&"atomic") => Outcome::Pass,
                        other => Outcome::fail(format!("got {other:?}")),
                    }
                }))
                .case(
                    TestCase::new("override", |ctx| match ctx.resource::<&str>("cpu") {
                        Some(&"o3") => Outcome::Pass,
                        other => Outcome::fail(format!("got {other:?}")),
                    })
                    .require_as("cpu", "o3"),
                )],
            vec![
                ResourceSpec::from_fn("atomic", |_| Ok("atomic")),
                ResourceSpec::from_fn("o3", |_| Ok("o3")),
            ],
        );

        let (summary, _) = run_tree(&tree, RunOptions::default());
        assert!(summary.is_success(), "{summary:?}");
    }

    #[test]
    fn test_suite_fixture_lives_for_the_suite() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (setup_log, teardown_log) = (events.clone(), events.clone());
        let spec = ResourceSpec::new(
            "workdir",
            FnResource::new(move |_| {
                setup_log.lock().push("setup".to_string());
                Ok(())
            })
            .on_teardown(move |_| {
                teardown_log.lock().push("teardown".to_string());
                Ok(())
            }),
        )
        .scope(Scope::Suite);

        let log = events.clone();
        let tree = tree_of(
            vec![TestSuite::new("s")
                .require("workdir")
                .case(TestCase::new("a", move |_| {
                    log.lock().push("a".to_string());
                    Outcome::Pass
                }))
                .case(pass("b"))],
            vec![spec],
        );

        let (summary, _) = run_tree(&tree, RunOptions::default());
        assert!(summary.is_success());
        assert_eq!(*events.lock(), vec!["setup", "a", "teardown"]);
    }

    #[test]
    fn test_case_fixture_rebuilt_per_case() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let spec = ResourceSpec::from_fn("scratch", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let tree = tree_of(
            vec![TestSuite::new("s")
                .case(pass("a").require("scratch"))
                .case(pass("b").require("scratch"))],
            vec![spec],
        );
        let manager = Arc::new(tree.resource_manager().unwrap());
        let summary = Runner::new(manager.clone(), SinkSet::new()).run(&tree);

        assert!(summary.is_success());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state("scratch"), Some(ResourceState::TornDown));
    }

    #[test]
    fn test_output_captured_per_test() {
        let root = tempdir().unwrap();
        let tree = tree_of(
            vec![TestSuite::new("s").case(TestCase::new("talk", |ctx| {
                writeln!(ctx.stdout(), "simulated 42 ticks").unwrap();
                writeln!(ctx.stderr(), "warn: slow").unwrap();
                Outcome::Pass
            }))],
            vec![],
        );

        let options = RunOptions {
            result_path: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let (summary, _) = run_tree(&tree, options);

        let output = summary.results[0].output.clone().unwrap();
        assert_eq!(
            output.stdout,
            root.path().join("m:TestCase:talk").join("stdout")
        );
        assert_eq!(
            std::fs::read_to_string(&output.stdout).unwrap(),
            "simulated 42 ticks\n"
        );
        assert_eq!(
            std::fs::read_to_string(&output.stderr).unwrap(),
            "warn: slow\n"
        );
    }

    #[test]
    fn test_run_uids_targets_single_case_with_suite_fixtures() {
        let tree = tree_of(
            vec![TestSuite::new("s")
                .require("base")
                .case(pass("a"))
                .case(TestCase::new("b", |ctx| {
                    if ctx.resources().contains("base") {
                        Outcome::Pass
                    } else {
                        Outcome::fail("missing base")
                    }
                }))],
            vec![ResourceSpec::from_fn("base", |_| Ok(()))],
        );

        let manager = Arc::new(tree.resource_manager().unwrap());
        let runner = Runner::new(manager, SinkSet::new());
        let summary = runner
            .run_uids(&tree, &["m:TestCase:b".to_string()])
            .unwrap();
        assert_eq!(summary.total, 1);
        assert!(summary.is_success());

        assert!(matches!(
            runner.run_uids(&tree, &["m:TestCase:nope".to_string()]),
            Err(HierarchyError::UnknownUid(_))
        ));
    }

    #[test]
    fn test_run_uids_builds_only_selected_eager_fixtures() {
        let built = Arc::new(Mutex::new(Vec::new()));
        let eager = |name: &'static str| {
            let built = built.clone();
            ResourceSpec::from_fn(name, move |_| {
                built.lock().push(name);
                Ok(())
            })
            .eager()
        };
        let tree = tree_of(
            vec![
                TestSuite::new("boot").require("kernel").case(pass("hello")),
                TestSuite::new("gpu").case(pass("shader").require("toolchain")),
            ],
            vec![eager("kernel"), eager("toolchain")],
        );

        let manager = Arc::new(tree.resource_manager().unwrap());
        let runner = Runner::new(manager, SinkSet::new());
        let summary = runner
            .run_uids(&tree, &["m:TestCase:hello".to_string()])
            .unwrap();

        assert!(summary.is_success());
        assert_eq!(*built.lock(), vec!["kernel"]);
    }
}
