//! Result sinks
//!
//! Observers of result events. The engine calls every attached sink in
//! attachment order before moving on to the next case.

mod console;
mod storage;

pub use console::ConsoleSink;
pub use storage::{ResultsStorage, StorageSink, StoredRun, RESULTS_FILE};

use parking_lot::Mutex;
use std::sync::Arc;

use crate::models::{RunSummary, TestResult};

/// Receiver of result events
pub trait ResultSink: Send {
    fn on_run_start(&mut self) {}

    fn on_result(&mut self, result: &TestResult);

    fn on_run_end(&mut self, _summary: &RunSummary) {}
}

/// Shared, cloneable set of sinks
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Arc<Mutex<Vec<Box<dyn ResultSink>>>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: impl ResultSink + 'static) -> &Self {
        self.sinks.lock().push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn run_start(&self) {
        for sink in self.sinks.lock().iter_mut() {
            sink.on_run_start();
        }
    }

    pub fn result(&self, result: &TestResult) {
        for sink in self.sinks.lock().iter_mut() {
            sink.on_result(result);
        }
    }

    pub fn run_end(&self, summary: &RunSummary) {
        for sink in self.sinks.lock().iter_mut() {
            sink.on_run_end(summary);
        }
    }
}

/// Sink keeping every result in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    results: Arc<Mutex<Vec<TestResult>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<TestResult> {
        self.results.lock().clone()
    }

    pub fn uids(&self) -> Vec<String> {
        self.results.lock().iter().map(|r| r.uid.clone()).collect()
    }
}

impl ResultSink for MemorySink {
    fn on_result(&mut self, result: &TestResult) {
        self.results.lock().push(result.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counting {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ResultSink for Counting {
        fn on_run_start(&mut self) {
            self.events.lock().push("start");
        }

        fn on_result(&mut self, _result: &TestResult) {
            self.events.lock().push("result");
        }

        fn on_run_end(&mut self, _summary: &RunSummary) {
            self.events.lock().push("end");
        }
    }

    #[test]
    fn test_every_sink_receives_events() {
        let sinks = SinkSet::new();
        let memory = MemorySink::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        sinks.attach(memory.clone()).attach(Counting {
            events: events.clone(),
        });
        assert_eq!(sinks.len(), 2);

        let result = TestResult::pass("m:TestCase:a", "a", 3);
        sinks.run_start();
        sinks.result(&result);
        sinks.run_end(&RunSummary::new(vec![result]));

        assert_eq!(memory.uids(), vec!["m:TestCase:a"]);
        assert_eq!(*events.lock(), vec!["start", "result", "end"]);
    }

    #[test]
    fn test_clones_share_sinks() {
        let sinks = SinkSet::new();
        let clone = sinks.clone();
        let memory = MemorySink::new();
        clone.attach(memory.clone());

        sinks.result(&TestResult::skip("m:TestCase:b", "b", "no gpu"));
        assert_eq!(memory.results().len(), 1);
    }
}
