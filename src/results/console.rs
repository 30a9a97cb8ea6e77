//! Console output of results

use std::io::{self, Write};

use super::ResultSink;
use crate::models::{RunSummary, TestResult, TestStatus};

/// Prints one line per result and a summary box at the end of the run
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
    colorize: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::with_writer(io::stdout())
    }

    pub fn with_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn status_label(&self, status: TestStatus) -> &'static str {
        if self.colorize {
            match status {
                TestStatus::Pass => "\x1b[32m✓ PASS\x1b[0m",
                TestStatus::Fail => "\x1b[31m✗ FAIL\x1b[0m",
                TestStatus::Skip => "\x1b[33m○ SKIP\x1b[0m",
                TestStatus::Error => "\x1b[31m! ERROR\x1b[0m",
            }
        } else {
            match status {
                TestStatus::Pass => "✓ PASS",
                TestStatus::Fail => "✗ FAIL",
                TestStatus::Skip => "○ SKIP",
                TestStatus::Error => "! ERROR",
            }
        }
    }

    pub fn format_result(&self, result: &TestResult) -> String {
        let mut line = format!(
            "{} {} [{:>6}ms]",
            self.status_label(result.status),
            result.uid,
            result.duration_ms
        );
        if let Some(message) = &result.message {
            line.push_str(&format!("\n    {message}"));
        }
        line
    }

    pub fn format_summary(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        let pass_str = if self.colorize {
            format!("\x1b[32m{}\x1b[0m", summary.passed)
        } else {
            summary.passed.to_string()
        };
        let fail_str = if self.colorize && summary.failed + summary.errors > 0 {
            format!("\x1b[31m{}\x1b[0m", summary.failed)
        } else {
            summary.failed.to_string()
        };

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!(
            "║  Outcome: {:50} ║\n",
            summary.outcome().to_string()
        ));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        output.push_str(&format!(
            "║  Total: {:3} | Pass: {} | Fail: {} | Skip: {:3} | Error: {:3}\n",
            summary.total, pass_str, fail_str, summary.skipped, summary.errors
        ));
        output.push_str(&format!(
            "║  Pass Rate: {:5.1}% | Duration: {:8}ms\n",
            summary.pass_rate(),
            summary.total_duration_ms
        ));
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultSink for ConsoleSink {
    fn on_result(&mut self, result: &TestResult) {
        let line = self.format_result(result);
        let _ = writeln!(self.out, "{line}");
    }

    fn on_run_end(&mut self, summary: &RunSummary) {
        let text = self.format_summary(summary);
        let _ = write!(self.out, "{text}");
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_format_result_plain() {
        let sink = ConsoleSink::with_writer(io::sink()).no_color();
        let line = sink.format_result(&TestResult::fail("m:TestCase:a", "a", 12, "boom"));
        assert!(line.starts_with("✗ FAIL m:TestCase:a"));
        assert!(line.contains("boom"));
    }

    #[test]
    fn test_prints_results_and_summary() {
        let buffer = Buffer::default();
        let mut sink = ConsoleSink::with_writer(buffer.clone()).no_color();

        let results = vec![
            TestResult::pass("m:TestCase:a", "a", 5),
            TestResult::skip("m:TestCase:b", "b", "no gpu"),
        ];
        for result in &results {
            sink.on_result(result);
        }
        sink.on_run_end(&RunSummary::new(results));

        let text = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert!(text.contains("✓ PASS m:TestCase:a"));
        assert!(text.contains("○ SKIP m:TestCase:b"));
        assert!(text.contains("Outcome: SKIP"));
        assert!(text.contains("Total:   2"));
    }
}
