//! Wall-clock timing for tests, suites and fixture builds

use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        millis(self.start.elapsed())
    }

    /// Log the elapsed time and return it in milliseconds
    pub fn finish(self) -> u64 {
        let ms = self.elapsed_ms();
        debug!("{} took {}ms", self.label, ms);
        ms
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_timer() {
        let timer = Timer::start("fixture gem5");
        sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10);
        assert!(timer.finish() >= 10);
    }
}
