//! Per-test execution context
//!
//! Gives a test body its fixtures and the sinks its output is captured into.

use std::any::Any;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::fixture::Resources;
use crate::models::OutputRefs;

/// Directory holding the captured output of the test with `uid`
pub fn output_dir_for(root: &Path, uid: &str) -> PathBuf {
    root.join(uid.replace('/', "-"))
}

enum Stream {
    File(File),
    Discard(io::Sink),
}

impl Stream {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Stream::File(file) => file,
            Stream::Discard(sink) => sink,
        }
    }

    fn stdio(&self) -> io::Result<Stdio> {
        match self {
            Stream::File(file) => Ok(Stdio::from(file.try_clone()?)),
            Stream::Discard(_) => Ok(Stdio::null()),
        }
    }
}

/// Capture of a test's stdout/stderr into dedicated files. Flushed when
/// dropped, on every exit path of the test.
pub struct OutputCapture {
    refs: Option<OutputRefs>,
    stdout: Stream,
    stderr: Stream,
}

impl OutputCapture {
    /// Open `<root>/<uid>/{stdout,stderr}`, truncating earlier output.
    pub fn open(root: &Path, uid: &str) -> io::Result<Self> {
        let dir = output_dir_for(root, uid);
        fs::create_dir_all(&dir)?;

        let refs = OutputRefs {
            stdout: dir.join("stdout"),
            stderr: dir.join("stderr"),
        };
        let stdout = File::create(&refs.stdout)?;
        let stderr = File::create(&refs.stderr)?;

        Ok(Self {
            refs: Some(refs),
            stdout: Stream::File(stdout),
            stderr: Stream::File(stderr),
        })
    }

    /// Capture that throws output away
    pub fn discard() -> Self {
        Self {
            refs: None,
            stdout: Stream::Discard(io::sink()),
            stderr: Stream::Discard(io::sink()),
        }
    }

    pub fn refs(&self) -> Option<&OutputRefs> {
        self.refs.as_ref()
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        let _ = self.stdout.writer().flush();
        let _ = self.stderr.writer().flush();
    }
}

/// What a test body sees while it runs
pub struct TestContext {
    uid: String,
    resources: Resources,
    capture: OutputCapture,
}

impl TestContext {
    pub fn new(uid: impl Into<String>, resources: Resources, capture: OutputCapture) -> Self {
        Self {
            uid: uid.into(),
            resources,
            capture,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Typed access to a bound fixture
    pub fn resource<T: Any>(&self, name: &str) -> Option<&T> {
        self.resources.get::<T>(name)
    }

    pub fn stdout(&mut self) -> &mut dyn Write {
        self.capture.stdout.writer()
    }

    pub fn stderr(&mut self) -> &mut dyn Write {
        self.capture.stderr.writer()
    }

    /// Child-process handle writing into the captured stdout
    pub fn stdout_stdio(&self) -> io::Result<Stdio> {
        self.capture.stdout.stdio()
    }

    pub fn stderr_stdio(&self) -> io::Result<Stdio> {
        self.capture.stderr.stdio()
    }

    /// Directory holding captured output, when capture goes to disk
    pub fn output_dir(&self) -> Option<&Path> {
        self.capture.refs().and_then(|r| r.stdout.parent())
    }
}
