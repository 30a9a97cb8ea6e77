//! Shell-command fixtures and test bodies

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use tracing::debug;

use crate::executor::TestContext;
use crate::fixture::{Handle, Resource, Resources};
use crate::models::Outcome;

/// Exit status a test command uses to report a skip
pub const SKIP_EXIT_CODE: i32 = 77;

/// Environment variable carrying a bound fixture's value
pub fn fixture_var(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("TESTGRID_FIXTURE_{name}")
}

fn fixture_env(resources: &Resources) -> Vec<(String, String)> {
    resources
        .iter()
        .filter_map(|(name, handle)| {
            handle
                .downcast_ref::<String>()
                .map(|value| (fixture_var(name), value.clone()))
        })
        .collect()
}

fn shell(command: &str, dir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(dir);
    cmd
}

/// Run a fixture command, failing on a non-zero exit. Returns its stdout.
fn run_checked(command: &str, dir: &Path, env: &[(String, String)]) -> Result<String> {
    debug!("Running '{}' in {}", command, dir.display());
    let output = shell(command, dir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .output()
        .with_context(|| format!("Failed to spawn '{command}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "'{}' exited with {}: {}",
            command,
            output.status,
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Fixture whose setup and teardown are shell commands. Its value is the
/// `export` string when given, otherwise the trimmed stdout of setup.
#[derive(Clone, Debug)]
pub struct CommandResource {
    pub setup: Option<String>,
    pub teardown: Option<String>,
    pub export: Option<String>,
    pub dir: PathBuf,
}

impl Resource for CommandResource {
    fn setup(&self, deps: &Resources) -> Result<Handle> {
        let stdout = match &self.setup {
            Some(command) => run_checked(command, &self.dir, &fixture_env(deps))?,
            None => String::new(),
        };
        let value = self
            .export
            .clone()
            .unwrap_or_else(|| stdout.trim().to_string());
        Ok(Handle::new(value))
    }

    fn teardown(&self, handle: &Handle) -> Result<()> {
        let Some(command) = &self.teardown else {
            return Ok(());
        };
        let value = handle.downcast_ref::<String>().cloned().unwrap_or_default();
        run_checked(
            command,
            &self.dir,
            &[("TESTGRID_FIXTURE_VALUE".to_string(), value)],
        )?;
        Ok(())
    }

    fn export(&self, handle: &Handle) -> Option<String> {
        handle.downcast_ref::<String>().cloned()
    }

    fn adopt(&self, reference: Option<&str>) -> Result<Handle> {
        let value = reference
            .map(str::to_string)
            .or_else(|| self.export.clone())
            .unwrap_or_default();
        Ok(Handle::new(value))
    }
}

/// Outcome of a test command's exit status
pub fn outcome_for_exit(code: Option<i32>) -> Outcome {
    match code {
        Some(0) => Outcome::Pass,
        Some(SKIP_EXIT_CODE) => Outcome::skip(format!("exit status {SKIP_EXIT_CODE}")),
        Some(code) => Outcome::fail(format!("exit status {code}")),
        None => Outcome::fail("terminated by signal"),
    }
}

fn outcome_for_status(status: ExitStatus) -> Outcome {
    outcome_for_exit(status.code())
}

/// Test body running `command` through the shell with output captured
pub fn shell_case(
    command: String,
    dir: PathBuf,
) -> impl Fn(&mut TestContext) -> Outcome + Send + Sync + 'static {
    move |ctx: &mut TestContext| {
        let (stdout, stderr) = match (ctx.stdout_stdio(), ctx.stderr_stdio()) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => return Outcome::fail(format!("cannot capture output: {e}")),
        };

        let mut cmd = shell(&command, &dir);
        cmd.envs(fixture_env(ctx.resources()))
            .env("TESTGRID_UID", ctx.uid())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(output_dir) = ctx.output_dir() {
            cmd.env("TESTGRID_OUTPUT_DIR", output_dir);
        }

        match cmd.status() {
            Ok(status) => outcome_for_status(status),
            Err(e) => Outcome::fail(format!("failed to spawn '{command}': {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::OutputCapture;
    use tempfile::tempdir;

    #[test]
    fn test_fixture_var() {
        assert_eq!(fixture_var("gem5-x86.opt"), "TESTGRID_FIXTURE_GEM5_X86_OPT");
    }

    #[test]
    fn test_outcome_for_exit() {
        assert_eq!(outcome_for_exit(Some(0)), Outcome::Pass);
        assert_eq!(outcome_for_exit(Some(77)), Outcome::skip("exit status 77"));
        assert_eq!(outcome_for_exit(Some(1)), Outcome::fail("exit status 1"));
        assert_eq!(outcome_for_exit(None), Outcome::fail("terminated by signal"));
    }

    #[test]
    fn test_command_resource_value() {
        let dir = tempdir().unwrap();
        let resource = CommandResource {
            setup: Some("echo built > marker; echo ' /opt/gem5 '".to_string()),
            teardown: Some("test \"$TESTGRID_FIXTURE_VALUE\" = /opt/gem5 && rm marker".to_string()),
            export: None,
            dir: dir.path().to_path_buf(),
        };

        let handle = resource.setup(&Resources::new()).unwrap();
        assert_eq!(handle.downcast_ref::<String>().unwrap(), "/opt/gem5");
        assert!(dir.path().join("marker").exists());

        resource.teardown(&handle).unwrap();
        assert!(!dir.path().join("marker").exists());
    }

    #[test]
    fn test_failed_setup_reports_stderr() {
        let dir = tempdir().unwrap();
        let resource = CommandResource {
            setup: Some("echo 'scons: no such target' >&2; exit 2".to_string()),
            teardown: None,
            export: None,
            dir: dir.path().to_path_buf(),
        };
        let err = resource.setup(&Resources::new()).unwrap_err();
        assert!(err.to_string().contains("scons: no such target"));
    }

    #[test]
    fn test_adopt_prefers_reference() {
        let resource = CommandResource {
            setup: None,
            teardown: None,
            export: Some("build/gem5.opt".to_string()),
            dir: PathBuf::from("."),
        };
        let adopted = resource.adopt(Some("/shared/gem5.opt")).unwrap();
        assert_eq!(adopted.downcast_ref::<String>().unwrap(), "/shared/gem5.opt");
        let prebuilt = resource.prebuilt().unwrap();
        assert_eq!(prebuilt.downcast_ref::<String>().unwrap(), "build/gem5.opt");
    }

    #[test]
    fn test_shell_case_sees_fixtures_and_captures() {
        let root = tempdir().unwrap();
        let capture = OutputCapture::open(root.path(), "m:TestCase:t").unwrap();
        let stdout = capture.refs().unwrap().stdout.clone();

        let mut resources = Resources::new();
        resources.insert("gem5", Handle::new("/opt/gem5".to_string()));
        let mut ctx = TestContext::new("m:TestCase:t", resources, capture);

        let body = shell_case(
            "echo \"$TESTGRID_FIXTURE_GEM5\"; exit 77".to_string(),
            root.path().to_path_buf(),
        );
        assert_eq!(body(&mut ctx), Outcome::skip("exit status 77"));
        drop(ctx);

        assert_eq!(std::fs::read_to_string(stdout).unwrap(), "/opt/gem5\n");
    }
}
