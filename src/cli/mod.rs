//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Test runner with shared fixtures, fail-fast lists and distributed workers
#[derive(Parser, Debug)]
#[command(name = "testgrid")]
#[command(version)]
#[command(about = "Run test manifests locally or across a pool of workers")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (YAML or JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run tests, locally or as the coordinator of a distributed run
    Run(RunArgs),

    /// Join a distributed run as a worker
    Client(ClientArgs),

    /// List suites, tests and fixtures
    List(ListArgs),

    /// Re-run the tests that failed in the last stored run
    Rerun(RerunArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory (or single manifest) to collect tests from
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Treat build_once fixtures as built by an earlier step
    #[arg(long)]
    pub skip_build: bool,

    /// Run only this test or suite uid
    #[arg(long)]
    pub uid: Option<String>,

    /// Stop the whole run at the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Only run tests carrying one of these tags
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Parallel test slots (with --serve, local worker slots; 0 serves only)
    #[arg(short = 'j', long = "threads")]
    pub threads: Option<usize>,

    /// Directory for captured output and results.json
    #[arg(long)]
    pub result_path: Option<PathBuf>,

    /// Coordinate remote workers at the address in the credential file
    #[arg(long)]
    pub serve: bool,

    /// Credential file with hostname, port and passkey
    #[arg(long)]
    pub credentials: Option<PathBuf>,
}

/// Arguments for client command
#[derive(Parser, Debug)]
pub struct ClientArgs {
    /// Directory (or single manifest) to collect tests from
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Units run concurrently by this worker
    #[arg(short = 'j', long = "threads")]
    pub threads: Option<usize>,

    /// Credential file with hostname, port and passkey
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Treat build_once fixtures as built by an earlier step
    #[arg(long)]
    pub skip_build: bool,

    /// Directory for captured output
    #[arg(long)]
    pub result_path: Option<PathBuf>,
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Directory (or single manifest) to collect tests from
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Only list tests carrying one of these tags
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// List suites only
    #[arg(long)]
    pub suites: bool,

    /// List fixtures only
    #[arg(long)]
    pub fixtures: bool,
}

/// Arguments for rerun command
#[derive(Parser, Debug)]
pub struct RerunArgs {
    /// Directory (or single manifest) to collect tests from
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Directory holding the previous results.json
    #[arg(long)]
    pub result_path: Option<PathBuf>,

    /// Treat build_once fixtures as built by an earlier step
    #[arg(long)]
    pub skip_build: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let args = Args::parse_from([
            "testgrid", "-vv", "run", "tests", "--skip-build", "-j", "4", "--tags", "quick,arm",
            "--uid", "boot:TestCase:hello",
        ]);
        assert_eq!(args.verbose, 2);
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.path, PathBuf::from("tests"));
        assert!(run.skip_build);
        assert_eq!(run.threads, Some(4));
        assert_eq!(run.tags, vec!["quick", "arm"]);
        assert_eq!(run.uid.as_deref(), Some("boot:TestCase:hello"));
        assert!(!run.serve);
    }

    #[test]
    fn test_parse_client_defaults() {
        let args = Args::parse_from(["testgrid", "client", "--credentials", "creds.ini"]);
        let Command::Client(client) = args.command else {
            panic!("expected client");
        };
        assert_eq!(client.path, PathBuf::from("."));
        assert_eq!(client.threads, None);
        assert_eq!(client.credentials, Some(PathBuf::from("creds.ini")));
    }
}
