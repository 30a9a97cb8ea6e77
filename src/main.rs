//! testgrid - run test manifests locally or across a worker pool
//!
//! ## Usage
//!
//! ```bash
//! # Run every manifest under tests/ with captured output and stored results
//! testgrid run tests --result-path out
//!
//! # Four parallel slots, only tests tagged "quick"
//! testgrid run tests -j 4 --tags quick
//!
//! # Coordinate remote workers, then join from another machine
//! testgrid run tests --serve --credentials creds.ini
//! testgrid client tests --credentials creds.ini -j 8
//!
//! # Re-run what failed last time
//! testgrid rerun tests --result-path out
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use testgrid::cli::{self, Args};
use testgrid::config::{AppConfig, Credentials, EnvConfig};
use testgrid::distributed::{plan_units, Coordinator, CoordinatorOptions, Worker};
use testgrid::executor::{RunOptions, Runner};
use testgrid::hierarchy::TestTree;
use testgrid::loader;
use testgrid::models::RunSummary;
use testgrid::results::{ConsoleSink, ResultsStorage, SinkSet, StorageSink};
use testgrid::utils::init_logger;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env = EnvConfig::load();
    let config_path = args.config.clone().or_else(|| env.config_file.clone());
    let mut config = AppConfig::load_default(config_path.as_deref())?;
    config.merge_env(&env);
    if args.verbose > 0 {
        config.verbosity = args.verbose;
    }

    init_logger(config.verbosity);

    let code = match args.command {
        cli::Command::Run(run_args) => run_tests(run_args, config).await?,
        cli::Command::Client(client_args) => run_client(client_args, config).await?,
        cli::Command::List(list_args) => {
            list_tests(list_args)?;
            0
        }
        cli::Command::Rerun(rerun_args) => rerun_failed(rerun_args, config).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_tests(args: cli::RunArgs, mut config: AppConfig) -> Result<i32> {
    if let Some(path) = args.result_path {
        config.result_path = Some(path);
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(path) = args.credentials {
        config.credentials = Some(path);
    }
    config.fail_fast |= args.fail_fast;
    config.skip_build |= args.skip_build;

    let tree = Arc::new(collect(&args.path, &args.tags)?);
    let uids: Vec<String> = args.uid.into_iter().collect();
    let options = run_options(&config);
    let sinks = output_sinks(&config);

    let summary = if args.serve {
        let credentials = load_credentials(&config)?;
        serve(
            tree,
            &uids,
            sinks,
            options,
            config.skip_build,
            credentials.address(),
            credentials.passkey,
            config.threads,
        )
        .await?
    } else if config.threads > 1 {
        // Local fleet: a loopback coordinator with one in-process worker.
        let passkey = format!("{:016x}", rand::random::<u64>());
        serve(
            tree,
            &uids,
            sinks,
            options,
            config.skip_build,
            "127.0.0.1:0".to_string(),
            passkey,
            config.threads,
        )
        .await?
    } else if config.threads == 1 {
        run_local(tree, uids, sinks, options, config.skip_build).await?
    } else {
        anyhow::bail!("-j 0 is only valid together with --serve");
    };

    Ok(summary.exit_code())
}

async fn run_client(args: cli::ClientArgs, mut config: AppConfig) -> Result<i32> {
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(path) = args.credentials {
        config.credentials = Some(path);
    }
    if let Some(path) = args.result_path {
        config.result_path = Some(path);
    }
    config.skip_build |= args.skip_build;
    config.validate()?;

    let credentials = load_credentials(&config)?;
    let tree = Arc::new(loader::load_tree(&args.path)?);

    let address = credentials.connect_address();
    info!("Joining coordinator at {}", address);
    let units = Worker::new(tree, config.threads)
        .with_options(run_options(&config))
        .skip_build(config.skip_build)
        .run(address.as_str(), &credentials.passkey)
        .await?;

    info!("Ran {} unit(s)", units);
    Ok(0)
}

fn list_tests(args: cli::ListArgs) -> Result<()> {
    let tree = collect(&args.path, &args.tags)?;
    let show_all = !args.suites && !args.fixtures;

    if args.fixtures || show_all {
        println!("Fixtures:");
        for spec in tree.resource_specs() {
            let mut flags = vec![spec.scope.to_string()];
            if !spec.lazy {
                flags.push("eager".to_string());
            }
            if spec.build_once {
                flags.push("build_once".to_string());
            }
            if !spec.depends_on.is_empty() {
                flags.push(format!("depends on {}", spec.depends_on.join(", ")));
            }
            println!("  {} ({})", spec.name, flags.join(", "));
        }
        println!();
    }

    if args.suites || show_all {
        println!("Suites:");
        for suite in tree.suites() {
            println!("  {}", suite.uid());
            if !show_all {
                continue;
            }
            for case in suite.cases() {
                let tags = suite.effective_tags(case);
                if tags.is_empty() {
                    println!("    {}", case.uid());
                } else {
                    let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                    println!("    {} [{}]", case.uid(), tags.join(", "));
                }
            }
        }
        println!();
    }

    println!(
        "{} test(s) in {} suite(s), {} fixture(s)",
        tree.case_count(),
        tree.suites().len(),
        tree.resource_specs().len()
    );
    Ok(())
}

async fn rerun_failed(args: cli::RerunArgs, mut config: AppConfig) -> Result<i32> {
    if let Some(path) = args.result_path {
        config.result_path = Some(path);
    }
    config.skip_build |= args.skip_build;

    let result_path = config
        .result_path
        .clone()
        .context("rerun needs --result-path or TESTGRID_RESULT_PATH")?;
    let previous = ResultsStorage::new(&result_path).load()?;
    let failed = previous.failed_uids();
    if failed.is_empty() {
        info!("Nothing failed in run {}", previous.id);
        return Ok(0);
    }
    info!(
        "Re-running {} failed test(s) from run {}",
        failed.len(),
        previous.id
    );

    let tree = Arc::new(loader::load_tree(&args.path)?);
    let options = run_options(&config);
    let sinks = output_sinks(&config);
    let summary = run_local(tree, failed, sinks, options, config.skip_build).await?;
    Ok(summary.exit_code())
}

fn collect(path: &Path, tags: &[String]) -> Result<TestTree> {
    let tree = loader::load_tree(path)?;
    if tags.is_empty() {
        Ok(tree)
    } else {
        Ok(tree.filter_tags(tags))
    }
}

fn run_options(config: &AppConfig) -> RunOptions {
    RunOptions {
        fail_fast: config.fail_fast,
        result_path: config.result_path.clone(),
    }
}

fn output_sinks(config: &AppConfig) -> SinkSet {
    let sinks = SinkSet::new();
    sinks.attach(ConsoleSink::new());
    if let Some(path) = &config.result_path {
        sinks.attach(StorageSink::new(ResultsStorage::new(path)));
    }
    sinks
}

fn load_credentials(config: &AppConfig) -> Result<Credentials> {
    let path: &PathBuf = config
        .credentials
        .as_ref()
        .context("A credential file is required (--credentials or TESTGRID_CREDENTIALS)")?;
    Credentials::load(path).with_context(|| format!("Invalid credentials {}", path.display()))
}

async fn run_local(
    tree: Arc<TestTree>,
    uids: Vec<String>,
    sinks: SinkSet,
    options: RunOptions,
    skip_build: bool,
) -> Result<RunSummary> {
    let manager = Arc::new(tree.resource_manager()?.skip_build(skip_build));
    let runner = Runner::new(manager, sinks).with_options(options);

    let summary = tokio::task::spawn_blocking(move || {
        if uids.is_empty() {
            Ok(runner.run(&tree))
        } else {
            runner.run_uids(&tree, &uids)
        }
    })
    .await??;
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    tree: Arc<TestTree>,
    uids: &[String],
    sinks: SinkSet,
    options: RunOptions,
    skip_build: bool,
    address: String,
    passkey: String,
    local_slots: usize,
) -> Result<RunSummary> {
    let units = plan_units(&tree, uids)?;
    let coordinator = Coordinator::bind(
        address.as_str(),
        units,
        sinks,
        CoordinatorOptions {
            passkey: passkey.clone(),
            threads: local_slots.max(1),
            fail_fast: options.fail_fast,
        },
    )
    .await
    .with_context(|| format!("Failed to listen on {address}"))?;

    let bound = coordinator.local_addr()?;
    let server = tokio::spawn(coordinator.serve());

    if local_slots > 0 {
        let connect = if bound.ip().is_unspecified() {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), bound.port())
        } else {
            bound
        };
        Worker::new(tree, local_slots)
            .with_options(options)
            .skip_build(skip_build)
            .run(connect, &passkey)
            .await
            .context("Local worker failed")?;
    } else {
        info!("Waiting for workers on {}", bound);
    }

    Ok(server.await?)
}
