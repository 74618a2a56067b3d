mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{JobId, JobStatus, JobStore, Outcome, ReportingWindow, StatsAggregator, StoreError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// Exit status for a lock wait that ran out (EX_TEMPFAIL).
const EXIT_RETRY_LATER: u8 = 75;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Job store database
    #[arg(long, default_value = common::DEFAULT_STORE_PATH)]
    store: PathBuf,
    /// Seconds to wait for the store's write lock
    #[arg(long, default_value_t = common::DEFAULT_LOCK_TIMEOUT_SECS)]
    lock_timeout: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the job store or bring its schema up to date
    Init,
    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands that need an initialized store.
#[derive(Subcommand)]
enum StoreCommand {
    /// Queue a new search job
    Submit,
    /// Mark a queued job as running
    Claim {
        id: Option<i64>,
        /// Claim the oldest queued job instead
        #[arg(long, conflicts_with = "id")]
        next: bool,
    },
    /// Mark a running job as finished
    Complete {
        id: i64,
        #[arg(long)]
        failed: bool,
    },
    /// Show one job
    Show { id: i64 },
    /// List jobs, most recent first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print CSV instead of a table
        #[arg(long)]
        csv: bool,
    },
    /// Queue statistics as shown on the portal front page
    Stats {
        /// Only average jobs started in the last N days
        #[arg(long)]
        window_days: Option<u32>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let retryable = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<StoreError>())
        .any(StoreError::is_retryable);
    if retryable {
        ExitCode::from(EXIT_RETRY_LATER)
    } else {
        ExitCode::FAILURE
    }
}

fn run(cli: Cli) -> Result<()> {
    let lock_timeout = Duration::from_secs(cli.lock_timeout);
    match cli.command {
        Commands::Init => init(&cli.store, lock_timeout),
        Commands::Store(command) => {
            if !cli.store.exists() {
                anyhow::bail!(
                    "Job store {:?} does not exist, please run `portalctl init` first",
                    cli.store
                );
            }
            let mut store = JobStore::open(&cli.store, lock_timeout)
                .with_context(|| format!("Failed to open job store {:?}", cli.store))?;
            execute(&mut store, command)
        }
    }
}

fn init(path: &Path, lock_timeout: Duration) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    let store = JobStore::create(path, lock_timeout)
        .with_context(|| format!("Failed to initialize job store {:?}", path))?;
    println!(
        "Job store {:?} is at schema version {}",
        store.path(),
        store.schema_version()?
    );
    Ok(())
}

fn execute(store: &mut JobStore, command: StoreCommand) -> Result<()> {
    match command {
        StoreCommand::Submit => {
            let id = store.submit()?;
            println!("{}", id);
        }
        StoreCommand::Claim { id, next } => {
            let job = match (id, next) {
                (Some(id), _) => store.claim(JobId(id))?,
                (None, true) => match store.claim_next()? {
                    Some(job) => job,
                    None => {
                        println!("No queued jobs");
                        return Ok(());
                    }
                },
                (None, false) => anyhow::bail!("Specify a job id or --next"),
            };
            println!("Claimed job {}", job.id);
        }
        StoreCommand::Complete { id, failed } => {
            let outcome = if failed { Outcome::Failed } else { Outcome::Done };
            let job = store.complete(JobId(id), outcome)?;
            println!("Job {} is {}", job.id, job.status);
        }
        StoreCommand::Show { id } => {
            let job = store.get(JobId(id))?.ok_or(StoreError::NotFound(JobId(id)))?;
            print!("{}", output::job_detail(&job));
        }
        StoreCommand::List { status, limit, csv } => {
            let jobs = store.list(status, Some(limit))?;
            if csv {
                output::write_jobs_csv(std::io::stdout(), &jobs)?;
            } else if jobs.is_empty() {
                println!("No jobs");
            } else {
                println!("{}", output::jobs_table(&jobs));
            }
        }
        StoreCommand::Stats { window_days, json } => {
            let stats = StatsAggregator::new(store, ReportingWindow::last_days(window_days));
            let snapshot = stats.snapshot()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{}", output::stats_text(&snapshot));
            }
        }
    }
    Ok(())
}
