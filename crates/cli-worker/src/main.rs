mod inbox;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use transcoder::{
    config::TranscodeConfig,
    delivery::resolve_download,
    ingress::Ingress,
    job::{FileJobStore, JobFailure, JobStore},
    status::{ProjectionError, StatusProjector},
    task::{FileTaskBackend, TaskBackend, TaskRecord, TaskState},
    tracker::JobProgressTracker,
    Orchestrator, Submission, WorkerPool,
};

/// StreamScale transcode worker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest files, transcode them on the worker pool and print their final status
    Submit {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Watch the inbox directory and transcode everything dropped into it
    Serve,
    /// Print the status view of a job
    Status { job_id: String },
    /// Resolve the output file of one profile of a job
    Download { job_id: String, profile: String },
}

/// File-backed stores shared with the monitor
struct Stores {
    jobs: FileJobStore,
    tasks: Arc<FileTaskBackend>,
}

impl Stores {
    fn open(cfg: &TranscodeConfig) -> Result<Self> {
        let jobs = FileJobStore::new(cfg.jobs_dir())?;
        let tasks = FileTaskBackend::new(cfg.tasks_dir())
            .with_context(|| format!("Failed to open task state directory: {}", cfg.tasks_dir().display()))?;
        Ok(Self {
            jobs,
            tasks: Arc::new(tasks),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let stores = Stores::open(&cfg)?;

    match args.command {
        Command::Submit { files } => submit(&cfg, &stores, &files).await,
        Command::Serve => serve(&cfg, &stores).await,
        Command::Status { job_id } => status(&cfg, &stores, &job_id),
        Command::Download { job_id, profile } => download(&cfg, &stores, &job_id, &profile),
    }
}

fn start_pool(cfg: &TranscodeConfig, stores: &Stores) -> WorkerPool {
    let time_limit = match cfg.job_time_limit_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    WorkerPool::start(
        Arc::new(Orchestrator::from_config(cfg)),
        stores.tasks.clone(),
        cfg.workers,
        time_limit,
    )
}

async fn submit(cfg: &TranscodeConfig, stores: &Stores, files: &[PathBuf]) -> Result<()> {
    let ingress = Ingress::new(cfg, &stores.jobs);
    let pool = start_pool(cfg, stores);

    let mut job_ids = Vec::new();
    let mut rejected = 0;
    for file in files {
        match ingress.accept_file(file, false) {
            Ok(accepted) => {
                pool.submit(accepted.submission()).await?;
                job_ids.push(accepted.task_id);
            }
            Err(e) => {
                error!("❌ Rejected {}: {}", file.display(), e);
                rejected += 1;
            }
        }
    }

    info!("Submitted {} job(s), waiting for workers to finish", job_ids.len());
    pool.shutdown().await;

    let projector = StatusProjector::new(&stores.jobs, stores.tasks.as_ref(), cfg.download_url_base.clone());
    for job_id in &job_ids {
        let view = projector.project(job_id)?;
        println!("{}", serde_json::to_string_pretty(&view)?);
    }

    if rejected > 0 {
        bail!("{} file(s) were rejected", rejected);
    }
    Ok(())
}

async fn serve(cfg: &TranscodeConfig, stores: &Stores) -> Result<()> {
    info!("StreamScale worker starting");
    info!("Configuration loaded:");
    info!("  Inbox: {}", cfg.inbox_dir.display());
    info!("  Uploads: {}", cfg.upload_dir.display());
    info!("  Outputs: {}", cfg.output_dir.display());
    info!("  State dir: {}", cfg.state_dir.display());
    info!("  Workers: {}", cfg.workers);
    info!("  Time limit: {}s", cfg.job_time_limit_secs);
    info!("  Scan interval: {}s", cfg.scan_interval_secs);

    let pool = start_pool(cfg, stores);

    info!("🔄 Checking for jobs interrupted by a previous run...");
    let requeued = recover_interrupted_jobs(cfg, &stores.jobs, stores.tasks.as_ref())
        .context("Failed to recover interrupted jobs")?;
    for submission in requeued {
        pool.submit(submission).await?;
    }

    let ingress = Ingress::new(cfg, &stores.jobs);
    loop {
        let mut submitted = 0;
        for result in inbox::scan_inbox(&cfg.inbox_dir, &cfg.allowed_extensions) {
            match result {
                inbox::ScanResult::Candidate(path, size) => match ingress.accept_file(&path, true) {
                    Ok(accepted) => {
                        info!("Queued job {} for {} ({} bytes)", accepted.task_id, accepted.filename, size);
                        pool.submit(accepted.submission()).await?;
                        submitted += 1;
                    }
                    Err(e) => warn!("Failed to ingest {}: {}", path.display(), e),
                },
                inbox::ScanResult::Skipped(path, reason) => {
                    debug!("Skipped {}: {}", path.display(), reason);
                }
            }
        }
        if submitted > 0 || pool.queued() > 0 {
            info!("{} new job(s), {} waiting for a worker", submitted, pool.queued());
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cfg.scan_interval_secs)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, finishing queued jobs before exit");
                break;
            }
        }
    }

    pool.shutdown().await;
    info!("✅ All workers stopped");
    Ok(())
}

/// Jobs whose task never reached SUCCESS/FAILURE belonged to a worker that
/// died. Those whose upload is still on disk are requeued; the rest are
/// failed so clients stop polling.
fn recover_interrupted_jobs(
    cfg: &TranscodeConfig,
    jobs: &dyn JobStore,
    tasks: &dyn TaskBackend,
) -> Result<Vec<Submission>> {
    let mut requeue = Vec::new();

    for record in jobs.list()? {
        let task = match tasks.load(&record.task_id) {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                warn!("Job {}: unreadable task state, leaving it alone: {}", record.task_id, e);
                continue;
            }
        };
        if task.state.is_terminal() {
            continue;
        }

        let upload = upload_path(cfg, &record.task_id, &record.filename);
        if upload.is_file() {
            info!("Job {}: requeueing interrupted job ({:?})", record.task_id, task.state);
            requeue.push(Submission::new(record.task_id.clone(), upload, record.filename.clone()));
            continue;
        }

        warn!("Job {}: upload {} is gone, marking failed", record.task_id, upload.display());
        let last_snapshot = match task.state {
            TaskState::Progress => serde_json::from_value::<JobProgressTracker>(task.payload).ok(),
            _ => None,
        };
        let failure = JobFailure {
            error: format!("worker stopped before the job finished and {} is gone", upload.display()),
            tasks: last_snapshot,
        };
        tasks.store(TaskRecord::new(
            &record.task_id,
            TaskState::Failure,
            serde_json::to_value(&failure)?,
        ))?;
    }

    Ok(requeue)
}

fn upload_path(cfg: &TranscodeConfig, task_id: &str, filename: &str) -> PathBuf {
    cfg.upload_dir.join(format!("{}_{}", task_id, filename))
}

fn status(cfg: &TranscodeConfig, stores: &Stores, job_id: &str) -> Result<()> {
    let projector = StatusProjector::new(&stores.jobs, stores.tasks.as_ref(), cfg.download_url_base.clone());
    match projector.project(job_id) {
        Ok(view) => {
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Err(ProjectionError::NotFound(id)) => bail!("Task not found: {}", id),
        Err(e) => Err(e).context("Failed to read job status"),
    }
}

fn download(cfg: &TranscodeConfig, stores: &Stores, job_id: &str, profile: &str) -> Result<()> {
    let download = resolve_download(cfg, &stores.jobs, stores.tasks.as_ref(), job_id, profile)?;
    println!("{}", display_download(&download.path, &download.download_name, download.media_type));
    Ok(())
}

fn display_download(path: &Path, name: &str, media_type: &str) -> String {
    format!("{}\t{}\t{}", path.display(), name, media_type)
}
