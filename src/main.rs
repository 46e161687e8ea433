use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use jobworker::queue::PollingQueue;
use jobworker::store::{JobStore, LibSqlBackend};
use jobworker::worker::{Consumer, JobEvent, JobOptions, JobRegistry, JobRequest, Worker, handler_fn};
use jobworker::WorkerConfig;

/// Argument of the `echo` demo job.
#[derive(Debug, Serialize, Deserialize)]
struct EchoArgs {
    lines: Vec<String>,
}

/// Argument of the `countdown` demo job.
#[derive(Debug, Serialize, Deserialize)]
struct CountdownArgs {
    from: u32,
    #[serde(default = "default_step_ms")]
    step_ms: u64,
}

fn default_step_ms() -> u64 {
    1000
}

fn build_registry() -> Result<JobRegistry, jobworker::Error> {
    let mut registry = JobRegistry::new();

    registry.register(
        "echo",
        handler_fn(|_cancel, job| async move {
            let args: EchoArgs = job.argument().await?;
            for line in &args.lines {
                job.add_log(line).await?;
            }
            Ok(())
        }),
        JobOptions::new().argument::<EchoArgs>(),
    )?;

    registry.register(
        "countdown",
        handler_fn(|cancel, job| async move {
            let args: CountdownArgs = job.argument().await?;
            for remaining in (1..=args.from).rev() {
                if cancel.is_cancelled() {
                    job.add_log("countdown stopped").await?;
                    return Ok(());
                }
                job.add_log(format!("{remaining}...")).await?;
                job.set_progress(percent_done(args.from - remaining, args.from))
                    .await?;
                job.set_progress_text(format!("{remaining} left")).await?;
                tokio::time::sleep(Duration::from_millis(args.step_ms)).await;
            }
            job.add_log("liftoff").await?;
            Ok(())
        }),
        JobOptions::new().argument::<CountdownArgs>().scheduling(true),
    )?;

    Ok(registry)
}

/// Share of `total` covered by `done`, in percent.
fn percent_done(done: u32, total: u32) -> u32 {
    let percent = u64::from(done) * 100 / u64::from(total.max(1));
    u32::try_from(percent).unwrap_or(u32::MAX)
}

/// Parse `echo:a,b,c` or `countdown:5` into a request.
fn parse_request(arg: &str) -> Result<JobRequest, String> {
    let (name, value) = arg.split_once(':').unwrap_or((arg, ""));
    let request = JobRequest::new(name).context("source", "cli");
    let request = match name {
        "echo" => request.argument(&EchoArgs {
            lines: value.split(',').filter(|s| !s.is_empty()).map(String::from).collect(),
        }),
        "countdown" => request.argument(&CountdownArgs {
            from: value.parse().unwrap_or(5),
            step_ms: default_step_ms(),
        }),
        other => return Err(format!("unknown demo job {other:?}")),
    };
    request.map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env()?;

    eprintln!("⚙️  jobworker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Heartbeat: {}ms, poll: {}ms",
        config.heartbeat_interval.as_millis(),
        config.poll_interval.as_millis()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    // ── Worker ───────────────────────────────────────────────────────────
    let registry = Arc::new(build_registry()?);
    let queue = Arc::new(
        PollingQueue::new(Arc::clone(&store), Consumer::new(config.heartbeat_interval))
            .with_poll_interval(config.poll_interval)
            .with_batch_size(config.poll_batch_size),
    );
    let worker = Worker::new(registry, store, queue, &config);

    let mut events = worker.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                JobEvent::StatusChanged { id, job_name, from, to } => {
                    tracing::info!(job_id = %id, job = %job_name, %from, %to, "Status changed");
                }
                JobEvent::Progress { snapshot } => {
                    tracing::debug!(
                        job_id = %snapshot.id,
                        progress = snapshot.progress,
                        text = %snapshot.progress_text,
                        "Progress"
                    );
                }
            }
        }
    });

    worker.listen().await?;

    // ── Demo submissions ─────────────────────────────────────────────────
    let requests: Vec<JobRequest> = std::env::args()
        .skip(1)
        .filter_map(|arg| match parse_request(&arg) {
            Ok(request) => Some(request),
            Err(e) => {
                eprintln!("   Skipping {arg}: {e}");
                None
            }
        })
        .collect();

    for result in join_all(requests.into_iter().map(|r| worker.submit(r))).await {
        match result {
            Ok(job) => eprintln!("   Submitted {} ({})", job.job_name(), job.id()),
            Err(e) => eprintln!("   Submit failed: {e}"),
        }
    }

    eprintln!("   Press Ctrl-C to stop.\n");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    worker.shutdown().await?;
    Ok(())
}
