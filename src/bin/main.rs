use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;
use taskhop::{
    Scheduler, SchedulerConfig, StepResult, StepSequence, TaskSet, TaskSnapshot,
    TaskState, TokioPool, Yield, from_fn, from_iter,
};

#[derive(Parser)]
#[command(name = "taskhop")]
#[command(about = "Cooperative tasks that hop between a worker pool and the main loop")]
struct Cli {
    /// Config file (defaults to XDG or ./taskhop.json)
    #[arg(long, global = true, env = "TASKHOP_CONFIG")]
    config: Option<PathBuf>,
    /// Milliseconds between main loop ticks
    #[arg(long, global = true, env = "TASKHOP_TICK_MS")]
    tick_ms: Option<u64>,
    /// Maximum concurrent background steps
    #[arg(long, global = true, env = "TASKHOP_MAX_BLOCKING_THREADS")]
    max_blocking_threads: Option<usize>,
    /// Cancel every task still running after this many ticks
    #[arg(long, global = true, env = "TASKHOP_MAX_TICKS")]
    max_ticks: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash files in chunks on the worker pool, reporting progress on the main loop
    Digest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value_t = 64 * 1024)]
        chunk_size: usize,
    },
    /// Count down on the worker pool with a deadline checked between steps
    Countdown {
        #[arg(default_value_t = 5)]
        from: u32,
        /// Simulated work per step, in milliseconds
        #[arg(long, default_value_t = 200)]
        step_ms: u64,
        /// Stop the countdown after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("taskhop=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let config = effective_config(&cli)?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Digest { files, chunk_size } => {
            info!("Hashing {} file(s) in {} byte chunks", files.len(), chunk_size);
            let runtime = config.build_runtime()?;
            let scheduler = Scheduler::with_pool(TokioPool::new(runtime.handle().clone()));

            let mut set = TaskSet::new();
            for path in files {
                let label = path.display().to_string();
                set.spawn(&scheduler, label, DigestFile::new(path, chunk_size));
            }

            let completed = drive(&mut set, &config, |file, event| match event {
                DigestEvent::Progress { read, total } => {
                    info!(file, read, total, "progress");
                }
                DigestEvent::Digest(hex) => println!("{}  {}", hex, file),
            });

            let failed = completed.iter().filter(|s| s.state == TaskState::Cancelled).count();
            print_summary(&completed)?;
            if failed > 0 {
                anyhow::bail!("{} of {} file(s) were not hashed", failed, completed.len());
            }
        }
        Commands::Countdown {
            from,
            step_ms,
            timeout_ms,
        } => {
            let runtime = config.build_runtime()?;
            let scheduler = Scheduler::with_pool(TokioPool::new(runtime.handle().clone()));
            let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

            let mut set = TaskSet::new();
            set.spawn(
                &scheduler,
                "countdown",
                countdown(from, Duration::from_millis(step_ms), deadline),
            );

            let completed = drive(&mut set, &config, |_, remaining| {
                info!("{} remaining", remaining);
            });
            print_summary(&completed)?;
        }
    }

    Ok(())
}

fn effective_config(cli: &Cli) -> Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => SchedulerConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SchedulerConfig::load()?,
    };

    if let Some(ms) = cli.tick_ms {
        config.tick_interval_ms = ms;
    }
    if let Some(n) = cli.max_blocking_threads {
        config.max_blocking_threads = n.max(1);
    }
    if cli.max_ticks.is_some() {
        config.max_ticks = cli.max_ticks;
    }

    Ok(config)
}

/// Tick the set until it is empty. Returns the snapshots of finished tasks.
///
/// `on_value` receives the label of the task that yielded each value.
fn drive<T: Send + 'static>(
    set: &mut TaskSet<T>,
    config: &SchedulerConfig,
    mut on_value: impl FnMut(&str, T),
) -> Vec<TaskSnapshot> {
    let mut completed = Vec::new();
    let mut ticks = 0u64;

    while !set.is_empty() {
        let report = set.tick();
        // A task that yielded a value is still in the set.
        for (id, value) in report.values {
            let label = set.get(id).map(|task| task.label().as_str()).unwrap_or("?");
            on_value(label, value);
        }
        completed.extend(report.completed);

        ticks += 1;
        if config.max_ticks == Some(ticks) {
            warn!("Tick limit {} reached, cancelling {} task(s)", ticks, set.len());
            set.cancel_all();
        }

        if !set.is_empty() {
            thread::sleep(config.tick_interval());
        }
    }

    info!("All tasks ended after {} ticks", ticks);
    completed
}

fn print_summary(completed: &[TaskSnapshot]) -> Result<()> {
    eprintln!("{}", serde_json::to_string_pretty(completed)?);
    Ok(())
}

enum DigestEvent {
    Progress { read: u64, total: u64 },
    Digest(String),
}

enum DigestPhase {
    Open,
    Read(File),
    Publish,
    Done,
}

/// Reads and hashes on the worker; hands the digest to the main loop at the end.
struct DigestFile {
    path: PathBuf,
    chunk: Vec<u8>,
    hasher: Sha256,
    read: u64,
    total: u64,
    phase: DigestPhase,
}

impl DigestFile {
    fn new(path: PathBuf, chunk_size: usize) -> Self {
        Self {
            path,
            chunk: vec![0; chunk_size.max(1)],
            hasher: Sha256::new(),
            read: 0,
            total: 0,
            phase: DigestPhase::Open,
        }
    }
}

impl StepSequence<DigestEvent> for DigestFile {
    fn next_step(&mut self) -> StepResult<DigestEvent> {
        match std::mem::replace(&mut self.phase, DigestPhase::Done) {
            DigestPhase::Open => {
                let file = File::open(&self.path)
                    .with_context(|| format!("opening {}", self.path.display()))?;
                self.total = file.metadata().map(|m| m.len()).unwrap_or(0);
                self.phase = DigestPhase::Read(file);
                Ok(Some(Yield::value(DigestEvent::Progress {
                    read: 0,
                    total: self.total,
                })))
            }
            DigestPhase::Read(mut file) => {
                let n = file
                    .read(&mut self.chunk)
                    .with_context(|| format!("reading {}", self.path.display()))?;
                if n == 0 {
                    self.phase = DigestPhase::Publish;
                    return Ok(Some(Yield::to_main_thread()));
                }
                self.hasher.update(&self.chunk[..n]);
                self.read += n as u64;
                self.phase = DigestPhase::Read(file);
                Ok(Some(Yield::value(DigestEvent::Progress {
                    read: self.read,
                    total: self.total,
                })))
            }
            DigestPhase::Publish => {
                let digest = std::mem::take(&mut self.hasher).finalize();
                let hex = digest.iter().map(|b| format!("{:02x}", b)).collect();
                Ok(Some(Yield::value(DigestEvent::Digest(hex))))
            }
            DigestPhase::Done => Ok(None),
        }
    }
}

/// Sleep on the worker between values; check the deadline as a nested step.
fn countdown(
    from: u32,
    step: Duration,
    deadline: Option<Instant>,
) -> impl StepSequence<u32> + Send + 'static {
    let mut remaining = from;
    let mut checked = false;

    from_fn(move || -> StepResult<u32> {
        if !checked {
            checked = true;
            let expired = deadline.is_some_and(|at| Instant::now() >= at);
            return Ok(Some(Yield::nested(from_iter(expired.then(Yield::exit)))));
        }
        checked = false;

        if remaining == 0 {
            return Ok(None);
        }
        thread::sleep(step);
        remaining -= 1;
        Ok(Some(Yield::value(remaining)))
    })
}
