//! Gridflow CLI - session-based job orchestration

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use gridflow::{
    AdapterRegistry, Core, Engine, FileSessionStore, FixSuggestion, GreedyScheduler,
    GridflowError, JobId, JobSpec, JobState, LocalhostAdapter, ReliabilityScheduler, Resource,
    ResourcePool, Scheduler, SessionLock, SessionStore, TaskControl,
};

#[derive(Parser)]
#[command(name = "gridflow")]
#[command(about = "Session-based orchestration of asynchronous jobs")]
#[command(version)]
struct Cli {
    /// Session directory (roster, lock, id counter)
    #[arg(short, long, default_value = ".gridflow", global = true)]
    session: String,

    /// Execution slots on the local resource
    #[arg(long, default_value_t = 4, global = true)]
    capacity: u32,

    /// Scheduling policy (greedy, reliability)
    #[arg(long, default_value = "greedy", global = true)]
    scheduler: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job to the session
    Submit {
        /// Executable to run
        #[arg(required_unless_present = "file")]
        command: Option<String>,

        /// Arguments passed to the executable
        args: Vec<String>,

        /// Human-readable job name
        #[arg(short, long)]
        name: Option<String>,

        /// Execution slots the job needs
        #[arg(long, default_value_t = 1)]
        slots: u32,

        /// Read the full job spec from a YAML file instead
        #[arg(short, long, conflicts_with_all = ["command", "args", "name"])]
        file: Option<String>,
    },

    /// Run a single engine cycle
    Cycle,

    /// Run cycles until every tracked task terminates
    Run {
        /// Seconds between cycles
        #[arg(short, long, default_value_t = 1)]
        interval: u64,

        /// Stop after this many cycles even if tasks remain
        #[arg(long)]
        max_cycles: Option<u64>,
    },

    /// Show per-state counts, or every tracked task with -l
    Status {
        /// List tasks individually
        #[arg(short, long)]
        list: bool,
    },

    /// Request cancellation of a task
    Cancel {
        /// Task id
        id: String,
    },

    /// Return a terminated task to NEW for another attempt
    Retry {
        /// Task id
        id: String,
    },

    /// Collect a terminated job's output (one-shot)
    Fetch {
        /// Job id
        id: String,
    },

    /// Snapshot a live job's output stream
    Peek {
        /// Job id
        id: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = dispatch(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), GridflowError> {
    // The lock covers the whole invocation: load, operate, save.
    let _lock = SessionLock::acquire(&cli.session)?;
    let store = FileSessionStore::new(&cli.session);
    let mut engine = build_engine(&cli)?;
    engine.restore(store.load()?);

    match cli.command {
        Commands::Submit {
            command,
            args,
            name,
            slots,
            file,
        } => {
            let spec = match file {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)?;
                    serde_yaml::from_str(&raw)?
                }
                None => JobSpec {
                    name,
                    command: command.unwrap_or_default(),
                    arguments: args,
                    requested_slots: slots,
                    ..Default::default()
                },
            };
            let id = engine.submit_new(spec)?;
            println!("{} Tracking job {}", "→".cyan(), id.as_str().cyan().bold());
        }

        Commands::Cycle => {
            let stats = engine.progress().await?;
            print_stats(&stats);
        }

        Commands::Run {
            interval,
            max_cycles,
        } => {
            let mut cycles = 0u64;
            loop {
                let stats = engine.progress().await?;
                cycles += 1;
                if stats.all_done() {
                    print_stats(&stats);
                    println!("{} All tasks terminated after {} cycles", "✓".green(), cycles);
                    break;
                }
                if max_cycles.is_some_and(|max| cycles >= max) {
                    print_stats(&stats);
                    println!("{} Stopped after {} cycles with tasks remaining", "!".yellow(), cycles);
                    break;
                }
                // Persist between cycles so a crash loses at most one cycle
                store.save(&engine.session_data())?;
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }

        Commands::Status { list } => {
            print_stats(&engine.stats());
            if list {
                for unit in engine.roster() {
                    let status = engine.query(unit.id())?;
                    let state = paint_state(status.state);
                    let outcome = match status.termination {
                        Some(t) => format!(" ({})", t),
                        None => String::new(),
                    };
                    println!(
                        "  {:<24} {:<12} {}{}",
                        status.id.as_str(),
                        status.kind,
                        state,
                        outcome
                    );
                }
            }
        }

        Commands::Cancel { id } => {
            let id: JobId = id.parse()?;
            engine.cancel(&id).await?;
            println!("{} Cancel requested for {}", "→".cyan(), id.as_str().cyan());
        }

        Commands::Retry { id } => {
            let id: JobId = id.parse()?;
            engine.retry(&id)?;
            println!("{} {} returned to NEW", "→".cyan(), id.as_str().cyan());
        }

        Commands::Fetch { id } => {
            let id: JobId = id.parse()?;
            let output = engine.collect_output(&id)?;
            if !output.stdout.is_empty() {
                print!("{}", output.stdout);
            }
            if !output.stderr.is_empty() {
                eprint!("{}", output.stderr);
            }
        }

        Commands::Peek { id } => {
            let id: JobId = id.parse()?;
            let snapshot = engine.peek(&id).await?;
            print!("{}", snapshot);
        }
    }

    store.save(&engine.session_data())?;
    Ok(())
}

/// Local-subprocess engine: one resource named "localhost".
fn build_engine(cli: &Cli) -> Result<Engine, GridflowError> {
    let resource = gridflow::ResourceName::new("localhost").map_err(|_| {
        GridflowError::UnknownResource {
            resource: "localhost".into(),
        }
    })?;

    let registry = AdapterRegistry::new();
    registry.register(resource.clone(), Arc::new(LocalhostAdapter::new()));

    let pool = ResourcePool::new(vec![Resource::new(resource, cli.capacity)]);
    let scheduler: Box<dyn Scheduler> = match cli.scheduler.as_str() {
        "reliability" => Box::new(ReliabilityScheduler),
        _ => Box::new(GreedyScheduler),
    };

    Ok(Engine::new(Core::new(registry, pool, scheduler)))
}

fn print_stats(stats: &gridflow::CycleStats) {
    println!("{}", "Task states:".bold());
    for (label, count) in stats.rows() {
        if count > 0 {
            println!("  {:<12} {}", label, count);
        }
    }
    if stats.terminated > 0 {
        println!(
            "  {:<12} {} ok, {} failed",
            "outcome", stats.ok, stats.failed
        );
    }
    if stats.errors > 0 {
        println!("  {:<12} {}", "errors".yellow(), stats.errors);
    }
}

fn paint_state(state: JobState) -> String {
    let s = state.to_string();
    match state {
        JobState::Terminated => s.green().to_string(),
        JobState::Stopped => s.yellow().to_string(),
        JobState::Running | JobState::Submitted => s.cyan().to_string(),
        _ => s,
    }
}
