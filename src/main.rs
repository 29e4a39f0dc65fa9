use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use polaris_lib::{
    AIEvent, AIEventType, AITask, DeveloperInspector, EngineId, EngineRegistry, EventBus,
    RuntimeConfig, SessionConfig,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "polaris")]
#[command(author, version, about = "Run AI coding engines and stream normalized events", long_about = None)]
struct Cli {
    /// Path to config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one prompt and print every event as a JSON line
    Run {
        /// Engine to use: claude-code, iflow or openai
        #[arg(short, long)]
        engine: Option<EngineId>,

        /// Working directory for the engine
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Task timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,

        #[arg(required = true)]
        prompt: String,
    },

    /// List engines with availability and capabilities
    Engines,

    /// Show the effective configuration
    Config {
        /// Write the default configuration file if none exists
        #[arg(long)]
        init: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig, BoxError> {
    Ok(match path {
        Some(path) => RuntimeConfig::load_from(path)?,
        None => RuntimeConfig::load()?,
    })
}

async fn run_prompt(
    config: RuntimeConfig,
    engine: Option<EngineId>,
    cwd: Option<PathBuf>,
    timeout: Option<u64>,
    model: Option<String>,
    prompt: String,
) -> Result<bool, BoxError> {
    let bus = EventBus::new();
    let registry = EngineRegistry::with_defaults(&config, bus.clone());
    let _inspector =
        DeveloperInspector::attach_with_listener(&bus, config.inspector_capacity, |line| {
            println!("{line}")
        });

    let session = registry.create_session(&SessionConfig {
        engine,
        work_dir: cwd,
        model,
        task_timeout: timeout.map(Duration::from_secs),
        ..SessionConfig::default()
    })?;

    let done = Arc::new(Notify::new());
    let failed = Arc::new(AtomicBool::new(false));
    let _ending = {
        let done = Arc::clone(&done);
        let failed = Arc::clone(&failed);
        session.on_event(Box::new(move |event: &AIEvent| {
            if event.is_terminal() {
                if event.event_type() == AIEventType::Error {
                    failed.store(true, Ordering::Release);
                }
                done.notify_one();
            }
            Ok(())
        }))
    };

    let result = session.run(AITask::new(prompt)).await;
    if result.is_ok() {
        done.notified().await;
    }
    registry.cleanup().await;
    result?;
    Ok(!failed.load(Ordering::Acquire))
}

async fn list_engines(config: RuntimeConfig) -> Result<(), BoxError> {
    let registry = EngineRegistry::with_defaults(&config, EventBus::new());
    for id in registry.engines() {
        let Some(caps) = registry.capabilities(id) else {
            continue;
        };
        let available = registry.is_available(id).await;
        let marker = if id == registry.default_engine() { "*" } else { " " };
        println!(
            "{marker} {:<12} {:<20} available={available} {}",
            id.as_str(),
            caps.display_name,
            serde_json::to_string(&caps)?
        );
    }
    Ok(())
}

fn show_config(path: Option<&PathBuf>, init: bool) -> Result<(), BoxError> {
    let config = load_config(path)?;
    if init {
        let target = match path {
            Some(path) => path.clone(),
            None => RuntimeConfig::default_path()?,
        };
        if target.exists() {
            log::info!("[config] {} already exists", target.display());
        } else {
            config.save_to(&target)?;
            println!("wrote {}", target.display());
        }
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Events go to stdout; logs stay on stderr and default to warnings.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            engine,
            cwd,
            timeout,
            model,
            prompt,
        } => {
            let config = load_config(cli.config.as_ref())?;
            if !run_prompt(config, engine, cwd, timeout, model, prompt).await? {
                std::process::exit(1);
            }
        }
        Command::Engines => list_engines(load_config(cli.config.as_ref())?).await?,
        Command::Config { init } => show_config(cli.config.as_ref(), init)?,
    }
    Ok(())
}
