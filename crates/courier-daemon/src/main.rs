//! courier-daemon - line-protocol worker and controller.
//!
//! `worker` runs the worker side: it reads one JSON message per line on
//! stdin and answers on stdout. Logging goes to stderr so it can never
//! corrupt the protocol channel. `ping` runs the controller side: it
//! launches this binary again as a worker and exchanges ping/pong with it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use courier_core::message::DaemonArgs;
use courier_core::paths;
use courier_core::settings::{load_settings, Settings};
use courier_core::spawn::{spawn_daemon, WorkerCommand};
use courier_core::transport::{ChildTransport, ReadStrategy};
use serde_json::{json, Value};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Daemon kind this binary answers to.
const WORKER_KIND: &str = "worker";

#[derive(Parser, Debug)]
#[command(name = "courier-daemon")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run as a worker speaking the line protocol on stdin/stdout
    Worker {
        /// JSON array of positional arguments
        args: String,
        /// JSON object of keyword arguments, e.g. {"strategy":"threaded"}
        kwargs: String,
    },
    /// Spawn a worker and exchange ping/pong with it
    Ping {
        /// Number of round trips
        #[arg(short, long, default_value_t = 1)]
        count: u32,

        /// How the worker reads its stdin
        #[arg(long, value_enum, default_value_t = Strategy::Auto)]
        strategy: Strategy,

        /// Record the wire traffic here (overrides settings)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    Auto,
    Readiness,
    Threaded,
}

impl Strategy {
    fn kwarg(self) -> Option<&'static str> {
        match self {
            Strategy::Auto => None,
            Strategy::Readiness => Some("readiness"),
            Strategy::Threaded => Some("threaded"),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Workers only report problems; their stderr ends up in the controller's log.
    let default_filter = match cli.command {
        Command::Worker { .. } => "warn",
        Command::Ping { .. } => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Worker { .. } => {
                let argv: Vec<String> = std::env::args().collect();
                run_worker(DaemonArgs::from_argv(&argv, WORKER_KIND)?).await
            }
            Command::Ping {
                count,
                strategy,
                log_dir,
            } => run_ping(count, strategy, log_dir).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run_worker(daemon: DaemonArgs) -> Result<(), BoxError> {
    let mut transport = match daemon.kwargs.get("strategy").and_then(Value::as_str) {
        Some("threaded") => ChildTransport::with_strategy(ReadStrategy::Threaded)?,
        Some("readiness") => ChildTransport::with_strategy(ReadStrategy::Readiness)?,
        Some(other) => return Err(format!("unknown read strategy: {other}").into()),
        None => ChildTransport::stdio(),
    };
    log::info!("worker started, reading with {:?}", transport.strategy());

    loop {
        let message = match transport.get().await {
            Ok(message) => message,
            Err(err) if err.is_terminal() => {
                log::info!("controller went away: {}", err);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match message.get("cmd").and_then(Value::as_str) {
            Some("ping") => transport.put(&json!({"cmd": "pong"})).await?,
            Some("exit") => return Ok(()),
            _ => transport.put(&json!({"cmd": "echo", "data": message})).await?,
        }
    }
}

async fn run_ping(count: u32, strategy: Strategy, log_dir: Option<PathBuf>) -> Result<(), BoxError> {
    let settings = match paths::config_dir() {
        Some(dir) => load_settings(&dir).unwrap_or_else(|err| {
            log::warn!("using default settings: {}", err);
            Settings::default()
        }),
        None => Settings::default(),
    };

    let mut daemon = DaemonArgs::new(WORKER_KIND);
    if let Some(strategy) = strategy.kwarg() {
        daemon = daemon.kwarg("strategy", strategy);
    }
    let mut command = WorkerCommand::current_exe(&daemon)?;
    if let Some(dir) = log_dir.or(settings.log_dir.clone()) {
        command = command.transcript_dir(dir);
    }

    let mut transport = spawn_daemon(&command, "ping")?;
    for seq in 0..count {
        let started = Instant::now();
        transport.put(&json!({"cmd": "ping"})).await?;
        let reply = tokio::select! {
            reply = transport.get() => reply?,
            _ = tokio::signal::ctrl_c() => {
                log::warn!("interrupted");
                break;
            }
        };
        println!(
            "{}",
            json!({
                "seq": seq,
                "reply": reply,
                "elapsed_us": started.elapsed().as_micros() as u64,
            })
        );
    }

    if let Err(err) = transport.put(&json!({"cmd": "exit"})).await {
        log::debug!("worker gone before exit: {}", err);
    }
    let exit = transport.shutdown(settings.worker_stop_grace()).await;
    log::info!("worker stopped: {:?}", exit);
    Ok(())
}
