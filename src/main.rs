use std::env;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use slots_eng::csv::{read_commands, write_jobs};
use slots_eng::{
    Engine, EngineConfig, LogNotifier, MemoryLedger, NotifierWorker, Outbox, Reaper, Replay,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: slots-eng <commands.csv> [config.toml]";

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let config = match EngineConfig::load(args.next().as_deref().map(Path::new)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(io::stderr)
        .init();

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let commands = match read_commands(path.clone()) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match &config.state_path {
        Some(state) if state.exists() => match MemoryLedger::load(state).await {
            Ok(ledger) => Arc::new(ledger),
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        _ => Arc::new(MemoryLedger::new()),
    };

    let (outbox, notifications) = Outbox::channel(config.outbox_capacity);
    let notifier = tokio::spawn(async move {
        let worker = NotifierWorker::new(LogNotifier);
        worker.run(ReceiverStream::new(notifications)).await
    });

    let replay = Replay::new(
        Engine::new(Arc::clone(&store), outbox.clone()),
        Reaper::new(Arc::clone(&store), outbox, &config),
    );

    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(cmd) => {
                    if cmd_sender.send(cmd).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    replay.run(ReceiverStream::new(cmd_receiver)).await;

    let jobs = match replay.jobs().await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // closes the outbox so the notifier drains and stops
    drop(replay);
    match notifier.await {
        Ok(delivered) => info!(delivered, "notifier stopped"),
        Err(e) => warn!("notifier task failed: {e}"),
    }

    if let Some(state) = &config.state_path {
        if let Err(e) = store.save(state).await {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = write_jobs(io::stdout().lock(), &jobs) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
