use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use crossbeam::channel::{unbounded, Receiver, Sender};
use tokio::runtime::{Builder, Runtime};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use playcron::config::Config;
use playcron::context::Context;
use playcron::cron_schedule::CronSchedule;
use playcron::database::Db;
use playcron::error::{Error, Result};
use playcron::repository_sync::RepositorySync;
use playcron::runner::{ExecutionRunner, JobRunner};
use playcron::scheduler::Scheduler;
use playcron::{logging, Command, Signal, SignalAction, SignalHandler};

#[derive(Parser, Debug)]
#[command(name = "playcron")]
#[command(version)]
#[command(about = "Schedules and supervises ansible-playbook runs")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler (SIGHUP reloads, SIGINT/SIGTERM stop)
    Run,

    /// Queue an ad-hoc execution of a job
    Trigger {
        /// Job id
        job: String,

        /// User the execution is attributed to
        #[arg(long)]
        user: Option<String>,
    },

    /// Print the next trigger time of a cron expression
    Next {
        expression: String,
    },

    /// Update the shared working copy of a git repository
    SyncRepo {
        /// Repository id
        repository: String,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config: Config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{}", error);
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = logging::init(&config.log_level) {
        eprintln!("{}", error);
        return ExitCode::FAILURE;
    }
    let runtime: Runtime = match Builder::new_multi_thread().thread_name("playcron-runtime").enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!("unable to build runtime: {}", error);
            return ExitCode::FAILURE;
        }
    };
    match execute(args.command, config, &runtime) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(error) => {
            error!("{}", error);
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Commands, config: Config, runtime: &Runtime) -> Result<i32> {
    if let Commands::Next { expression } = &command {
        let next = CronSchedule::parse(expression)?.next_run(config.tz()?)?;
        println!("{}", next.to_rfc3339());
        return Ok(0);
    }
    let db: Db = runtime.block_on(Db::new(Some(config.database.clone())))?;
    let ctx: Context = Context::new(config, db, runtime.handle().clone());
    match command {
        Commands::Run => serve(&ctx, runtime),
        Commands::Trigger { job, user } => {
            let record = runtime
                .block_on(ctx.jobs().get(&job))?
                .ok_or_else(|| Error::not_found("job", job.clone()))?;
            let entry = runtime.block_on(ctx.queue().push(&record.id, user.as_deref()))?;
            println!("queued job '{}' ({})", record.name, entry.id);
            Ok(0)
        }
        Commands::SyncRepo { repository } => {
            runtime.block_on(RepositorySync::refresh(&ctx, &repository, None))?;
            Ok(0)
        }
        Commands::Next { .. } => Ok(0),
    }
}

fn serve(ctx: &Context, runtime: &Runtime) -> Result<i32> {
    let (tx, rx): (Sender<Command>, Receiver<Command>) = unbounded();
    let runner: Arc<dyn JobRunner> = Arc::new(ExecutionRunner::new(ctx));
    let scheduler = Scheduler::new(ctx, runner, rx).start()?;
    runtime.spawn(async move {
        if let Err(error) = forward_signals(tx).await {
            error!("signal handling failed: {}", error);
        }
    });
    let code: i32 = scheduler
        .join()
        .map_err(|_| Error::Internal("scheduler thread panicked".to_string()))?;
    info!("exiting with code {}", code);
    Ok(code)
}

async fn forward_signals(tx: Sender<Command>) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut handler = SignalHandler::default();
    loop {
        let received: Signal = tokio::select! {
            _ = sighup.recv() => Signal::Hangup,
            _ = sigint.recv() => Signal::Interrupt,
            _ = sigterm.recv() => Signal::Terminate,
        };
        info!("received {:?}", received);
        match handler.handle(received) {
            SignalAction::Send(command) => {
                if tx.send(command).is_err() {
                    return Ok(());
                }
            }
            SignalAction::Exit => {
                error!("stop requested twice, exiting without waiting for workloads");
                std::process::exit(1);
            }
        }
    }
}
