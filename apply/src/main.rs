use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};
use veld_apply::{
    destroy, preview, render_plan, render_report, up, AppError, StoreOptions,
};
use veld_engine::EngineOptions;
use veld_provider::MemoryProvider;

#[derive(Parser, Debug)]
#[command(name = "veld", about = "Converge declared resources against recorded state.", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (e.g., trace, debug, info, warn, error). Default: info.
    #[arg(long = "log", value_name = "LEVEL", default_value = "info")]
    log: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute and print the plan; no side effects.
    Preview(RunArgs),
    /// Compute the plan and execute it.
    Up(RunArgs),
    /// Delete every recorded resource, dependents first.
    Destroy(DestroyArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the JSON definitions file.
    #[arg(long = "defs", value_name = "PATH")]
    defs: PathBuf,

    #[command(flatten)]
    store: StoreArgs,

    /// Maximum in-flight provider operations.
    #[arg(long = "parallelism", value_name = "N", default_value_t = 10)]
    parallelism: usize,
}

#[derive(Args, Debug)]
struct DestroyArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Maximum in-flight provider operations.
    #[arg(long = "parallelism", value_name = "N", default_value_t = 10)]
    parallelism: usize,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Path to the state file.
    #[arg(long = "state", value_name = "PATH", default_value = "veld.state.json")]
    state: PathBuf,

    /// Passphrase protecting secrets at rest.
    #[arg(long = "passphrase", env = "VELD_PASSPHRASE", hide_env_values = true)]
    passphrase: String,
}

impl StoreArgs {
    fn into_options(self) -> StoreOptions {
        StoreOptions {
            path: self.state,
            passphrase: self.passphrase,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_tracing(&cli.log);
    debug!(cli = ?cli, "parsed cli");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping dispatch");
                cancel.cancel();
            }
        });
    }

    match run(cli, cancel).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{err}");
            std::process::exit(err.exit_code());
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<i32, AppError> {
    info!("starting");
    let provider = Arc::new(MemoryProvider::new());

    match cli.command {
        Command::Preview(args) => {
            let plan = preview(&args.defs, &args.store.into_options(), provider.as_ref()).await?;
            print!("{}", render_plan(&plan));
            Ok(0)
        }
        Command::Up(args) => {
            let options = EngineOptions {
                parallelism: args.parallelism,
                ..Default::default()
            };
            let (plan, report) = up(
                &args.defs,
                &args.store.into_options(),
                provider,
                options,
                cancel,
            )
            .await?;
            print!("{}", render_plan(&plan));
            print!("{}", render_report(&report));
            Ok(if report.all_succeeded() { 0 } else { 1 })
        }
        Command::Destroy(args) => {
            let options = EngineOptions {
                parallelism: args.parallelism,
                ..Default::default()
            };
            let report = destroy(&args.store.into_options(), provider, options, cancel).await?;
            print!("{}", render_report(&report));
            Ok(if report.all_succeeded() { 0 } else { 1 })
        }
    }
}

fn install_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .with_target(true)
        .with_level(true)
        .with_ansi(false)
        .init();
}
