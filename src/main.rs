//! piper - named network pipes
//!
//! Command line front end: `listen`, `notify` and `setup`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::builder::PossibleValuesParser;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use piper::{
    // ---
    log_debug,
    log_warn,
    BusBuilder,
    BusGuard,
    Input,
    Listener,
    Mode,
    Notifier,
    Pipe,
    PipeConfig,
    PipeError,
    Provisioner,
    Result,
    StdoutSink,
    BUS_TYPES,
};

/// Network pipes over a message bus
#[derive(Parser, Debug)]
#[command(name = "piper")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bus credentials file (default: ~/.piper.creds when present)
    #[arg(long, env = "PIPER_CREDENTIALS", global = true)]
    creds: Option<PathBuf>,

    /// Comma separated bus servers
    #[arg(long, env = "PIPER_SERVERS", global = true)]
    servers: Option<String>,

    /// Bus implementation
    #[arg(
        long,
        env = "PIPER_BUS",
        default_value = "nats",
        global = true,
        value_parser = PossibleValuesParser::new(BUS_TYPES.iter().copied())
    )]
    bus: String,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for messages on the pipe
    Listen {
        /// Pipe name to wait on for a message
        name: String,

        /// Share messages with other listeners of the group
        #[arg(long, conflicts_with_all = ["discover", "durable"])]
        group: bool,

        /// Hand out a private data subject to one notifier
        #[arg(long, conflicts_with = "durable")]
        discover: bool,

        /// Pull from the durable work queue until interrupted
        #[arg(long = "async")]
        durable: bool,
    },

    /// Notify a listener
    Notify {
        /// Pipe name to publish a message to
        name: String,

        /// The message to send, reads STDIN otherwise
        message: Option<String>,

        /// Discover a listener before sending
        #[arg(long, conflicts_with = "durable")]
        discover: bool,

        /// Queue the message in the durable work queue
        #[arg(long = "async")]
        durable: bool,

        /// How long to wait for a listener before giving up
        #[arg(long, env = "PIPER_TIMEOUT", value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Provision the durable stream, and a pipe's consumer when named
    Setup {
        /// Pipe name to create a durable consumer for
        name: Option<String>,
    },
}

fn listen_mode(group: bool, discover: bool, durable: bool) -> Mode {
    // ---
    match (group, discover, durable) {
        (true, _, _) => Mode::Group,
        (_, true, _) => Mode::Discover,
        (_, _, true) => Mode::Durable,
        _ => Mode::Direct,
    }
}

fn notify_mode(discover: bool, durable: bool) -> Mode {
    // ---
    match (discover, durable) {
        (true, _) => Mode::Discover,
        (_, true) => Mode::Durable,
        _ => Mode::Direct,
    }
}

fn init_logging(debug: bool) {
    // ---
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn base_config(cli: &Cli, role: &str) -> PipeConfig {
    // ---
    let bus_id = format!("{role}-{}", std::process::id());
    let config = PipeConfig::with_servers(cli.servers.clone().unwrap_or_default(), bus_id);

    if cli.bus != "nats" {
        return config;
    }
    match &cli.creds {
        Some(path) => config.with_credentials(path),
        None => config.with_default_credentials(),
    }
}

async fn connect(cli: &Cli, config: &PipeConfig) -> Result<BusGuard> {
    // ---
    let bus = BusBuilder::from_config(config)
        .bus_type(cli.bus.as_str())
        .build()
        .await?;
    Ok(BusGuard::new(bus))
}

/// Release the bus and hand back the command's own result.
async fn finish(guard: BusGuard, result: Result<()>) -> Result<()> {
    // ---
    if let Err(err) = guard.release().await {
        log_warn!("closing the bus failed: {err}");
    }
    result
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<()> {
    // ---
    match &cli.command {
        Command::Listen {
            name,
            group,
            discover,
            durable,
        } => {
            let pipe = Pipe::new(name.as_str(), listen_mode(*group, *discover, *durable))?;
            let config = base_config(&cli, "listen");
            let guard = connect(&cli, &config).await?;

            log_debug!("listening on {pipe}");
            let listener = Listener::new(guard.bus(), pipe, config, Arc::new(StdoutSink));
            let result = listener.listen(cancel).await;
            finish(guard, result).await
        }
        Command::Notify {
            name,
            message,
            discover,
            durable,
            timeout,
        } => {
            let pipe = Pipe::new(name.as_str(), notify_mode(*discover, *durable))?;
            let mut config = base_config(&cli, "notify");
            if let Some(timeout) = timeout {
                config = config.with_timeout(*timeout);
            }
            let input = Input::from_message(message.clone().unwrap_or_default());
            let guard = connect(&cli, &config).await?;

            let mut notifier = Notifier::new(guard.bus(), pipe, config);
            let result = notifier.notify(input, cancel).await;
            finish(guard, result).await
        }
        Command::Setup { name } => {
            let config = base_config(&cli, "setup");
            let guard = connect(&cli, &config).await?;

            let result = async {
                let provisioner = Provisioner::new(guard.work_queue().await?, config.provision_timeout);
                provisioner.ensure_stream().await?;
                if let Some(name) = name {
                    let pipe = Pipe::new(name.as_str(), Mode::Durable)?;
                    provisioner.ensure_consumer(pipe.name()).await?;
                }
                Ok::<(), PipeError>(())
            }
            .await;
            finish(guard, result).await
        }
    }
}

fn main() -> ExitCode {
    // ---
    let cli = Cli::parse();
    init_logging(cli.debug);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("could not start the runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log_debug!("interrupted");
                interrupt.cancel();
            }
        });

        run(cli, &cancel).await
    });

    // a stdin read abandoned on interrupt never finishes
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is_cancelled() => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
