use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pastelink_core::applier::{self, ApplyError, ClipboardApplier, CredentialApplier, StdoutApplier};
use pastelink_core::config::Config;
use pastelink_core::controller::driver::{DriverError, SessionDriver, SessionHandle};
use pastelink_core::controller::{ConnectionController, ControllerError, Notice};
use pastelink_core::session::Phase;
use pastelink_core::status;
use pastelink_core::store::MemoryStateStore;
use pastelink_core::telemetry::{self, LogConfig, LogLevel};
use pastelink_core::transport::TransportError;
use pastelink_core::transport::webrtc::{WebRtcConfig, WebRtcTransport};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::{debug, info};

const PEER_CLOSE_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    telemetry::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = cli.network.apply(Config::from_env());
    info!(ice_servers = ?config.ice_servers, "configuration loaded");

    let handle = start_session(&config)?;
    let result = match cli.command {
        Command::Send => handle_send(&handle).await,
        Command::Receive(args) => handle_receive(&handle, args).await,
    };
    handle.shutdown().await;
    result
}

#[derive(Parser, Debug)]
#[command(
    name = "pastelink",
    about = "Hand a password to another machine over a direct WebRTC data channel",
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(flatten)]
    network: NetworkArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "PASTELINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "PASTELINK_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
struct NetworkArgs {
    #[arg(
        long = "ice-server",
        value_name = "URL",
        global = true,
        help = "ICE server URL; repeat for several (replaces PASTELINK_ICE_SERVERS)"
    )]
    ice_servers: Vec<String>,

    #[arg(long = "no-stun", global = true, help = "Only use host (and relay) candidates")]
    no_stun: bool,

    #[arg(
        long = "discovery-timeout-ms",
        value_name = "MS",
        global = true,
        help = "How long to wait for candidate gathering before printing a code"
    )]
    discovery_timeout_ms: Option<u64>,
}

impl NetworkArgs {
    fn apply(&self, mut config: Config) -> Config {
        if !self.ice_servers.is_empty() {
            config = config.with_ice_servers(self.ice_servers.clone());
        }
        if self.no_stun {
            config = config.without_stun();
        }
        if let Some(ms) = self.discovery_timeout_ms.filter(|ms| *ms > 0) {
            config = config.with_discovery_timeout(Duration::from_millis(ms));
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a connection code, then send a password once the receiver answers
    Send,
    /// Answer a sender's connection code and apply the password it sends
    Receive(ReceiveArgs),
}

#[derive(Args, Debug)]
struct ReceiveArgs {
    #[arg(
        long = "apply",
        value_enum,
        default_value_t = ApplyTarget::Clipboard,
        help = "Where the received password goes"
    )]
    apply: ApplyTarget,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum ApplyTarget {
    Clipboard,
    Stdout,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Logging(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("input closed before a code was entered")]
    InputClosed,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("the sender closed the connection before a password arrived")]
    ClosedEarly,
}

fn start_session(config: &Config) -> Result<SessionHandle, CliError> {
    let transport = WebRtcTransport::new(WebRtcConfig::from_config(config))?;
    let controller = ConnectionController::new(
        Arc::new(transport),
        Arc::new(MemoryStateStore::new()),
        config.clone(),
    );
    let handle = SessionDriver::spawn(controller);
    tokio::spawn(report_progress(handle.subscribe()));
    Ok(handle)
}

/// Mirrors controller notices onto stderr.
async fn report_progress(mut notices: broadcast::Receiver<Notice>) {
    loop {
        match notices.recv().await {
            Ok(Notice::PhaseChanged { role, phase }) => {
                if phase != Phase::Idle {
                    eprintln!("{}", status::phase_text(role, phase));
                }
            }
            Ok(Notice::ChannelRecreated { label, .. }) => {
                eprintln!("Data channel stalled; retrying on {label}...");
            }
            Ok(Notice::RecoveryRequired { action, .. }) => {
                eprintln!("To recover, {}.", status::recovery_text(action));
            }
            Ok(Notice::ConnectionStatus(state)) => debug!(status = %state, "connection status"),
            Ok(Notice::CodeReady { .. } | Notice::CredentialReceived) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress reporter lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

struct Prompt {
    lines: Lines<BufReader<Stdin>>,
}

impl Prompt {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Reads the next non-empty line.
    async fn line(&mut self, prompt: &str) -> Result<String, CliError> {
        loop {
            eprint!("{prompt}");
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(line),
                None => return Err(CliError::InputClosed),
            }
        }
    }

    async fn confirm(&mut self, question: &str) -> Result<bool, CliError> {
        let answer = self.line(&format!("{question} [y/n] ")).await?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

/// Codes the user can fix by pasting again.
fn retryable(err: &DriverError) -> bool {
    matches!(
        err,
        DriverError::Controller(
            ControllerError::InvalidFormat(_) | ControllerError::RemoteDescriptorRejected(_)
        )
    )
}

enum Outcome {
    Open,
    CredentialReceived,
    Failed,
    Closed,
}

async fn wait_for(
    notices: &mut broadcast::Receiver<Notice>,
    wanted: impl Fn(&Notice) -> Option<Outcome>,
) -> Result<Outcome, CliError> {
    loop {
        match notices.recv().await {
            Ok(notice) => {
                if let Some(outcome) = wanted(&notice) {
                    return Ok(outcome);
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err(DriverError::Stopped.into()),
        }
    }
}

async fn handle_send(handle: &SessionHandle) -> Result<(), CliError> {
    let mut prompt = Prompt::new();
    let mut notices = handle.subscribe();

    loop {
        let code = handle.initiate().await?;
        eprintln!("Share this connection code with the receiver:");
        println!("{code}");

        loop {
            let answer = prompt.line("Paste the receiver's answer code: ").await?;
            match handle.submit_answer(&answer).await {
                Ok(()) => break,
                Err(err) if retryable(&err) => eprintln!("{err}"),
                Err(err) => return Err(err.into()),
            }
        }

        let outcome = wait_for(&mut notices, |notice| match notice {
            Notice::PhaseChanged {
                phase: Phase::Open, ..
            } => Some(Outcome::Open),
            Notice::PhaseChanged {
                phase: Phase::Failed,
                ..
            } => Some(Outcome::Failed),
            _ => None,
        })
        .await?;
        match outcome {
            Outcome::Open => break,
            _ => {
                if !prompt.confirm("Generate a new code?").await? {
                    return Err(CliError::ConnectionFailed);
                }
            }
        }
    }

    let password = tokio::task::spawn_blocking(|| rpassword::prompt_password("Password to send: "))
        .await
        .map_err(|err| io::Error::other(err.to_string()))??;
    handle.send_credential(&password).await?;
    eprintln!("Password sent.");

    // the receiver hangs up once it has the password
    let closed = timeout(
        PEER_CLOSE_GRACE,
        wait_for(&mut notices, |notice| match notice {
            Notice::PhaseChanged {
                phase: Phase::Closed,
                ..
            } => Some(Outcome::Closed),
            _ => None,
        }),
    )
    .await;
    if closed.is_err() {
        debug!("receiver did not hang up; closing");
    }
    handle.teardown().await?;
    Ok(())
}

async fn handle_receive(handle: &SessionHandle, args: ReceiveArgs) -> Result<(), CliError> {
    let mut prompt = Prompt::new();
    let mut notices = handle.subscribe();

    loop {
        loop {
            let offer = prompt.line("Paste the sender's connection code: ").await?;
            match handle.submit_offer(&offer).await {
                Ok(answer) => {
                    eprintln!("Send this answer code back to the sender:");
                    println!("{answer}");
                    break;
                }
                Err(err) if retryable(&err) => eprintln!("{err}"),
                Err(err) => return Err(err.into()),
            }
        }

        let outcome = wait_for(&mut notices, |notice| match notice {
            Notice::CredentialReceived => Some(Outcome::CredentialReceived),
            Notice::PhaseChanged {
                phase: Phase::Failed,
                ..
            } => Some(Outcome::Failed),
            Notice::PhaseChanged {
                phase: Phase::Closed,
                ..
            } => Some(Outcome::Closed),
            _ => None,
        })
        .await?;
        match outcome {
            Outcome::CredentialReceived => break,
            Outcome::Closed => return Err(CliError::ClosedEarly),
            _ => {
                if !prompt.confirm("Reconnect with a new code from the sender?").await? {
                    return Err(CliError::ConnectionFailed);
                }
                handle.reconnect().await?;
            }
        }
    }

    let target: Box<dyn CredentialApplier> = match args.apply {
        ApplyTarget::Clipboard => Box::new(ClipboardApplier),
        ApplyTarget::Stdout => Box::new(StdoutApplier),
    };
    let store = handle.store();
    let report = applier::fill_credential(store.as_ref(), target.as_ref()).await?;
    if let Some(warning) = report.warning {
        eprintln!("Password applied ({warning}).");
    } else {
        eprintln!("Password applied.");
    }
    handle.teardown().await?;
    Ok(())
}
