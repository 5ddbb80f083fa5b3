use crate::notify::{DeliveryBackend, DesktopBackend, LineBackend, PermissionDecision, PermissionGate};
use crate::remote::{ChannelConfig, ChannelState, ChannelStatus, FixtureSource, LiveChannelClient};
use crate::session::{SessionHandle, SessionToken};
use crate::store::{NotificationStore, SharedStore};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_DEMO_COUNT: u64 = 8;
const DEFAULT_DEMO_INTERVAL_MS: u64 = 1000;

pub const HELP_TEXT: &str = "\
tickethawk - ticket alert notification watcher

Usage:
  tickethawk watch --url <ws-url> --token <token> [options]
  tickethawk demo [options]

Commands:
  watch   Connect to the live push channel and collect notifications
  demo    Replay built-in fixture events without a server

Options (watch):
      --url <ws-url>        Push channel endpoint (ws:// or wss://)
      --token <token>       Session token presented at handshake
      --max-attempts <n>    Failed connects tolerated before giving up
      --base-delay-ms <ms>  Initial reconnect delay
      --desktop             Deliver through the desktop notifier

Options (demo):
      --count <n>           Fixture events to emit (default 8)
      --interval-ms <ms>    Delay between fixture events (default 1000)
      --desktop             Deliver through the desktop notifier

  -h, --help     Print help
  -V, --version  Print version
";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Command(CliCommand),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliCommand {
    Watch {
        url: String,
        token: String,
        max_attempts: Option<u32>,
        base_delay_ms: Option<u64>,
        desktop: bool,
    },
    Demo {
        count: u64,
        interval_ms: u64,
        desktop: bool,
    },
}

#[derive(Debug, Error)]
pub enum CliParseError {
    #[error("unknown subcommand: {0}")]
    UnknownSubcommand(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("missing value for flag: {0}")]
    MissingFlagValue(String),

    #[error("missing required flag: {0}")]
    MissingRequiredFlag(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidFlagValue { flag: String, value: String },

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliInvocation::PrintHelp);
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        return Ok(CliInvocation::PrintVersion);
    }

    let mut iter = args.iter().skip(1);
    let Some(subcommand) = iter.next() else {
        return Ok(CliInvocation::PrintHelp);
    };

    match subcommand.as_str() {
        "watch" => {
            let mut url: Option<String> = None;
            let mut token: Option<String> = None;
            let mut max_attempts: Option<u32> = None;
            let mut base_delay_ms: Option<u64> = None;
            let mut desktop = false;

            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--url" | "-u" => {
                        let value = iter
                            .next()
                            .ok_or_else(|| CliParseError::MissingFlagValue("--url".to_string()))?;
                        url = Some(value.to_string());
                    }
                    "--token" | "-t" => {
                        let value = iter
                            .next()
                            .ok_or_else(|| CliParseError::MissingFlagValue("--token".to_string()))?;
                        token = Some(value.to_string());
                    }
                    "--max-attempts" => {
                        let value = iter.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--max-attempts".to_string())
                        })?;
                        max_attempts = Some(parse_u32_flag("--max-attempts", value)?);
                    }
                    "--base-delay-ms" => {
                        let value = iter.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--base-delay-ms".to_string())
                        })?;
                        base_delay_ms = Some(parse_u64_flag("--base-delay-ms", value)?);
                    }
                    "--desktop" => {
                        desktop = true;
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ => {
                        return Err(CliParseError::UnexpectedArgument(arg.to_string()));
                    }
                }
            }

            let url =
                url.ok_or_else(|| CliParseError::MissingRequiredFlag("--url".to_string()))?;
            let token =
                token.ok_or_else(|| CliParseError::MissingRequiredFlag("--token".to_string()))?;

            Ok(CliInvocation::Command(CliCommand::Watch {
                url,
                token,
                max_attempts,
                base_delay_ms,
                desktop,
            }))
        }
        "demo" => {
            let mut count = DEFAULT_DEMO_COUNT;
            let mut interval_ms = DEFAULT_DEMO_INTERVAL_MS;
            let mut desktop = false;

            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--count" | "-c" => {
                        let value = iter
                            .next()
                            .ok_or_else(|| CliParseError::MissingFlagValue("--count".to_string()))?;
                        count = parse_u64_flag("--count", value)?;
                    }
                    "--interval-ms" => {
                        let value = iter.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--interval-ms".to_string())
                        })?;
                        interval_ms = parse_u64_flag("--interval-ms", value)?;
                    }
                    "--desktop" => {
                        desktop = true;
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ => {
                        return Err(CliParseError::UnexpectedArgument(arg.to_string()));
                    }
                }
            }

            Ok(CliInvocation::Command(CliCommand::Demo {
                count,
                interval_ms,
                desktop,
            }))
        }
        other => Err(CliParseError::UnknownSubcommand(other.to_string())),
    }
}

#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("invalid channel url {url}: {reason}")]
    ChannelUrl { url: String, reason: String },

    #[error("failed to start async runtime: {0}")]
    Runtime(String),

    #[error(transparent)]
    WriteOutput(#[from] io::Error),
}

pub fn run(command: CliCommand) -> Result<(), CliRunError> {
    match command {
        CliCommand::Watch {
            url,
            token,
            max_attempts,
            base_delay_ms,
            desktop,
        } => run_watch(url, token, max_attempts, base_delay_ms, desktop),
        CliCommand::Demo {
            count,
            interval_ms,
            desktop,
        } => run_demo(count, interval_ms, desktop),
    }
}

fn run_watch(
    url: String,
    token: String,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    desktop: bool,
) -> Result<(), CliRunError> {
    let url = Url::parse(&url).map_err(|error| CliRunError::ChannelUrl {
        url: url.clone(),
        reason: error.to_string(),
    })?;

    let gate = build_gate(desktop);
    let store = SharedStore::new(NotificationStore::with_sink(gate));
    let (session, session_rx) = SessionHandle::new();

    let mut config = ChannelConfig::new(url);
    if let Some(attempts) = max_attempts {
        config.max_attempts = attempts.max(1);
    }
    if let Some(ms) = base_delay_ms {
        config.base_delay = Duration::from_millis(ms);
    }
    let (client, status_rx) = LiveChannelClient::new(config, store.clone(), session_rx);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| CliRunError::Runtime(error.to_string()))?;

    let final_status = runtime.block_on(async move {
        session.login(SessionToken::new(token));
        let client_task = tokio::spawn(client.run());

        let mut printer_rx = status_rx.clone();
        let printer = tokio::spawn(async move {
            let mut last_state = ChannelState::Disconnected;
            let mut reported_degraded = false;
            loop {
                if printer_rx.changed().await.is_err() {
                    return;
                }
                let status = printer_rx.borrow().clone();
                if status.state != last_state {
                    eprintln!("channel: {}", state_label(status.state));
                    last_state = status.state;
                }
                if status.degraded && !reported_degraded {
                    reported_degraded = true;
                    eprintln!(
                        "channel degraded: {}",
                        status.degraded_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        });

        let _ = tokio::signal::ctrl_c().await;
        session.logout();

        // Bounded wait for the channel to acknowledge the logout.
        let mut teardown_rx = status_rx.clone();
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if teardown_rx.borrow().state == ChannelState::Disconnected {
                    break;
                }
                if teardown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        let final_status = status_rx.borrow().clone();
        client_task.abort();
        printer.abort();
        final_status
    });

    print_summary(&store, Some(&final_status))
}

fn run_demo(count: u64, interval_ms: u64, desktop: bool) -> Result<(), CliRunError> {
    let gate = build_gate(desktop);
    let store = SharedStore::new(NotificationStore::with_sink(gate));
    let (session, session_rx) = SessionHandle::new();
    let source = FixtureSource::new(
        store.clone(),
        session_rx,
        Duration::from_millis(interval_ms),
        count,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| CliRunError::Runtime(error.to_string()))?;

    runtime.block_on(async move {
        session.login(SessionToken::new("demo-session"));
        tokio::select! {
            () = source.run() => {}
            _ = tokio::signal::ctrl_c() => {
                session.logout();
            }
        }
    });

    print_summary(&store, None)
}

fn build_gate(desktop: bool) -> Arc<PermissionGate> {
    let backend: Box<dyn DeliveryBackend> = if desktop {
        Box::new(DesktopBackend)
    } else {
        Box::new(LineBackend)
    };
    let gate = Arc::new(PermissionGate::new(backend));
    match gate.request_permission() {
        PermissionDecision::Granted => {}
        PermissionDecision::Unsupported => {
            eprintln!("desktop notifier not found; notifications disabled");
        }
        PermissionDecision::Denied => {
            eprintln!("notification permission denied; notifications disabled");
        }
    }
    gate
}

fn print_summary(store: &SharedStore, channel: Option<&ChannelStatus>) -> Result<(), CliRunError> {
    let stderr = io::stderr();
    let mut err = io::BufWriter::new(stderr.lock());

    let line = format!(
        "notifications: {} total, {} unread",
        store.len(),
        store.unread_count()
    );
    if !write_line(&mut err, &line)? {
        return Ok(());
    }

    if let Some(status) = channel {
        let line = format!(
            "channel: ingested={} duplicates={} dropped={}",
            status.ingested, status.duplicates, status.dropped
        );
        if !write_line(&mut err, &line)? {
            return Ok(());
        }
        if status.degraded {
            let reason = status.degraded_reason.as_deref().unwrap_or("unknown");
            if !write_line(&mut err, &format!("channel degraded: {reason}"))? {
                return Ok(());
            }
        }
    }

    Ok(())
}

fn state_label(state: ChannelState) -> &'static str {
    match state {
        ChannelState::Disconnected => "disconnected",
        ChannelState::Connecting => "connecting",
        ChannelState::Connected => "connected",
        ChannelState::Reconnecting => "reconnecting",
    }
}

fn write_line(out: &mut impl Write, line: &str) -> io::Result<bool> {
    match writeln!(out, "{line}") {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::BrokenPipe => Ok(false),
        Err(error) => Err(error),
    }
}

fn parse_u32_flag(flag: &str, value: &str) -> Result<u32, CliParseError> {
    value
        .parse::<u32>()
        .map_err(|_| CliParseError::InvalidFlagValue {
            flag: flag.to_string(),
            value: value.to_string(),
        })
}

fn parse_u64_flag(flag: &str, value: &str) -> Result<u64, CliParseError> {
    value
        .parse::<u64>()
        .map_err(|_| CliParseError::InvalidFlagValue {
            flag: flag.to_string(),
            value: value.to_string(),
        })
}
