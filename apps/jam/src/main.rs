mod commands;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser};
use jam_link::midi::{self, MidiFilter, SharedSettings, TEST_NOTE_OFF, TEST_NOTE_ON};
use jam_link::telemetry::{self, LogConfig, LogLevel, Role};
use jam_link::{AppMessage, Link, LinkConfig, LinkError, LinkEvent, LinkHandle, MidiEvent};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::commands::{HELP, Input, parse_line};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("jam: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "jam",
    about = "Play MIDI with a peer over a WebRTC data channel",
    version
)]
struct Cli {
    #[arg(value_name = "ROOM", help = "Room to join (letters, digits, '-' and '_')")]
    room: String,

    #[arg(
        long,
        env = "JAM_SIGNALING_URL",
        value_name = "URL",
        help = "Signaling relay endpoint"
    )]
    server: Option<String>,

    #[arg(
        long,
        env = "JAM_CREDENTIALS_URL",
        value_name = "URL",
        help = "TURN credential endpoint, or 'none' to use the built-in servers"
    )]
    credentials: Option<String>,

    #[arg(long = "no-ipv6", help = "Ignore IPv6 candidates")]
    no_ipv6: bool,

    #[arg(long, help = "Send inbound MIDI straight back to the peer")]
    echo: bool,

    #[arg(long, help = "Stamp outgoing MIDI with a local clock")]
    timestamps: bool,

    #[arg(long, help = "Accept and forward SysEx messages")]
    sysex: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "JAM_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "JAM_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    file: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Link(#[from] LinkError),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] telemetry::TelemetryError),
}

/// Local toggles; `/sync` shares them and a peer's sync overwrites them.
#[derive(Debug, Clone, Copy)]
struct Settings {
    echo: bool,
    timestamps: bool,
    sysex: bool,
}

impl Settings {
    fn shared(self) -> SharedSettings {
        SharedSettings {
            sysex_enabled: Some(self.sysex),
            timestamp_enabled: Some(self.timestamps),
            midi_echo_enabled: Some(self.echo),
        }
    }

    fn apply(&mut self, remote: &SharedSettings) {
        if let Some(sysex) = remote.sysex_enabled {
            self.sysex = sysex;
        }
        if let Some(timestamps) = remote.timestamp_enabled {
            self.timestamps = timestamps;
        }
        if let Some(echo) = remote.midi_echo_enabled {
            self.echo = echo;
        }
    }

    fn filter(self) -> MidiFilter {
        MidiFilter {
            sysex_enabled: self.sysex,
        }
    }
}

fn link_config(cli: &Cli) -> LinkConfig {
    let mut config = LinkConfig::from_env();
    if let Some(server) = &cli.server {
        config.signaling_url = server.clone();
    }
    if let Some(credentials) = &cli.credentials {
        config.credentials_url = match credentials.trim() {
            "" | "none" => None,
            url => Some(url.to_string()),
        };
    }
    if cli.no_ipv6 {
        config.candidates.ipv6 = false;
    }
    config
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        role: Role::Client,
        level: cli.logging.level,
        file: cli.logging.file.clone(),
    })?;
    let config = link_config(&cli);
    debug!(?config, "link configuration");

    let mut settings = Settings {
        echo: cli.echo,
        timestamps: cli.timestamps,
        sysex: cli.sysex,
    };
    let clock = Instant::now();
    let (link, mut events) = Link::from_config(config)?;
    link.connect(&cli.room).await?;
    println!("joining room {} ... (/help for commands)", cli.room);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !on_line(&link, &line, settings, clock).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "stdin closed");
                    break;
                }
            },
            event = events.recv() => match event {
                Some(event) => on_event(&link, event, &mut settings, clock).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    link.disconnect().await?;
    Ok(())
}

fn stamp(settings: Settings, clock: Instant) -> Option<f64> {
    settings
        .timestamps
        .then(|| clock.elapsed().as_secs_f64() * 1000.0)
}

/// Returns `false` when the user asked to quit.
async fn on_line(link: &LinkHandle, line: &str, settings: Settings, clock: Instant) -> bool {
    let input = match parse_line(line) {
        Ok(input) => input,
        Err(err) => {
            println!("{err}");
            return true;
        }
    };
    let sent = match input {
        Input::Empty => Ok(()),
        Input::Quit => return false,
        Input::Help => {
            println!("{HELP}");
            Ok(())
        }
        Input::Midi(data) => {
            if settings.filter().allows(&data) {
                link.send_midi(data, stamp(settings, clock)).await
            } else {
                println!("SysEx is disabled; start with --sysex to send it");
                Ok(())
            }
        }
        Input::Ping => link.measure_latency().await,
        Input::Note => send_test_note(link).await,
        Input::Chat(text) => link.send(AppMessage::Chat(text)).await,
        Input::Sync => link.send(AppMessage::SettingsSync(settings.shared())).await,
    };
    if let Err(err) = sent {
        println!("not sent: {err}");
    }
    true
}

async fn send_test_note(link: &LinkHandle) -> Result<(), LinkError> {
    link.send(AppMessage::TestNote(TEST_NOTE_ON.to_vec())).await?;
    let link = link.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Err(err) = link.send(AppMessage::TestNote(TEST_NOTE_OFF.to_vec())).await {
            debug!(error = %err, "test note off not sent");
        }
    });
    Ok(())
}

async fn on_event(link: &LinkHandle, event: LinkEvent, settings: &mut Settings, clock: Instant) {
    match event {
        LinkEvent::Status(notice) => println!("{notice}"),
        LinkEvent::PhaseChanged(phase) => debug!(%phase, "phase"),
        LinkEvent::ChannelOpened { remote_peer } => {
            println!("playing with {remote_peer}");
        }
        LinkEvent::ChannelClosed => println!("peer channel closed"),
        LinkEvent::Message(message) => on_message(link, message, settings, clock).await,
        LinkEvent::Latency(_) | LinkEvent::PathClassified(_) | LinkEvent::Reconnecting { .. } => {}
    }
}

async fn on_message(link: &LinkHandle, message: AppMessage, settings: &mut Settings, clock: Instant) {
    match message {
        AppMessage::Midi(MidiEvent { data, timestamp }) => {
            if !settings.filter().allows(&data) {
                debug!(bytes = data.len(), "dropping SysEx");
                return;
            }
            let label = midi::describe(&data).unwrap_or_else(|| midi::to_hex(&data));
            match timestamp {
                Some(ts) => println!("<- {label} @ {ts:.1} ms"),
                None => println!("<- {label}"),
            }
            if settings.echo {
                if let Err(err) = link.send_midi(data, stamp(*settings, clock)).await {
                    debug!(error = %err, "echo not sent");
                }
            }
        }
        AppMessage::TestNote(data) => {
            let label = midi::describe(&data).unwrap_or_else(|| midi::to_hex(&data));
            println!("<- test note {label}");
        }
        AppMessage::Chat(text) => println!("peer: {text}"),
        AppMessage::SettingsSync(remote) => {
            settings.apply(&remote);
            println!(
                "settings from peer: sysex={} timestamps={} echo={}",
                settings.sysex, settings.timestamps, settings.echo
            );
        }
        AppMessage::Ping(_) | AppMessage::Pong(_) => {}
    }
}
