//! Pitshare CLI
//!
//! Thin wrapper around pitshare-core for sharing telemetry from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Print the room id for a team session
//! pitshare room 4412 7
//!
//! # Host a room, feeding simulator data as JSON lines on stdin
//! sim-feed | pitshare host --room ird-team-4412-7
//!
//! # Join a host and print every received envelope as a JSON line
//! pitshare join ird-team-4412-7
//!
//! # Pick host or guest automatically from the simulator feed
//! sim-feed | pitshare auto
//! ```
//!
//! Input lines look like `{"telemetry": {...}}`, `{"session": {...}}` or
//! `{"fuel_history": [...]}`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use iroh::EndpointAddr;
use pitshare_core::sync::resolve_endpoint_id;
use pitshare_core::{
    room_id, AutoTeamSync, IrohTransportFactory, PeerId, RoleCoordinator, ShareConfig,
    Subscription, TelemetryRecord,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

/// Pitshare - live race telemetry sharing
#[derive(Parser)]
#[command(name = "pitshare")]
#[command(version)]
#[command(about = "Pitshare - live race telemetry sharing between teammates")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    timing: Timing,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Timing {
    /// Host broadcast-cycle period
    #[arg(long, global = true, env = "PITSHARE_TELEMETRY_INTERVAL_MS", default_value_t = 200)]
    telemetry_interval_ms: u64,

    /// Minimum gap between session snapshots
    #[arg(long, global = true, env = "PITSHARE_SESSION_INTERVAL_MS", default_value_t = 2000)]
    session_interval_ms: u64,

    /// Keep-alive period
    #[arg(long, global = true, env = "PITSHARE_KEEP_ALIVE_INTERVAL_MS", default_value_t = 5000)]
    keep_alive_interval_ms: u64,

    /// Maximum number of drivers shared per session snapshot
    #[arg(long, global = true, env = "PITSHARE_MAX_DRIVERS", default_value_t = 100)]
    max_drivers: usize,
}

impl Timing {
    fn to_config(&self) -> ShareConfig {
        ShareConfig {
            telemetry_interval_ms: self.telemetry_interval_ms,
            session_interval_ms: self.session_interval_ms,
            keep_alive_interval_ms: self.keep_alive_interval_ms,
            max_drivers: self.max_drivers,
            ..ShareConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session, reading simulator data from stdin
    Host {
        /// Fixed room id (random identity when omitted)
        #[arg(short, long)]
        room: Option<String>,
    },

    /// Join a host and print received messages
    Join {
        /// Room id or endpoint id of the host
        host_id: String,

        /// Direct address of the host, skipping discovery (repeatable)
        #[arg(long = "addr")]
        addrs: Vec<SocketAddr>,
    },

    /// Host while on track, join while off track
    Auto,

    /// Print the room id for a simulator session and team
    Room {
        /// Simulator session id
        session_id: i64,
        /// Team id
        team_id: i64,
    },
}

/// One line of simulator input
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FeedLine {
    Telemetry(TelemetryRecord),
    Session(Value),
    FuelHistory(Vec<Value>),
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn parse_feed_line(text: &str) -> Result<FeedLine> {
    serde_json::from_str(text).with_context(|| {
        let preview: String = text.chars().take(40).collect();
        format!("Invalid input line: {}", preview)
    })
}

/// Status changes go to stderr so stdout stays machine readable
fn print_status(coordinator: &RoleCoordinator) -> Subscription {
    coordinator.on_status_change(|status| eprintln!("[status] {}", status))
}

/// Every received message as one JSON line on stdout
fn print_data(coordinator: &RoleCoordinator) -> Subscription {
    coordinator.on_data(|event| match serde_json::to_string(&event.message) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Could not print received message"),
    })
}

fn feed(coordinator: &RoleCoordinator, auto: Option<&mut AutoTeamSync>, line: FeedLine) {
    match line {
        FeedLine::Telemetry(record) => {
            if let Some(auto) = auto {
                auto.observe_telemetry(&record);
                auto.apply(coordinator);
            }
            coordinator.update_telemetry(record);
        }
        FeedLine::Session(session) => {
            if let Some(auto) = auto {
                auto.observe_session(&session);
                auto.apply(coordinator);
            }
            coordinator.update_session(session);
        }
        FeedLine::FuelHistory(history) => coordinator.update_fuel_history(history),
    }
}

/// Feed stdin to the coordinator until Ctrl+C. After EOF the last snapshots
/// keep being shared.
async fn pump_stdin(coordinator: &RoleCoordinator, mut auto: Option<AutoTeamSync>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                eprintln!("Received shutdown signal...");
                return Ok(());
            }
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(text) if text.trim().is_empty() => {}
                    Some(text) => match parse_feed_line(&text) {
                        Ok(line) => feed(coordinator, auto.as_mut(), line),
                        Err(e) => eprintln!("{:#}", e),
                    },
                    None => {
                        debug!("Input closed");
                        eprintln!("Input closed, still sharing. Press Ctrl+C to stop.");
                        break;
                    }
                }
            }
        }
    }

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    let config = cli.timing.to_config();

    match cli.command {
        Commands::Room { session_id, team_id } => {
            println!("{}", room_id(session_id, team_id));
        }

        Commands::Host { room } => {
            let coordinator = RoleCoordinator::builder(Arc::new(IrohTransportFactory::new()))
                .config(config)
                .build();
            let _status = print_status(&coordinator);

            coordinator.start_hosting(room.as_deref());
            pump_stdin(&coordinator, None).await?;

            coordinator.stop();
        }

        Commands::Join { host_id, addrs } => {
            let mut factory = IrohTransportFactory::new();
            if !addrs.is_empty() {
                let endpoint = resolve_endpoint_id(&PeerId::from(host_id.as_str()));
                let addr = addrs
                    .into_iter()
                    .fold(EndpointAddr::new(endpoint), |addr, ip| addr.with_ip_addr(ip));
                factory = factory.with_peer_addr(addr);
            }

            let coordinator = RoleCoordinator::builder(Arc::new(factory))
                .config(config)
                .build();
            let _status = print_status(&coordinator);
            let _data = print_data(&coordinator);

            coordinator.join_session(&host_id);
            tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;

            eprintln!("Leaving session...");
            coordinator.stop();
        }

        Commands::Auto => {
            let coordinator = RoleCoordinator::builder(Arc::new(IrohTransportFactory::new()))
                .config(config)
                .build();
            let _status = print_status(&coordinator);
            let _data = print_data(&coordinator);

            pump_stdin(&coordinator, Some(AutoTeamSync::new(true))).await?;

            coordinator.stop();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_line_shapes() {
        assert!(matches!(
            parse_feed_line(r#"{"telemetry": {"FuelLevel": 12.5}}"#).unwrap(),
            FeedLine::Telemetry(record) if record.contains_key("FuelLevel")
        ));
        assert!(matches!(
            parse_feed_line(r#"{"fuel_history": [{"lap": 1}]}"#).unwrap(),
            FeedLine::FuelHistory(history) if history.len() == 1
        ));
        assert!(matches!(
            parse_feed_line(r#"{"session": {"WeekendInfo": {}}}"#).unwrap(),
            FeedLine::Session(_)
        ));
    }

    #[test]
    fn test_feed_line_rejects_unknown_keys() {
        let err = parse_feed_line(r#"{"weather": {}}"#).unwrap_err();
        assert!(err.to_string().contains("Invalid input line"));
        assert!(parse_feed_line("not json").is_err());
    }

    #[test]
    fn test_timing_maps_to_config() {
        let cli = Cli::parse_from(["pitshare", "--telemetry-interval-ms", "100", "room", "1", "2"]);
        let config = cli.timing.to_config();
        assert_eq!(config.telemetry_interval_ms, 100);
        assert_eq!(config.session_interval_ms, 2000);
        assert_eq!(config.relay, ShareConfig::default().relay);
    }
}
