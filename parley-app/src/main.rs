//! `parley`: console host for the Parley conversation engine.
//!
//! ```text
//! parley [--settings <path>] [--list-devices]
//! ```
//!
//! Runs one conversation against the built-in loopback remote, printing each
//! finalized turn, until Ctrl-C or the session ends.

mod settings;

use std::path::PathBuf;

use anyhow::{bail, Context};
use parley_core::audio::device::{list_input_devices, list_output_devices, DeviceInfo};
use parley_core::{
    ConnectionState, CpalBackend, LoopbackConnector, ParleyEngine, Speaker, TurnEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use settings::{default_settings_path, load_settings, save_settings};

const DEFAULT_LOG_FILTER: &str = "parley=info,parley_core=info";

#[derive(Debug, Default)]
struct Args {
    settings: Option<PathBuf>,
    list_devices: bool,
    help: bool,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args::default();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--list-devices" => args.list_devices = true,
            "--settings" => {
                let path = raw.next().context("--settings needs a path")?;
                args.settings = Some(PathBuf::from(path));
            }
            "-h" | "--help" => args.help = true,
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn print_devices(title: &str, devices: &[DeviceInfo]) {
    println!("{title}:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{marker}", device.name);
    }
}

fn speaker_label(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::User => "you",
        Speaker::Model => "model",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("usage: parley [--settings <path>] [--list-devices]");
        return Ok(());
    }
    if args.list_devices {
        print_devices("Input devices", &list_input_devices());
        print_devices("Output devices", &list_output_devices());
        return Ok(());
    }

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = args.settings.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    if !settings_path.exists() {
        match save_settings(&settings_path, &settings) {
            Ok(()) => info!(path = %settings_path.display(), "wrote default settings"),
            Err(e) => warn!("failed to write default settings: {e}"),
        }
    }
    settings.apply_env_overrides();
    settings.normalize();

    // ── Engine ────────────────────────────────────────────────────────────
    let backend = CpalBackend::new()
        .with_input_device(settings.preferred_input_device.clone())
        .with_output_device(settings.preferred_output_device.clone());
    let connector = LoopbackConnector::new(settings.loopback_turn_blocks);
    let engine = ParleyEngine::spawn(settings.session_config(), backend, connector);

    let mut turns = engine.subscribe_turns();
    let mut status = engine.subscribe_status();

    info!("Parley starting");
    if let Err(e) = engine.start().await {
        eprintln!("{}", e.user_message());
        return Err(e.into());
    }
    println!("Listening. Press Ctrl-C to stop.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received");
                break;
            }
            turn = turns.recv() => match turn {
                Ok(TurnEvent::Appended { record, .. }) => {
                    println!("{:>5}: {}", speaker_label(record.speaker), record.text)
                }
                Ok(TurnEvent::Cleared { .. }) => println!("--- new conversation ---"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "turn events lagged"),
                Err(RecvError::Closed) => break,
            },
            event = status.recv() => match event {
                Ok(event) => match event.state {
                    ConnectionState::Error => {
                        eprintln!("{}", event.detail.unwrap_or_else(|| "session failed".into()));
                        break;
                    }
                    ConnectionState::Disconnected => {
                        println!("Session ended.");
                        break;
                    }
                    ConnectionState::Connected => println!("Connected."),
                    ConnectionState::Connecting => {}
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.stop().await?;
    let snap = engine.diagnostics_snapshot();
    info!(
        blocks_sent = snap.blocks_sent,
        chunks_scheduled = snap.chunks_scheduled,
        turns = snap.turns_completed,
        decode_errors = snap.decode_errors,
        "Parley stopped"
    );
    Ok(())
}
