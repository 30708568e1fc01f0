//! hidpad CLI
//!
//! Lists HID devices, watches a controller's events and fires rumble pulses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use hidpad::{presets, ConnectionState, HidDirectory, Session, SessionConfig};

// CLI definitions
mod cli;
use cli::{Cli, Commands, ConfigSource};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::List { vid, pid } => list(vid, pid),
        Commands::Watch { source, json } => watch(load_config(&source)?, json).await,
        Commands::Rumble {
            source,
            duration_ms,
            connect_timeout_ms,
        } => {
            rumble(
                load_config(&source)?,
                Duration::from_millis(duration_ms),
                Duration::from_millis(connect_timeout_ms),
            )
            .await
        }
        Commands::Presets { dump } => show_presets(dump.as_deref()),
    }
}

fn load_config(source: &ConfigSource) -> Result<SessionConfig> {
    if let Some(name) = &source.preset {
        return presets::preset(name).with_context(|| {
            format!(
                "unknown preset '{}' (available: {})",
                name,
                presets::names().join(", ")
            )
        });
    }
    let path = source
        .config
        .clone()
        .unwrap_or_else(SessionConfig::default_path);
    info!("Loading config from {:?}", path);
    SessionConfig::load(&path).with_context(|| {
        format!("no usable config (try `hidpad presets --dump dualshock4 > {}`)", path.display())
    })
}

fn list(vid: Option<u16>, pid: Option<u16>) -> Result<()> {
    let devices = HidDirectory::list_all(vid, pid).context("enumerating HID devices")?;
    if devices.is_empty() {
        println!("No HID devices found");
    }
    for device in devices {
        println!("{device}");
    }
    Ok(())
}

/// Set up a Ctrl-C handler; the receiver yields once per interrupt
fn setup_interrupt_channel() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }
    rx
}

async fn watch(config: SessionConfig, json: bool) -> Result<()> {
    let mut session = Session::new(config, Arc::new(HidDirectory::new()))?;
    let mut events = session.subscribe();
    let mut interrupt = setup_interrupt_channel();

    session.start()?;
    info!("Watching {} (Ctrl-C to quit)", session.config().device);

    loop {
        tokio::select! {
            _ = interrupt.recv() => break,
            event = events.recv() => match event {
                Ok(event) if json => println!("{}", serde_json::to_string(&event)?),
                Ok(event) => println!("{event}"),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("{} events skipped", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    session.stop().await;
    Ok(())
}

async fn rumble(config: SessionConfig, duration: Duration, connect_timeout: Duration) -> Result<()> {
    let mut session = Session::new(config, Arc::new(HidDirectory::new()))?;
    let mut connection = session.watch_connection();
    session.start()?;

    // The watch guard must not outlive this statement
    let connected = tokio::time::timeout(
        connect_timeout,
        connection.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .is_ok_and(|result| result.is_ok());
    if !connected {
        session.stop().await;
        bail!("{} did not connect within {:?}", session.config().device, connect_timeout);
    }

    session.rumble(duration);
    tokio::time::sleep(duration).await;
    session.stop().await;
    Ok(())
}

fn show_presets(dump: Option<&str>) -> Result<()> {
    match dump {
        Some(name) => {
            let config = presets::preset(name).with_context(|| format!("unknown preset '{name}'"))?;
            print!("{}", config.to_toml_string()?);
        }
        None => {
            for name in presets::names() {
                if let Some(config) = presets::preset(name) {
                    println!("{:<12} {} ({} fields)", name, config.device, config.fields.len());
                }
            }
        }
    }
    Ok(())
}
