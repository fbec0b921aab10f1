use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use control_app::services::{
    ClearScheduleRequest, ReadRegisterRequest, SetScheduleSlotRequest, SetSchedulePowerRequest,
    WriteRegisterRequest,
};
use control_app::{install_metrics, router, AppState, ControlConfig, ControlService};
use journal::JournalStore;
use modbus_client::ModbusClient;
use schedule::{DaySelector, SlotMode, Weekday};
use types::{DataType, RegisterKind};

#[derive(Debug, Parser)]
#[command(name = "solplanet-control", author, version, about, long_about = None)]
struct Cli {
    /// TOML or JSON config file; falls back to SOLPLANET_CONFIG.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP control API.
    Serve {
        /// Overrides http.bind.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Write one holding register value.
    WriteRegister {
        #[arg(long)]
        device_address: i64,
        #[arg(long)]
        register_address: i64,
        #[arg(long)]
        data_type: DataType,
        #[arg(long, allow_hyphen_values = true)]
        value: i64,
        /// Log the frame without sending it.
        #[arg(long)]
        dry_run: bool,
    },
    ReadRegister {
        #[arg(long)]
        device_address: i64,
        #[arg(long)]
        register_address: i64,
        #[arg(long)]
        data_type: DataType,
        #[arg(long, default_value = "holding")]
        kind: RegisterKind,
    },
    SetScheduleSlot {
        #[arg(long)]
        battery: String,
        #[arg(long)]
        day: Weekday,
        #[arg(long)]
        start_hour: i64,
        #[arg(long, default_value_t = 0)]
        start_minute: i64,
        #[arg(long)]
        duration: i64,
        #[arg(long)]
        mode: SlotMode,
        #[arg(long)]
        dry_run: bool,
    },
    ClearSchedule {
        #[arg(long)]
        battery: String,
        /// A weekday or `all`.
        #[arg(long)]
        day: DaySelector,
        #[arg(long)]
        dry_run: bool,
    },
    ShowSchedule {
        #[arg(long)]
        battery: String,
    },
    SetSchedulePower {
        #[arg(long)]
        battery: String,
        #[arg(long)]
        pin: Option<i64>,
        #[arg(long)]
        pout: Option<i64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the most recent journaled commands.
    Journal {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ControlConfig::load_with_path(cli.config).context("load config failed")?;
    if let Command::Serve {
        bind: Some(bind), ..
    } = &cli.command
    {
        config.http_bind = bind.clone();
    }
    config.validate().context("config validation failed")?;

    let journal = open_journal(&config).await;
    let client = ModbusClient::new(config.modbus.clone());
    let service = ControlService::new(client, journal, &config).context("service init failed")?;

    match cli.command {
        Command::Serve { .. } => serve(&config, service).await,
        Command::WriteRegister {
            device_address,
            register_address,
            data_type,
            value,
            dry_run,
        } => print_json(
            &service
                .write_register(WriteRegisterRequest {
                    device_address,
                    register_address,
                    data_type,
                    value,
                    dry_run,
                })
                .await?,
        ),
        Command::ReadRegister {
            device_address,
            register_address,
            data_type,
            kind,
        } => print_json(
            &service
                .read_register(ReadRegisterRequest {
                    device_address,
                    register_address,
                    data_type,
                    kind,
                })
                .await?,
        ),
        Command::SetScheduleSlot {
            battery,
            day,
            start_hour,
            start_minute,
            duration,
            mode,
            dry_run,
        } => print_json(
            &service
                .set_schedule_slot(SetScheduleSlotRequest {
                    battery,
                    day,
                    start_hour,
                    start_minute,
                    duration,
                    mode,
                    dry_run,
                })
                .await?,
        ),
        Command::ClearSchedule {
            battery,
            day,
            dry_run,
        } => print_json(
            &service
                .clear_schedule(ClearScheduleRequest {
                    battery,
                    day,
                    dry_run,
                })
                .await?,
        ),
        Command::ShowSchedule { battery } => print_json(&service.get_schedule(&battery).await?),
        Command::SetSchedulePower {
            battery,
            pin,
            pout,
            dry_run,
        } => print_json(
            &service
                .set_schedule_power(SetSchedulePowerRequest {
                    battery,
                    pin,
                    pout,
                    dry_run,
                })
                .await?,
        ),
        Command::Journal { limit } => print_json(&service.recent_journal(limit).await?),
    }
}

async fn open_journal(config: &ControlConfig) -> Option<JournalStore> {
    match JournalStore::new(&config.journal_path).await {
        Ok(journal) => Some(journal),
        Err(err) => {
            warn!(path = %config.journal_path, error = %err, "command journal unavailable");
            None
        }
    }
}

async fn serve(config: &ControlConfig, service: ControlService) -> Result<()> {
    let metrics = install_metrics().context("metrics recorder init failed")?;
    let state = AppState {
        service: Arc::new(service),
        metrics: Some(metrics),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("bind {}", config.http_bind))?;
    info!(
        bind = %config.http_bind,
        batteries = config.batteries.len(),
        transport = ?config.modbus.transport,
        "control API listening"
    );

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, router(state)).with_graceful_shutdown(async move {
        while server_shutdown.changed().await.is_ok() {
            if *server_shutdown.borrow() {
                break;
            }
        }
    });
    let server_handle = tokio::spawn(async move { server.await });

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    server_handle
        .await
        .context("server task failed")?
        .context("server error")?;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("render output")?
    );
    Ok(())
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
