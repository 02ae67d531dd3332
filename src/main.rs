mod alerts;
mod classify;
mod collector;
mod config;
mod http;
mod inventory;
mod metrics;
mod monitor;
mod probe;
mod refresh;
mod snapshot;

use axum::serve;
use clap::Parser;
use collector::simulated::SimulatedCollector;
use collector::{CollectSettings, FleetCollector, ProbeCollector};
use config::{CollectorKind, Config};
use inventory::{FileInventory, Inventory, StaticInventory};
use metrics::Metrics;
use monitor::FleetMonitor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Use the simulated collector regardless of the config file.
    #[arg(long)]
    simulate: bool,
    /// Serve the API only; the refresh loop can still be started over HTTP.
    #[arg(long)]
    no_background: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if cli.simulate {
        cfg.collector = CollectorKind::Simulated;
    }

    let interval = cfg.refresh_interval();
    info!(
        listen = %cfg.listen,
        mode = ?cfg.mode,
        collector = ?cfg.collector,
        interval = %humantime::format_duration(interval),
        max_parallel = cfg.max_parallel,
        "запуск fleetwatch"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let monitor = Arc::new(FleetMonitor::new(
        build_inventory(&cfg),
        build_collector(&cfg),
        metrics.clone(),
        cfg.alerts.clone(),
        cfg.stop_grace(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let app = http::build_router(metrics.clone(), monitor.clone(), interval);
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    if !cli.no_background {
        // first snapshot right away instead of after a full interval
        let warmup = monitor.clone();
        tokio::spawn(async move {
            if let Err(err) = warmup.refresh_now().await {
                warn!(error = %err, "первичный сбор не удался");
            }
        });
        if let Err(err) = monitor.start_background_refresh(interval).await {
            error!(error = %err, "не удалось запустить фоновое обновление");
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    match monitor.stop_background_refresh().await {
        Ok(outcome) => info!(outcome = ?outcome, "цикл обновления остановлен"),
        Err(err) => info!(error = %err, "цикл обновления не был запущен"),
    }

    let _ = shutdown_tx.send(true);
    let _ = http_task.await;
}

fn build_inventory(cfg: &Config) -> Arc<dyn Inventory> {
    match &cfg.inventory.file {
        Some(path) => {
            info!(path = %path.display(), "инвентарь читается из файла");
            Arc::new(FileInventory::new(path.clone()))
        }
        None => Arc::new(StaticInventory::new(cfg.inventory.devices.clone())),
    }
}

fn build_collector(cfg: &Config) -> Arc<dyn FleetCollector> {
    match cfg.collector {
        CollectorKind::Live => Arc::new(ProbeCollector::new(CollectSettings::from(cfg))),
        CollectorKind::Simulated => {
            warn!("включён режим симуляции: данные не отражают реальное состояние сети");
            Arc::new(SimulatedCollector::new(
                cfg.simulation_seed,
                cfg.thresholds,
            ))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
