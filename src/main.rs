use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use usb_gadget_manager::config::ConfigStore;
use usb_gadget_manager::events::EventBus;
use usb_gadget_manager::gadget::{GadgetContext, ModeController};
use usb_gadget_manager::network::ConnmanBackend;
use usb_gadget_manager::notify::{self, Notifier};
use usb_gadget_manager::state::AppState;
use usb_gadget_manager::system::SystemHost;
use usb_gadget_manager::web;
use usb_gadget_manager::{AppError, Result};

const DEFAULT_CONFIG_PATH: &str = "/etc/usb-gadget-manager/config.json";

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// USB Gadget Manager command line arguments
#[derive(Parser, Debug)]
#[command(name = "usb-gadget-manager")]
#[command(version, about = "USB gadget network mode manager", long_about = None)]
struct CliArgs {
    /// Configuration file (JSON, defaults are used if it does not exist)
    #[arg(
        short = 'c',
        long,
        value_name = "FILE",
        env = "USB_GADGET_MANAGER_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Exit after this many idle seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    idle_shutdown_secs: Option<u64>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting USB Gadget Manager v{}", env!("CARGO_PKG_VERSION"));

    let notifier = Notifier::from_env();
    let (state, listener) = match init(args).await {
        Ok(initialized) => initialized,
        Err(e) => {
            tracing::error!("Could not initialize USB Gadget Manager: {}", e);
            notifier.notify(&notify::init_failure(&e));
            std::process::exit(notify::INIT_FAILURE_ERRNO);
        }
    };

    let config = state.config.get();
    if let Some(secs) = config.idle_shutdown_secs {
        spawn_idle_shutdown(state.clone(), notifier.clone(), Duration::from_secs(secs));
    }

    let app = web::create_router(state.clone());
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);
    notifier.notify(notify::READY);

    let shutdown_tx = state.shutdown_tx.clone();
    let mut shutdown_rx = state.shutdown_signal();
    let shutdown_signal = async move {
        tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(());
            }
            _ = shutdown_rx.recv() => {}
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    cleanup(&state);
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Load configuration, connect collaborators and bind the listener
async fn init(args: CliArgs) -> Result<(Arc<AppState>, tokio::net::TcpListener)> {
    let mut config_store = ConfigStore::load(&args.config).await?;
    config_store.update(|config| {
        if let Some(addr) = args.address {
            config.web.bind_address = addr;
        }
        if let Some(port) = args.http_port {
            config.web.http_port = port;
        }
        if let Some(secs) = args.idle_shutdown_secs {
            config.idle_shutdown_secs = Some(secs);
        }
    })?;
    let config = config_store.get();
    tracing::info!("Configuration file: {}", config_store.path().display());

    let network = ConnmanBackend::system().await?;
    tracing::info!("Connected to the network manager");
    let host = SystemHost::new(config.commands.clone());

    let events = Arc::new(EventBus::new());
    let controller = ModeController::new(
        GadgetContext {
            network: Arc::new(network),
            host: Arc::new(host),
            gadget: config.gadget.clone(),
            dhcp: config.dhcp.clone(),
        },
        events.clone(),
    );

    let ip: IpAddr = config.web.bind_address.parse().map_err(|_| {
        AppError::Config(format!(
            "Invalid bind address: {}",
            config.web.bind_address
        ))
    })?;
    let addr = SocketAddr::new(ip, config.web.http_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(config_store, controller, events, shutdown_tx);
    Ok((state, listener))
}

/// Exit once the controller has been idle long enough
fn spawn_idle_shutdown(state: Arc<AppState>, notifier: Notifier, limit: Duration) {
    tracing::info!("Idle shutdown after {:?}", limit);
    tokio::spawn(async move {
        state.controller.wait_idle(limit).await;
        tracing::info!("Shutting down due to inactivity");
        notifier.notify(notify::IDLE_SHUTDOWN);
        let _ = state.shutdown_tx.send(());
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Log what is left behind; an active mode stays up across restarts
fn cleanup(state: &Arc<AppState>) {
    let status = state.controller.status();
    if !status.active_mode.is_none() {
        tracing::info!("Leaving gadget mode {} active", status.active_mode);
    }
    if let Some(lock) = status.lock {
        tracing::info!("Dropping lock held by {}", lock.owner);
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "usb_gadget_manager=error,tower_http=error",
        LogLevel::Warn => "usb_gadget_manager=warn,tower_http=warn",
        LogLevel::Info => "usb_gadget_manager=info,tower_http=info",
        LogLevel::Verbose => "usb_gadget_manager=debug,tower_http=info",
        LogLevel::Debug => "usb_gadget_manager=debug,tower_http=debug",
        LogLevel::Trace => "usb_gadget_manager=trace,tower_http=debug,zbus=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
