use batchd_core::config;
use batchd_core::failover::{AuthMethod, Role};
use batchd_core::fence::ScriptFence;
use batchd_core::license;
use batchd_core::marker::ActiveMarker;
use batchd_core::paths::ServerHome;
use batchd_server::failover::primary::{
    takeover_from_secondary, PrimaryConfig, PrimaryController, ReclaimOutcome,
};
use batchd_server::failover::secondary::{
    ActiveOutcome, SecondaryConfig, SecondaryDriver, SecondaryOutcome,
};
use batchd_server::failover::{FailoverShared, ShutdownPolicy};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "batchd", about = "Failover-coordinated batch scheduler server")]
struct Args {
    /// Which half of the failover pair this instance is
    #[arg(long, value_enum)]
    role: RoleArg,

    /// Hostname of the primary server
    #[arg(long, env = "BATCHD_PRIMARY_HOST")]
    primary_host: String,

    /// Hostname of the secondary server
    #[arg(long, env = "BATCHD_SECONDARY_HOST")]
    secondary_host: String,

    /// Grace interval in seconds before the secondary takes over;
    /// -1 means start up as the active server immediately
    #[arg(long, env = "BATCHD_SECONDARY_DELAY", default_value_t = 30)]
    secondary_delay: i64,

    /// Server home directory (shared storage for the failover files)
    #[arg(long, env = "BATCHD_HOME", default_value = "/var/spool/batchd")]
    home: PathBuf,

    /// Control-channel port
    #[arg(long, env = "BATCHD_PORT", default_value_t = config::DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Transport authentication mode
    #[arg(long, value_enum, default_value_t = AuthArg::Reserved)]
    auth_method: AuthArg,

    /// Local hostname override (defaults to the name configured for this role)
    #[arg(long)]
    host_name: Option<String>,

    /// Prometheus exporter port (0 = disabled)
    #[arg(long, default_value_t = 0)]
    metrics_port: u16,

    /// What to tell the secondary when this primary shuts down cleanly
    #[arg(long, value_enum, default_value_t = ShutdownPolicyArg::GoInactive)]
    shutdown_policy: ShutdownPolicyArg,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Primary,
    Secondary,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AuthArg {
    Reserved,
    External,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ShutdownPolicyArg {
    Shutdown,
    GoInactive,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(
                    "batchd_server=info"
                        .parse()
                        .expect("valid directive literal"),
                )
                .add_directive(
                    "batchd_core=info"
                        .parse()
                        .expect("valid directive literal"),
                ),
        )
        .init();

    let args = Args::parse();

    if args.port == 0 {
        eprintln!("Error: port must be > 0");
        std::process::exit(config::EXIT_PEER_REJECTED);
    }
    if args.primary_host == args.secondary_host {
        eprintln!("Error: primary and secondary must be different hosts");
        std::process::exit(config::EXIT_PEER_REJECTED);
    }

    if args.metrics_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => tracing::info!(port = args.metrics_port, "prometheus exporter listening"),
            Err(e) => tracing::warn!("could not install prometheus exporter: {}", e),
        }
    }

    let role = match args.role {
        RoleArg::Primary => Role::Primary,
        RoleArg::Secondary => Role::Secondary,
    };
    let auth = match args.auth_method {
        AuthArg::Reserved => AuthMethod::Reserved,
        AuthArg::External => AuthMethod::External,
    };

    let home = ServerHome::new(&args.home);
    if let Err(e) = home.ensure_layout() {
        eprintln!(
            "Error: cannot create home layout under '{}': {}",
            args.home.display(),
            e
        );
        std::process::exit(config::EXIT_PEER_REJECTED);
    }

    let own_host = args.host_name.clone().unwrap_or_else(|| match role {
        Role::Primary => args.primary_host.clone(),
        Role::Secondary => args.secondary_host.clone(),
    });
    let hostid = license::host_identifier(&own_host);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        %role,
        host = %own_host,
        port = args.port,
        home = %args.home.display(),
        "batchd starting"
    );

    let code = match role {
        Role::Primary => run_primary(&args, home, own_host, hostid, auth).await,
        Role::Secondary => run_secondary(&args, home, own_host, hostid, auth).await,
    };
    std::process::exit(code);
}

async fn run_primary(
    args: &Args,
    home: ServerHome,
    own_host: String,
    hostid: u64,
    auth: AuthMethod,
) -> i32 {
    // A marker at startup means a secondary took over while we were down:
    // reclaim the role before doing anything else.
    let marker = ActiveMarker::new(home.marker_path());
    if marker.exists() {
        tracing::warn!("active marker present at startup, reclaiming from secondary");
        match takeover_from_secondary(&args.secondary_host, args.port, auth).await {
            ReclaimOutcome::Reclaimed => {}
            ReclaimOutcome::Unreachable => {
                tracing::error!("cannot get through to secondary, aborting");
                return config::EXIT_PEER_REJECTED;
            }
            ReclaimOutcome::NotAcknowledged => {
                tracing::error!("secondary not idling, aborting");
                return config::EXIT_SECONDARY_NOT_IDLING;
            }
        }
    }

    let shared = FailoverShared::new();
    shared.set_active();

    let controller = Arc::new(PrimaryController::new(
        PrimaryConfig {
            home,
            own_host,
            hostid,
            auth,
        },
        shared.clone(),
    ));

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(port = args.port, "cannot bind control port: {}", e);
            return config::EXIT_PEER_REJECTED;
        }
    };
    tracing::info!(port = args.port, "primary serving control port");

    let accept = Arc::clone(&controller);
    tokio::spawn(async move {
        if let Err(e) = accept.run_listener(listener).await {
            tracing::error!("control listener failed: {}", e);
        }
    });

    let policy = match args.shutdown_policy {
        ShutdownPolicyArg::Shutdown => ShutdownPolicy::ShutdownSecondary,
        ShutdownPolicyArg::GoInactive => ShutdownPolicy::LeaveInactive,
    };

    tokio::select! {
        code = controller.run_handshake_timer() => code,
        _ = wait_for_signal() => {
            controller.signal_secondary_shutdown(policy).await;
            tracing::info!("primary shut down cleanly");
            config::EXIT_CLEAN
        }
    }
}

async fn run_secondary(
    args: &Args,
    home: ServerHome,
    own_host: String,
    hostid: u64,
    auth: AuthMethod,
) -> i32 {
    // Fatal misconfiguration if the primary cannot be addressed at all.
    let addr_ok = tokio::net::lookup_host((args.primary_host.as_str(), args.port))
        .await
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false);
    if !addr_ok {
        tracing::error!(
            host = %args.primary_host,
            "unable to obtain primary server network address, aborting"
        );
        return config::EXIT_PEER_REJECTED;
    }

    if args.secondary_delay < 0 {
        tracing::warn!("secondary directed to start up as active");
    } else {
        tracing::info!(primary = %args.primary_host, "coming up as secondary");
    }

    let shared = FailoverShared::new();
    let fence = Arc::new(ScriptFence::new(
        home.fence_script_path(),
        home.spool_dir(),
        own_host.clone(),
    ));
    let mut driver = SecondaryDriver::new(
        SecondaryConfig {
            home,
            own_host,
            primary_host: args.primary_host.clone(),
            port: args.port,
            hostid,
            secondary_delay: args.secondary_delay,
            auth,
        },
        shared.clone(),
        fence,
    );

    loop {
        let outcome = tokio::select! {
            outcome = driver.run() => outcome,
            _ = wait_for_signal() => {
                tracing::info!("secondary shut down cleanly");
                return config::EXIT_CLEAN;
            }
        };
        match outcome {
            Err(e) => {
                tracing::error!("secondary driver failed: {}", e);
                return config::EXIT_PEER_REJECTED;
            }
            Ok(SecondaryOutcome::Exit(code)) => return code,
            Ok(SecondaryOutcome::Promoted) => {
                let active = tokio::select! {
                    active = driver.run_active() => active,
                    _ = wait_for_signal() => {
                        tracing::info!("active secondary shut down cleanly");
                        return config::EXIT_CLEAN;
                    }
                };
                match active {
                    Err(e) => {
                        tracing::error!("active secondary failed: {}", e);
                        return config::EXIT_PEER_REJECTED;
                    }
                    Ok(ActiveOutcome::Exit(code)) => return code,
                    Ok(ActiveOutcome::HandBack) => {
                        tracing::info!("idling until primary goes away again");
                    }
                }
            }
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
