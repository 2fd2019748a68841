mod args;

use args::{Args, HintDefault, RouterKind};
use clap::Parser;
use common::metrics::process_unix::ProcessRecorder;
use common::ShutdownMessage;
use proxy::backend::pool::PoolConfig;
use proxy::backend::registry::{Registry, Server};
use proxy::backend::router::conn_router::ConnRouterConfig;
use proxy::backend::router::hint_router::DefaultAction;
use proxy::backend::router::RouterConfig;
use proxy::monitor::{EventMask, Monitor, MonitorConfig};
use proxy::secrets::EncryptionKey;
use proxy::server::auth::CredentialStore;
use proxy::session::BackendAccount;
use proxy::stats::SessionStats;
use proxy::worker::{WorkerContext, WorkerPool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use web_service::http_handler::AdminState;
use web_service::http_server::MonoProxyRest;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_await(mut shutdown_rx: Box<Receiver<ShutdownMessage>>) {
    let changed_rs = &shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("ProxySrv process receive shutdown msg {msg}");
        }
    }
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("ProxySrv receive ctrl_c signal {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg = format!("ProxySrv receive terminate signal {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn start_metrics_and_rest(
    config: &Args,
    admin_state: Option<AdminState>,
    runtime: &Runtime,
    shutdown_rx: &Receiver<ShutdownMessage>,
) {
    if config.enable_metrics {
        common::metrics::init_metrics_context();
        let mut process_recorder = ProcessRecorder::new(
            common::metrics::common_labels().clone(),
            shutdown_rx.clone(),
        );
        runtime.spawn(async move {
            process_recorder.start_auto_collect().await;
        });
    }

    if config.enable_metrics || config.enable_admin {
        let http_address = config.http_address.clone();
        let http_port = config.http_port;
        let enable_metrics = config.enable_metrics;
        let shutdown_rx_clone = Box::new(shutdown_rx.clone());
        runtime.spawn(async move {
            MonoProxyRest::start_server(
                http_address,
                http_port,
                enable_metrics,
                admin_state,
                shutdown_await(shutdown_rx_clone),
            )
            .await
        });
    }
}

/// Resolves `--backend-password`/`--monitor-password` through the secrets
/// file when `--backend-password-encrypted` is set, otherwise passes the
/// value through unchanged.
fn resolve_password(config: &Args, raw: &str) -> anyhow::Result<String> {
    if !config.backend_password_encrypted {
        return Ok(raw.to_string());
    }
    let path = config
        .secrets_file
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--backend-password-encrypted requires --secrets-file"))?;
    let key = EncryptionKey::load(path)?;
    Ok(key.decrypt(raw)?)
}

fn build_registry(config: &Args) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    for server in &config.servers {
        registry.register(Server::new(&server.name, &server.address, server.port, server.rank));
    }
    registry
}

fn build_router_config(config: &Args) -> RouterConfig {
    match config.router {
        RouterKind::Conn => RouterConfig::Conn(ConnRouterConfig {
            role_mask: proxy::backend::registry::StatusFlags::RUNNING,
            max_replication_lag: config.max_replication_lag,
        }),
        RouterKind::Hint => RouterConfig::Hint(match config.hint_default {
            HintDefault::Primary => DefaultAction::Primary,
            HintDefault::Replica => DefaultAction::Replica,
            HintDefault::All => DefaultAction::All,
        }),
        RouterKind::RwSplit => RouterConfig::RwSplit {
            write_backend: config
                .write_backend
                .clone()
                .expect("--router rw-split requires --write-backend"),
        },
    }
}

fn build_credentials(config: &Args) -> anyhow::Result<CredentialStore> {
    let mut store = CredentialStore::new();
    for user in &config.users {
        let hash = hex_decode_20(&user.stage2_hex)?;
        store.insert(user.username.clone().into_bytes(), hash);
    }
    Ok(store)
}

fn hex_decode_20(hex: &str) -> anyhow::Result<[u8; 20]> {
    let bytes = hex::decode(hex)?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("stage2 hash must decode to 20 bytes"))
}

fn build_monitor_config(config: &Args) -> MonitorConfig {
    let events = if config.monitor_events.trim().is_empty() {
        EventMask::all()
    } else {
        config
            .monitor_events
            .split(',')
            .filter_map(|name| match name.trim() {
                "primary_up" => Some(EventMask::PRIMARY_UP),
                "primary_down" => Some(EventMask::PRIMARY_DOWN),
                "replica_up" => Some(EventMask::REPLICA_UP),
                "replica_down" => Some(EventMask::REPLICA_DOWN),
                "new_primary" => Some(EventMask::NEW_PRIMARY),
                "new_replica" => Some(EventMask::NEW_REPLICA),
                "lost_primary" => Some(EventMask::LOST_PRIMARY),
                "lost_replica" => Some(EventMask::LOST_REPLICA),
                "server_up" => Some(EventMask::SERVER_UP),
                "server_down" => Some(EventMask::SERVER_DOWN),
                other => {
                    warn!("ignoring unknown monitor event name {other:?}");
                    None
                }
            })
            .fold(EventMask::empty(), |acc, e| acc | e)
    };

    MonitorConfig {
        interval: config.monitor_interval(),
        connect_timeout: config.monitor_connect_timeout(),
        read_timeout: config.monitor_read_timeout(),
        script_path: config.monitor_script.clone().map(Into::into),
        script_timeout: config.monitor_script_timeout(),
        events,
        journal_path: config.monitor_journal.clone().map(Into::into),
        journal_max_age: config.monitor_journal_max_age(),
        detect_stale_primary: config.monitor_detect_stale_primary,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse();

    let level = Level::from_str(config.log_level.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap())
        .add_directive("tower=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    info!("ProxySrv running config args={:?}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("MONO_PROXY")
        .worker_threads(2)
        .build()?;

    let registry = build_registry(&config);
    let router_config = build_router_config(&config);
    let credentials = Arc::new(build_credentials(&config)?);
    let stats = Arc::new(SessionStats::new());

    let backend_password = resolve_password(&config, &config.backend_password)?;
    let backend_account = Arc::new(BackendAccount {
        username: config.backend_user.clone().into_bytes(),
        password: backend_password,
        database: config.backend_database.clone().map(String::into_bytes),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);

    let admin_state = config.enable_admin.then(|| AdminState {
        registry: registry.clone(),
        stats: stats.clone(),
    });
    start_metrics_and_rest(&config, admin_state, &runtime, &shutdown_rx);

    let monitor_password = resolve_password(&config, &config.monitor_password)?;
    let monitor_account = Arc::new(BackendAccount {
        username: config.monitor_user.clone().into_bytes(),
        password: monitor_password,
        database: None,
    });
    let monitor_registry = registry.clone();
    let monitor_config = build_monitor_config(&config);
    std::thread::Builder::new()
        .name("proxy-monitor".to_string())
        .spawn(move || {
            let monitor_runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build monitor runtime");
            let monitor = Monitor::new(monitor_registry, monitor_account, monitor_config);
            monitor_runtime.block_on(monitor.run());
        })
        .expect("failed to spawn monitor thread");

    let pool_config = PoolConfig {
        capacity: config.pool_capacity,
        idle_timeout: config.pool_idle_timeout(),
        waitlist_timeout: Duration::from_secs(10),
    };

    let worker_ctx = WorkerContext {
        registry: registry.clone(),
        credentials,
        backend_account,
        router_config,
        pool_config,
        pool_global_cap: config.pool_global_cap,
        stats,
        #[cfg(feature = "tls")]
        tls_conf: None,
    };

    let worker_pool = WorkerPool::start(config.workers.max(1), worker_ctx);

    runtime.block_on(async {
        let tcp_listener = TcpListener::bind(format!("{}:{}", config.bind_address, config.port))
            .await
            .unwrap();
        loop {
            tokio::select! {
                shutdown_msg = shutdown_signal() => {
                    shutdown_tx.send(shutdown_msg.clone()).unwrap();
                    break;
                }
                rs = tcp_listener.accept() => {
                    match rs {
                        Ok((stream, _addr)) => {
                            worker_pool.dispatch(stream);
                        }
                        Err(e) => {
                            warn!("ProxySrv accept connection err. cause by {e:?}");
                        }
                    }
                }
            }
        }
    });

    worker_pool.shutdown();
    Ok(())
}
