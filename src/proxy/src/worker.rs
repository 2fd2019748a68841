//! Fixed pool of pinned, single-threaded I/O workers.
//!
//! Each worker is an OS thread pinned to one core via `core_affinity`,
//! running its own current-thread Tokio runtime and a `LocalSet`. A worker
//! owns its `ConnectionPool` outright (see `backend::pool`'s module doc) and
//! never touches another worker's pool; the only state shared across
//! workers is the `Arc<Registry>`, `Arc<CredentialStore>` and
//! `Arc<BackendAccount>` every session reads from.
//!
//! The listener thread accepts connections and hands each accepted
//! `TcpStream` to a worker over an unbounded channel, round-robin. This
//! keeps accept() off the hot path of any one worker and spreads load
//! evenly without a shared work-stealing runtime.

use crate::backend::pool::{ConnectionPool, PoolConfig};
use crate::backend::registry::Registry;
use crate::backend::router::RouterConfig;
use crate::server::auth::{gen_user_salt, CredentialStore};
use crate::session::{BackendAccount, Session};
use crate::stats::SessionStats;

use std::rc::Rc;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::LocalSet;
use tracing::{error, info, warn};

use rustls::server::ServerConfig as TlsServerConfig;
use tokio_rustls::rustls;

/// Immutable state every worker thread needs a clone of to build sessions.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<Registry>,
    pub credentials: Arc<CredentialStore>,
    pub backend_account: Arc<BackendAccount>,
    pub router_config: RouterConfig,
    pub pool_config: PoolConfig,
    /// Max connections a single worker's pool may open to one backend.
    pub pool_global_cap: usize,
    pub stats: Arc<SessionStats>,
    #[cfg(feature = "tls")]
    pub tls_conf: Option<Arc<TlsServerConfig>>,
}

/// A fixed set of pinned worker threads, each accepting connections handed
/// to it over its own channel.
pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<TcpStream>>,
    handles: Vec<std::thread::JoinHandle<()>>,
    next: std::sync::atomic::AtomicUsize,
}

impl WorkerPool {
    /// Spawns `count` worker threads. `conn_id_start` lets the caller keep
    /// connection ids unique across a process restart's worker pools in
    /// tests; production callers pass 0.
    pub fn start(count: usize, ctx: WorkerContext) -> Self {
        assert!(count > 0, "worker pool needs at least one thread");
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for idx in 0..count {
            let (tx, rx) = mpsc::unbounded_channel::<TcpStream>();
            let ctx = ctx.clone();
            let core_id = core_ids.get(idx % core_ids.len().max(1)).copied();

            let handle = std::thread::Builder::new()
                .name(format!("proxy-worker-{idx}"))
                .spawn(move || run_worker(idx, core_id, ctx, rx))
                .expect("failed to spawn worker thread");

            senders.push(tx);
            handles.push(handle);
        }

        Self {
            senders,
            handles,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Hands a freshly accepted connection to the next worker, round-robin.
    pub fn dispatch(&self, stream: TcpStream) {
        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.senders.len();
        if self.senders[idx].send(stream).is_err() {
            warn!("worker {idx} is gone, dropping an accepted connection");
        }
    }

    /// Drops every worker's channel sender, which lets each worker's
    /// `LocalSet` drain in-flight sessions and exit once its receiver
    /// observes the channel close, then waits for every thread to finish.
    pub fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.join() {
                error!("worker thread panicked: {e:?}");
            }
        }
    }
}

fn run_worker(
    idx: usize,
    core_id: Option<core_affinity::CoreId>,
    ctx: WorkerContext,
    mut rx: mpsc::UnboundedReceiver<TcpStream>,
) {
    if let Some(core_id) = core_id {
        core_affinity::set_for_current(core_id);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");

    let local = LocalSet::new();
    let pool = Rc::new(Mutex::new(ConnectionPool::new(ctx.pool_config, ctx.pool_global_cap)));

    local.block_on(&runtime, async move {
        let mut conn_id: u64 = 0;
        while let Some(stream) = rx.recv().await {
            conn_id += 1;
            let this_conn = (idx as u64) << 48 | conn_id;

            if let Err(e) = stream.set_nodelay(true) {
                warn!("failed to set TCP_NODELAY on accepted connection: {e}");
            }
            let (client_reader, client_writer) = stream.into_split();

            let registry = ctx.registry.clone();
            let pool = pool.clone();
            let credentials = ctx.credentials.clone();
            let backend_account = ctx.backend_account.clone();
            let router = ctx.router_config.build();
            let stats = ctx.stats.clone();
            #[cfg(feature = "tls")]
            let tls_conf = ctx.tls_conf.clone();

            tokio::task::spawn_local(async move {
                let scramble = gen_user_salt();
                let session = Session::new(
                    this_conn,
                    scramble,
                    client_reader,
                    client_writer,
                    registry,
                    pool,
                    credentials,
                    backend_account,
                    router,
                    stats,
                    #[cfg(feature = "tls")]
                    tls_conf,
                );
                if let Err(e) = session.run().await {
                    debug_session_error(this_conn, e);
                }
            });
        }
        info!("worker {idx} shutting down, no more connections will be dispatched");
    });
}

fn debug_session_error(conn_id: u64, e: std::io::Error) {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            tracing::debug!("session {conn_id} ended: {e}");
        }
        _ => tracing::warn!("session {conn_id} ended with error: {e}"),
    }
}
