use clap::Parser;
use std::time::Duration;

/// One `--server` entry: `name=address:port[,rank=N]`.
#[derive(Debug, Clone)]
pub struct ServerArg {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub rank: u32,
}

impl std::str::FromStr for ServerArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected name=host:port[,rank=N], got {s:?}"))?;
        let mut parts = rest.split(',');
        let host_port = parts.next().ok_or_else(|| format!("missing host:port in {s:?}"))?;
        let (address, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {host_port:?}"))?;
        let port = port.parse::<u16>().map_err(|e| e.to_string())?;

        let mut rank = 0u32;
        for extra in parts {
            if let Some(value) = extra.strip_prefix("rank=") {
                rank = value.parse::<u32>().map_err(|e| e.to_string())?;
            }
        }
        Ok(ServerArg { name: name.to_string(), address: address.to_string(), port, rank })
    }
}

/// One `--user` entry: `name:stage2hash` where `stage2hash` is the 40 hex
/// chars of `SHA1(SHA1(password))`. The proxy only ever stores this
/// one-way hash, never a plaintext or reversible credential.
#[derive(Debug, Clone)]
pub struct UserArg {
    pub username: String,
    pub stage2_hex: String,
}

impl std::str::FromStr for UserArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (username, stage2_hex) = s
            .split_once(':')
            .ok_or_else(|| format!("expected name:stage2hash, got {s:?}"))?;
        if stage2_hex.len() != 40 || !stage2_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("stage2hash must be 40 hex chars, got {stage2_hex:?}"));
        }
        Ok(UserArg { username: username.to_string(), stage2_hex: stage2_hex.to_string() })
    }
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum RouterKind {
    Conn,
    Hint,
    RwSplit,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum HintDefault {
    Primary,
    Replica,
    All,
}

/// CLI surface for the bootstrap workspace. Deliberately thin: a config
/// file layer and a long-lived credential store are both out of scope here,
/// so everything a single process needs is passed on the command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "dbproxy", about = "MariaDB/MySQL protocol-aware proxy")]
pub struct Args {
    /// Address the client listener binds.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port the client listener binds.
    #[arg(long, default_value_t = 4406)]
    pub port: u16,

    /// Number of pinned I/O worker threads.
    #[arg(long, default_value_t = num_cpus())]
    pub workers: usize,

    /// A backend server: `name=host:port[,rank=N]`. Repeatable.
    #[arg(long = "server", required = true)]
    pub servers: Vec<ServerArg>,

    /// Router policy.
    #[arg(long, value_enum, default_value = "conn")]
    pub router: RouterKind,

    /// `RwSplit` router: name of the server that takes writes.
    #[arg(long)]
    pub write_backend: Option<String>,

    /// `Hint` router: target used when a query carries no routing hint.
    #[arg(long, value_enum, default_value = "primary")]
    pub hint_default: HintDefault,

    /// `Conn`/`RwSplit` router: drop replicas lagging more than this many
    /// seconds from candidate selection. Unset means no lag bound.
    #[arg(long)]
    pub max_replication_lag: Option<u32>,

    /// Per-server idle connections the pool keeps open.
    #[arg(long, default_value_t = 8)]
    pub pool_capacity: usize,

    /// How long an idle pooled connection is kept before it's closed.
    #[arg(long, default_value_t = 3600)]
    pub pool_idle_timeout_secs: u64,

    /// Cap on connections a worker may hold open to one backend at once
    /// (pooled and in-use together).
    #[arg(long, default_value_t = 64)]
    pub pool_global_cap: usize,

    /// Username the proxy itself authenticates with against backends.
    #[arg(long, default_value = "proxy")]
    pub backend_user: String,

    /// Plaintext password for `backend_user`, or its encrypted form from
    /// `secrets_file` if `--backend-password-encrypted` is set.
    #[arg(long, default_value = "")]
    pub backend_password: String,

    /// Treat `backend_password` as a value encrypted with `secrets_file`'s
    /// key rather than plaintext.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    pub backend_password_encrypted: bool,

    /// Default schema the proxy selects on backend connections.
    #[arg(long)]
    pub backend_database: Option<String>,

    /// Path to the MaxScale-style secrets file (`secrets.json`-shaped:
    /// `encryption_cipher`/`encryption_key`), required when
    /// `--backend-password-encrypted` is set.
    #[arg(long)]
    pub secrets_file: Option<String>,

    /// A client credential: `name:stage2hash`. Repeatable. There is no
    /// persistent credential store; this is the whole surface for
    /// populating one at startup.
    #[arg(long = "user")]
    pub users: Vec<UserArg>,

    /// Monitor probe interval, in milliseconds (floor 100ms).
    #[arg(long, default_value_t = 2000)]
    pub monitor_interval_ms: u64,

    /// Monitor connect timeout, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub monitor_connect_timeout_ms: u64,

    /// Monitor per-query read timeout, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub monitor_read_timeout_ms: u64,

    /// Username the monitor authenticates with when probing backends.
    #[arg(long, default_value = "monitor")]
    pub monitor_user: String,

    /// Plaintext or (if `--backend-password-encrypted`) encrypted password
    /// for `monitor_user`.
    #[arg(long, default_value = "")]
    pub monitor_password: String,

    /// Script run on a monitor-detected transition. Supports `$INITIATOR`,
    /// `$EVENT`, `$NODELIST` substitution.
    #[arg(long)]
    pub monitor_script: Option<String>,

    /// How long the monitor waits for the script hook before killing it.
    #[arg(long, default_value_t = 5000)]
    pub monitor_script_timeout_ms: u64,

    /// Comma-separated subset of transition events that run the script hook
    /// (e.g. `primary_down,lost_primary`); empty means every event.
    #[arg(long, default_value = "")]
    pub monitor_events: String,

    /// Path the monitor journals last-known server status to, as JSON.
    #[arg(long)]
    pub monitor_journal: Option<String>,

    /// Minimum interval between non-change-triggered journal rewrites.
    #[arg(long, default_value_t = 10)]
    pub monitor_journal_max_age_secs: u64,

    /// Keep a failed primary marked stale (rather than just down) for one
    /// monitor cycle, so a router mid-decision doesn't see it vanish and
    /// reappear as a plain replica.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub monitor_detect_stale_primary: bool,

    #[arg(long, default_value = "INFO")]
    pub log_level: String,

    /// Address/port the admin and metrics REST surface binds.
    #[arg(long, default_value = "0.0.0.0")]
    pub http_address: String,
    #[arg(long, default_value_t = 8080)]
    pub http_port: u16,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub enable_metrics: bool,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub enable_admin: bool,
}

impl Args {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn monitor_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_connect_timeout_ms)
    }

    pub fn monitor_read_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_read_timeout_ms)
    }

    pub fn monitor_script_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_script_timeout_ms)
    }

    pub fn monitor_journal_max_age(&self) -> Duration {
        Duration::from_secs(self.monitor_journal_max_age_secs)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl std::fmt::Display for RouterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterKind::Conn => write!(f, "conn"),
            RouterKind::Hint => write!(f, "hint"),
            RouterKind::RwSplit => write!(f, "rw-split"),
        }
    }
}
