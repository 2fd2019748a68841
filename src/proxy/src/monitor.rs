//! Cluster monitor: on its own thread, probes every registered backend on a
//! fixed interval over a short-lived connection, derives RUNNING/PRIMARY/
//! REPLICA/STALE status, publishes it to the `Registry`, fires a script hook
//! on state transitions, and keeps a JSON journal of the last known state.
//!
//! The monitor never touches session state directly; it only ever calls
//! `Registry::publish`. Sessions read whatever snapshot is current, lock-free,
//! whenever they need it.

use crate::async_packet_read;
use crate::backend::channel::BackendChannel;
use crate::backend::registry::{Registry, StatusFlags};
use crate::protocol::mysql::packet::writers::write_query_request;
use crate::protocol::mysql::packet::Packet;
use crate::server::auth::authenticator::ProxyAuthenticator;
use crate::server::auth::BackendAuthenticator;
use crate::session::BackendAccount;

use bitflags::bitflags;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

bitflags! {
    /// Which transition events run the script hook. Bit names match the
    /// ten transitions the monitor can detect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u16 {
        const PRIMARY_UP   = 1 << 0;
        const PRIMARY_DOWN = 1 << 1;
        const REPLICA_UP   = 1 << 2;
        const REPLICA_DOWN = 1 << 3;
        const NEW_PRIMARY  = 1 << 4;
        const NEW_REPLICA  = 1 << 5;
        const LOST_PRIMARY = 1 << 6;
        const LOST_REPLICA = 1 << 7;
        const SERVER_UP    = 1 << 8;
        const SERVER_DOWN  = 1 << 9;
    }
}

impl EventMask {
    fn name(self) -> &'static str {
        match self {
            EventMask::PRIMARY_UP => "primary_up",
            EventMask::PRIMARY_DOWN => "primary_down",
            EventMask::REPLICA_UP => "replica_up",
            EventMask::REPLICA_DOWN => "replica_down",
            EventMask::NEW_PRIMARY => "new_primary",
            EventMask::NEW_REPLICA => "new_replica",
            EventMask::LOST_PRIMARY => "lost_primary",
            EventMask::LOST_REPLICA => "lost_replica",
            EventMask::SERVER_UP => "server_up",
            EventMask::SERVER_DOWN => "server_down",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub script_path: Option<PathBuf>,
    pub script_timeout: Duration,
    pub events: EventMask,
    pub journal_path: Option<PathBuf>,
    pub journal_max_age: Duration,
    pub detect_stale_primary: bool,
}

impl MonitorConfig {
    /// The floor `spec.md` §4.10 names for the probe interval; a smaller
    /// configured value is clamped up to this rather than rejected.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

    pub fn clamp_interval(&mut self) {
        if self.interval < Self::MIN_INTERVAL {
            self.interval = Self::MIN_INTERVAL;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Probe {
    reachable: bool,
    read_only: Option<bool>,
    replica: Option<ReplicaStatus>,
}

#[derive(Debug, Clone, Copy)]
struct ReplicaStatus {
    io_running_ok: bool,
    sql_running_ok: bool,
    lag_seconds: u32,
}

/// Runs the periodic probe loop until the process exits. Intended to be
/// driven from a dedicated current-thread runtime on its own OS thread, per
/// "the monitor runs on its own thread".
pub struct Monitor {
    registry: Arc<Registry>,
    account: Arc<BackendAccount>,
    config: MonitorConfig,
    last_status: HashMap<String, StatusFlags>,
    last_journal_write: Option<Instant>,
}

impl Monitor {
    pub fn new(registry: Arc<Registry>, account: Arc<BackendAccount>, mut config: MonitorConfig) -> Self {
        config.clamp_interval();
        Self {
            registry,
            account,
            config,
            last_status: HashMap::new(),
            last_journal_write: None,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        let servers = self.registry.list();
        let mut changed = false;
        for server in &servers {
            if server.in_maintenance() {
                continue;
            }
            let probe = self.probe_one(&server.name, &server.host_port()).await;
            let previous = self.last_status.get(&server.name).copied().unwrap_or_default();
            let (status, lag) = self.derive_status(previous, probe);
            self.registry.publish(&server.name, status, lag);
            if status != previous {
                changed = true;
                self.fire_events(&server.name, previous, status);
            }
            self.last_status.insert(server.name.clone(), status);
        }
        if changed {
            self.write_journal(true);
        } else {
            self.write_journal(false);
        }
    }

    async fn probe_one(&self, name: &str, host_port: &str) -> Probe {
        let connect = async {
            let server = self
                .registry
                .get(name)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "server vanished"))?;
            let mut channel = BackendChannel::connect(server).await?;
            let authenticator = ProxyAuthenticator;
            authenticator
                .authenticate(
                    channel.reader_mut(),
                    channel.writer_mut(),
                    &self.account.username,
                    &self.account.password,
                    self.account.database.as_deref(),
                )
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()))?;
            Ok::<_, io::Error>(channel)
        };

        let mut channel = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                debug!("monitor: {name} ({host_port}) unreachable: {e}");
                return Probe::default();
            }
            Err(_) => {
                debug!("monitor: {name} ({host_port}) connect timed out");
                return Probe::default();
            }
        };

        let read_only = match self.query(&mut channel, "SHOW GLOBAL VARIABLES LIKE 'read_only'").await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get(1))
                .and_then(|v| v.as_deref())
                .map(|v| v.eq_ignore_ascii_case(b"ON")),
            Err(e) => {
                warn!("monitor: {name} read_only probe failed: {e}");
                None
            }
        };

        let replica = match self.query(&mut channel, "SHOW ALL SLAVES STATUS").await {
            Ok(rows) if !rows.is_empty() => self.parse_replica_status(&rows[0]),
            _ => match self.query_with_columns(&mut channel, "SHOW SLAVE STATUS").await {
                Ok(Some((columns, rows))) if !rows.is_empty() => {
                    self.parse_replica_status_named(&columns, &rows[0])
                }
                _ => None,
            },
        };

        let _ = channel.shutdown().await;
        Probe { reachable: true, read_only, replica }
    }

    /// Runs `sql` and returns its rows as raw column values, ignoring column
    /// names (used for the fixed two-column `SHOW VARIABLES` shape).
    async fn query(&self, channel: &mut BackendChannel, sql: &str) -> io::Result<Vec<Vec<Option<Vec<u8>>>>> {
        self.query_with_columns(channel, sql).await.map(|r| r.map(|(_, rows)| rows).unwrap_or_default())
    }

    /// Runs `sql` and returns `(column names, rows)`, or `None` if the
    /// backend replied with an OK/ERR packet instead of a result set (e.g.
    /// `SHOW ALL SLAVES STATUS` on a server that doesn't know the statement).
    async fn query_with_columns(
        &self,
        channel: &mut BackendChannel,
        sql: &str,
    ) -> io::Result<Option<(Vec<String>, Vec<Vec<Option<Vec<u8>>>>)>> {
        channel.reset_seq();
        write_query_request(channel.writer_mut(), sql.as_bytes()).await?;
        channel.writer_mut().flush_all().await?;

        let reader = channel.reader_mut();
        let first = read_packet(reader, self.config.read_timeout).await?;
        if first.is_err_packet() || first.is_ok_packet() {
            return Ok(None);
        }
        let mut pos = 0usize;
        let column_count = read_lenenc_int(&first, &mut pos).unwrap_or(0) as usize;

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let def = read_packet(reader, self.config.read_timeout).await?;
            columns.push(column_name(&def).unwrap_or_default());
        }
        // Legacy EOF after column definitions (the monitor never negotiates
        // CLIENT_DEPRECATE_EOF for its own probe connections).
        let _eof = read_packet(reader, self.config.read_timeout).await?;

        let mut rows = Vec::new();
        loop {
            let row = read_packet(reader, self.config.read_timeout).await?;
            if row.is_eof_packet() || row.is_err_packet() {
                break;
            }
            rows.push(parse_row(&row, column_count));
        }
        Ok(Some((columns, rows)))
    }

    fn parse_replica_status(&self, row: &[Option<Vec<u8>>]) -> Option<ReplicaStatus> {
        // `SHOW ALL SLAVES STATUS` shares `SHOW SLAVE STATUS`'s column
        // layout with `Connection_name` prepended; the fields we need keep
        // their fixed positions relative to that layout on MariaDB.
        let io_running = row.get(11).and_then(|v| v.as_deref());
        let sql_running = row.get(12).and_then(|v| v.as_deref());
        let lag = row
            .get(33)
            .and_then(|v| v.as_deref())
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.parse::<u32>().ok());
        Some(ReplicaStatus {
            io_running_ok: matches!(io_running, Some(b"Yes") | Some(b"Connecting") | Some(b"Preparing")),
            sql_running_ok: matches!(sql_running, Some(b"Yes")),
            lag_seconds: lag.unwrap_or(0),
        })
    }

    fn parse_replica_status_named(&self, columns: &[String], row: &[Option<Vec<u8>>]) -> Option<ReplicaStatus> {
        let find = |name: &str| -> Option<&Option<Vec<u8>>> {
            columns.iter().position(|c| c.eq_ignore_ascii_case(name)).and_then(|i| row.get(i))
        };
        let io_running = find("Slave_IO_Running").and_then(|v| v.as_deref());
        let sql_running = find("Slave_SQL_Running").and_then(|v| v.as_deref());
        let lag = find("Seconds_Behind_Master")
            .and_then(|v| v.as_deref())
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.parse::<u32>().ok());
        Some(ReplicaStatus {
            io_running_ok: matches!(io_running, Some(b"Yes") | Some(b"Connecting") | Some(b"Preparing")),
            sql_running_ok: matches!(sql_running, Some(b"Yes")),
            lag_seconds: lag.unwrap_or(0),
        })
    }

    fn derive_status(&self, previous: StatusFlags, probe: Probe) -> (StatusFlags, u32) {
        if !probe.reachable {
            let mut status = StatusFlags::empty();
            if self.config.detect_stale_primary
                && previous.contains(StatusFlags::PRIMARY)
                && !previous.contains(StatusFlags::STALE)
            {
                status |= StatusFlags::STALE | StatusFlags::PRIMARY;
            }
            return (status, 0);
        }

        let mut status = StatusFlags::RUNNING;
        let is_replica = probe
            .replica
            .map(|r| r.io_running_ok && r.sql_running_ok)
            .unwrap_or(false);

        match probe.read_only {
            Some(false) => status |= StatusFlags::PRIMARY,
            Some(true) if is_replica => status |= StatusFlags::REPLICA,
            Some(true) => {}
            None if is_replica => status |= StatusFlags::REPLICA,
            None => {}
        }

        let lag = probe.replica.map(|r| r.lag_seconds).unwrap_or(0);
        (status, lag)
    }

    fn fire_events(&self, name: &str, previous: StatusFlags, current: StatusFlags) {
        let mut fired = Vec::new();
        let went_up = |flag: StatusFlags| !previous.contains(flag) && current.contains(flag);
        let went_down = |flag: StatusFlags| previous.contains(flag) && !current.contains(flag);

        if went_up(StatusFlags::RUNNING) {
            fired.push(EventMask::SERVER_UP);
        }
        if went_down(StatusFlags::RUNNING) {
            fired.push(EventMask::SERVER_DOWN);
        }
        if went_up(StatusFlags::PRIMARY) {
            fired.push(if previous.is_empty() { EventMask::NEW_PRIMARY } else { EventMask::PRIMARY_UP });
        }
        if went_down(StatusFlags::PRIMARY) {
            fired.push(if current.is_empty() { EventMask::LOST_PRIMARY } else { EventMask::PRIMARY_DOWN });
        }
        if went_up(StatusFlags::REPLICA) {
            fired.push(if previous.is_empty() { EventMask::NEW_REPLICA } else { EventMask::REPLICA_UP });
        }
        if went_down(StatusFlags::REPLICA) {
            fired.push(if current.is_empty() { EventMask::LOST_REPLICA } else { EventMask::REPLICA_DOWN });
        }

        for event in fired {
            if self.config.events.contains(event) {
                self.run_script(name, event);
            }
        }
    }

    fn run_script(&self, initiator: &str, event: EventMask) {
        let Some(script) = &self.config.script_path else { return };
        let nodelist = self
            .registry
            .list()
            .iter()
            .filter(|s| s.snapshot().status.contains(StatusFlags::RUNNING))
            .map(|s| s.host_port())
            .collect::<Vec<_>>()
            .join(",");

        let command = script
            .to_string_lossy()
            .replace("$INITIATOR", initiator)
            .replace("$EVENT", event.name())
            .replace("$NODELIST", &nodelist);

        let timeout = self.config.script_timeout;
        let script_display = command.clone();
        match std::process::Command::new("sh").arg("-c").arg(command).spawn() {
            Ok(mut child) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            info!("monitor: script hook exited {status}: {script_display}");
                            break;
                        }
                        Ok(None) if Instant::now() >= deadline => {
                            warn!("monitor: script hook timed out, killing: {script_display}");
                            let _ = child.kill();
                            break;
                        }
                        Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                        Err(e) => {
                            warn!("monitor: failed to wait on script hook: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("monitor: failed to launch script hook {script_display}: {e}"),
        }
    }

    fn write_journal(&mut self, force: bool) {
        let Some(path) = &self.config.journal_path else { return };
        if !force {
            if let Some(last) = self.last_journal_write {
                if last.elapsed() < self.config.journal_max_age {
                    return;
                }
            }
        }

        let journal = Journal {
            servers: self
                .last_status
                .iter()
                .map(|(name, status)| {
                    let lag = self
                        .registry
                        .get(name)
                        .map(|s| s.snapshot().lag_seconds)
                        .unwrap_or(0);
                    (name.clone(), JournalServer { status: status_names(*status), lag_s: lag })
                })
                .collect(),
        };

        let Ok(body) = serde_json::to_vec_pretty(&journal) else { return };
        let tmp = path.with_extension("tmp");
        if let Err(e) = fs::write(&tmp, &body).and_then(|_| fs::rename(&tmp, path)) {
            warn!("monitor: failed to write journal {}: {e}", path.display());
            return;
        }
        self.last_journal_write = Some(Instant::now());
    }
}

#[derive(Serialize)]
struct Journal {
    servers: HashMap<String, JournalServer>,
}

#[derive(Serialize)]
struct JournalServer {
    status: Vec<&'static str>,
    lag_s: u32,
}

fn status_names(status: StatusFlags) -> Vec<&'static str> {
    let mut names = Vec::new();
    if status.contains(StatusFlags::RUNNING) {
        names.push("RUNNING");
    }
    if status.contains(StatusFlags::PRIMARY) {
        names.push("PRIMARY");
    }
    if status.contains(StatusFlags::REPLICA) {
        names.push("REPLICA");
    }
    if status.contains(StatusFlags::STALE) {
        names.push("STALE");
    }
    names
}

async fn read_packet(
    reader: &mut crate::protocol::mysql::packet::packet_reader::PacketReader<
        tokio::net::tcp::OwnedReadHalf,
    >,
    timeout: Duration,
) -> io::Result<Packet> {
    let (_, packet) = tokio::time::timeout(timeout, async { async_packet_read!(reader) })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "monitor probe read timed out"))?;
    Ok(packet)
}

fn read_lenenc_int(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    *pos += 1;
    match first {
        0xfb => None,
        0xfc => {
            let bytes = buf.get(*pos..*pos + 2)?;
            *pos += 2;
            Some(u16::from_le_bytes(bytes.try_into().ok()?) as u64)
        }
        0xfd => {
            let bytes = buf.get(*pos..*pos + 3)?;
            *pos += 3;
            Some(bytes[0] as u64 | (bytes[1] as u64) << 8 | (bytes[2] as u64) << 16)
        }
        0xfe => {
            let bytes = buf.get(*pos..*pos + 8)?;
            *pos += 8;
            Some(u64::from_le_bytes(bytes.try_into().ok()?))
        }
        n => Some(n as u64),
    }
}

fn read_lenenc_str(buf: &[u8], pos: &mut usize) -> Option<Option<Vec<u8>>> {
    if buf.get(*pos) == Some(&0xfb) {
        *pos += 1;
        return Some(None);
    }
    let len = read_lenenc_int(buf, pos)? as usize;
    let bytes = buf.get(*pos..*pos + len)?;
    *pos += len;
    Some(Some(bytes.to_vec()))
}

/// Column name (5th lenenc string in a protocol-41 column definition
/// packet: catalog, schema, table, org_table, name, ...).
fn column_name(def: &[u8]) -> Option<String> {
    let mut pos = 0usize;
    for i in 0..5 {
        let value = read_lenenc_str(def, &mut pos)?;
        if i == 4 {
            return value.and_then(|v| String::from_utf8(v).ok());
        }
    }
    None
}

fn parse_row(row: &[u8], column_count: usize) -> Vec<Option<Vec<u8>>> {
    let mut pos = 0usize;
    let mut values = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        match read_lenenc_str(row, &mut pos) {
            Some(v) => values.push(v),
            None => break,
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_primary_from_read_only_off() {
        let registry = Arc::new(Registry::new());
        let account = Arc::new(BackendAccount { username: b"root".to_vec(), password: String::new(), database: None });
        let monitor = Monitor::new(registry, account, MonitorConfig {
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            script_path: None,
            script_timeout: Duration::from_secs(1),
            events: EventMask::all(),
            journal_path: None,
            journal_max_age: Duration::from_secs(1),
            detect_stale_primary: true,
        });
        let probe = Probe { reachable: true, read_only: Some(false), replica: None };
        let (status, _) = monitor.derive_status(StatusFlags::empty(), probe);
        assert_eq!(status, StatusFlags::RUNNING | StatusFlags::PRIMARY);
    }

    #[test]
    fn derives_replica_when_read_only_and_slave_threads_running() {
        let registry = Arc::new(Registry::new());
        let account = Arc::new(BackendAccount { username: b"root".to_vec(), password: String::new(), database: None });
        let monitor = Monitor::new(registry, account, MonitorConfig {
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            script_path: None,
            script_timeout: Duration::from_secs(1),
            events: EventMask::all(),
            journal_path: None,
            journal_max_age: Duration::from_secs(1),
            detect_stale_primary: true,
        });
        let probe = Probe {
            reachable: true,
            read_only: Some(true),
            replica: Some(ReplicaStatus { io_running_ok: true, sql_running_ok: true, lag_seconds: 2 }),
        };
        let (status, lag) = monitor.derive_status(StatusFlags::empty(), probe);
        assert_eq!(status, StatusFlags::RUNNING | StatusFlags::REPLICA);
        assert_eq!(lag, 2);
    }

    #[test]
    fn keeps_primary_marked_stale_on_consecutive_unreachable_probes() {
        let registry = Arc::new(Registry::new());
        let account = Arc::new(BackendAccount { username: b"root".to_vec(), password: String::new(), database: None });
        let monitor = Monitor::new(registry, account, MonitorConfig {
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            script_path: None,
            script_timeout: Duration::from_secs(1),
            events: EventMask::all(),
            journal_path: None,
            journal_max_age: Duration::from_secs(1),
            detect_stale_primary: true,
        });
        let previous = StatusFlags::RUNNING | StatusFlags::PRIMARY;
        let (status, _) = monitor.derive_status(previous, Probe::default());
        assert!(status.contains(StatusFlags::STALE));
        assert!(status.contains(StatusFlags::PRIMARY));
    }

    #[test]
    fn clamps_interval_below_the_configured_floor() {
        let mut config = MonitorConfig {
            interval: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            script_path: None,
            script_timeout: Duration::from_secs(1),
            events: EventMask::all(),
            journal_path: None,
            journal_max_age: Duration::from_secs(1),
            detect_stale_primary: false,
        };
        config.clamp_interval();
        assert_eq!(config.interval, MonitorConfig::MIN_INTERVAL);
    }
}
