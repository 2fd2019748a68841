//! The per-connection session engine: owns one client socket, authenticates
//! it directly against the credential store, classifies and routes each
//! command to one or more backend channels, and relays the reply back.

use crate::backend::channel::{BackendChannel, ChannelState};
use crate::backend::pool::ConnectionPool;
use crate::backend::registry::Registry;
use crate::backend::router::{Hint, RouteTarget, SessionRouter, SessionView};
use crate::classifier::{classify, Classification};
use crate::protocol::mysql::basic::HandshakeResponse;
use crate::protocol::mysql::constants::{CommandCode, SCRAMBLE_SIZE};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::reply;
use crate::server::auth::authenticator::ProxyAuthenticator;
use crate::server::auth::{AuthError, BackendAuthenticator, ClientAuthenticator, CredentialStore};
use crate::stats::{SessionStats, SessionSummary};

use mysql_common::constants::StatusFlags;
use num_traits::FromPrimitive;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rustls::server::ServerConfig;
use tokio_rustls::rustls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    GreetingSent,
    AuthWait,
    AuthOk,
    Idle,
    Routing,
    AwaitingReply,
    Closing,
    Closed,
}

/// The account the proxy itself authenticates with when it opens a fresh
/// connection to a backend. Decrypted once at startup from the secrets
/// store; distinct from the per-client `CredentialStore`, which only ever
/// holds a one-way hash.
pub struct BackendAccount {
    pub username: Vec<u8>,
    pub password: String,
    pub database: Option<Vec<u8>>,
}

pub struct Session<R, W> {
    conn_id: u64,
    scramble: [u8; SCRAMBLE_SIZE],
    reader: PacketReader<R>,
    writer: PacketWriter<W>,
    state: SessionState,
    registry: Arc<Registry>,
    // One pool per worker thread, never shared across threads (see
    // backend::pool's module doc); `Rc` instead of `Arc` makes that
    // non-negotiable instead of merely intended.
    pool: Rc<Mutex<ConnectionPool>>,
    credentials: Arc<CredentialStore>,
    backend_account: Arc<BackendAccount>,
    router: Box<dyn SessionRouter>,
    hints: Vec<Hint>,
    channels: HashMap<String, BackendChannel>,
    stmt_servers: HashMap<u32, String>,
    handshake: Option<HandshakeResponse>,
    #[cfg(feature = "tls")]
    tls_conf: Option<Arc<ServerConfig>>,
    stats: Arc<SessionStats>,
    started_at: Instant,
    active: Duration,
    server_activity: HashMap<String, SessionSummary>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn_id: u64,
        scramble: [u8; SCRAMBLE_SIZE],
        client_reader: R,
        client_writer: W,
        registry: Arc<Registry>,
        pool: Rc<Mutex<ConnectionPool>>,
        credentials: Arc<CredentialStore>,
        backend_account: Arc<BackendAccount>,
        router: Box<dyn SessionRouter>,
        stats: Arc<SessionStats>,
        #[cfg(feature = "tls")] tls_conf: Option<Arc<ServerConfig>>,
    ) -> Self {
        Self {
            conn_id,
            scramble,
            reader: PacketReader::new(client_reader),
            writer: PacketWriter::new(client_writer),
            state: SessionState::Accepted,
            registry,
            pool,
            credentials,
            backend_account,
            router,
            hints: Vec::new(),
            channels: HashMap::new(),
            stmt_servers: HashMap::new(),
            handshake: None,
            #[cfg(feature = "tls")]
            tls_conf,
            stats,
            started_at: Instant::now(),
            active: Duration::ZERO,
            server_activity: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn capabilities(&self) -> mysql_common::constants::CapabilityFlags {
        self.handshake
            .as_ref()
            .map(|h| h.client_flag)
            .unwrap_or_else(crate::server::default_capabilities)
    }

    /// Drives the connection end to end: handshake, auth, command loop,
    /// graceful close. Any I/O error propagated from here means the client
    /// socket is unusable and the caller should drop it.
    pub async fn run(mut self) -> io::Result<()> {
        self.state = SessionState::GreetingSent;
        let authenticator = ProxyAuthenticator;

        let auth_result = authenticator
            .authenticate(
                self.conn_id,
                self.scramble,
                &self.credentials,
                &mut self.reader,
                &mut self.writer,
                #[cfg(feature = "tls")]
                &self.tls_conf,
            )
            .await;

        let handshake = match auth_result {
            Ok((_seq, handshake)) => handshake,
            Err(AuthError::AccessDenied) | Err(AuthError::PeerClosed) => {
                self.state = SessionState::Closed;
                return Ok(());
            }
            Err(AuthError::Protocol(msg)) => {
                self.state = SessionState::Closed;
                return Err(io::Error::new(io::ErrorKind::InvalidData, msg));
            }
            Err(AuthError::Io(e)) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };

        info!(
            conn_id = self.conn_id,
            user = %String::from_utf8_lossy(handshake.username.as_deref().unwrap_or(b"_NONE")),
            "ProxySrv client authenticated"
        );
        self.handshake = Some(handshake);
        self.state = SessionState::AuthOk;

        writers::write_ok_packet(&mut self.writer, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
        self.writer.flush_all().await?;
        self.state = SessionState::Idle;

        let result = self.command_loop().await;
        self.close_all().await;
        self.state = SessionState::Closed;
        self.stats
            .record_session(&self.server_activity, self.started_at.elapsed(), self.active);
        result
    }

    async fn command_loop(&mut self) -> io::Result<()> {
        loop {
            let Some((_seq, packet)) = self.reader.next_async().await? else {
                self.state = SessionState::Closing;
                return Ok(());
            };
            if packet.is_empty() {
                continue;
            }
            let Some(com) = CommandCode::from_u8(packet[0]) else {
                writers::write_err_packet(
                    crate::protocol::mysql::error_codes::ErrorKind::ER_HANDSHAKE_ERROR,
                    b"unrecognised command",
                    &mut self.writer,
                )
                .await?;
                self.writer.flush_all().await?;
                continue;
            };

            self.state = SessionState::Routing;
            match com {
                CommandCode::ComQuit => {
                    self.state = SessionState::Closing;
                    return Ok(());
                }
                CommandCode::ComPing => {
                    writers::write_ok_packet(&mut self.writer, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT)
                        .await?;
                    self.writer.flush_all().await?;
                }
                CommandCode::ComInitDB => {
                    self.handle_session_write(&packet).await?;
                }
                CommandCode::ComResetConnection => {
                    self.handle_reset_connection().await?;
                }
                CommandCode::ComChangeUser => {
                    self.handle_change_user(&packet).await?;
                }
                CommandCode::ComQuery | CommandCode::ComStmtPrepare => {
                    self.handle_classified(&packet, com).await?;
                }
                CommandCode::ComStmtExecute | CommandCode::ComStmtSendLongData | CommandCode::ComStmtFetch => {
                    self.handle_stmt_followup(&packet).await?;
                }
                CommandCode::ComStmtClose => {
                    self.handle_stmt_close(&packet);
                }
                _ => {
                    self.handle_session_write(&packet).await?;
                }
            }
            self.state = SessionState::Idle;
        }
    }

    fn write_backend_name(&self) -> Option<&str> {
        // The connection router binds exactly one backend and never calls
        // this; the r/w split router treats the first channel opened as the
        // write backend by construction of its config, not by inspecting
        // session state, so this is only meaningful information for hint
        // routing's "All"/fallback behavior.
        self.channels.keys().next().map(|s| s.as_str())
    }

    async fn route(&mut self, classification: &Classification) -> io::Result<RouteTarget> {
        let open: Vec<String> = self.channels.keys().cloned().collect();
        // Resolved to an owned value before borrowing `self.router` below:
        // `view` must not keep borrowing `self` once `route_query` needs it
        // mutably.
        let write_backend_owned = self.write_backend_name().map(|s| s.to_string());
        let view = SessionView {
            open_backends: &open,
            write_backend: write_backend_owned.as_deref(),
        };
        self.router
            .route_query(&self.registry, view, classification, &self.hints)
            .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e.to_string()))
    }

    /// COM_QUERY / COM_STMT_PREPARE: classify, route, forward, and (for
    /// prepares) remember which server holds the statement.
    async fn handle_classified(&mut self, packet: &[u8], com: CommandCode) -> io::Result<()> {
        let sql = &packet[1..];
        let classification = classify(sql)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{e:?}")))?;
        let target = self.route(&classification).await?;
        let capabilities = self.capabilities();
        let is_write = classification.type_mask.intersects(
            crate::classifier::TypeMask::WRITE | crate::classifier::TypeMask::SESSION_WRITE,
        );

        match target {
            RouteTarget::One(server) => {
                self.ensure_channel(&server).await?;
                self.record_activity(&server, is_write);
                self.send_command(&server, packet).await?;
                if com == CommandCode::ComStmtPrepare {
                    let stmt_id = self.forward_prepare(&server, capabilities).await?;
                    if let Some(id) = stmt_id {
                        self.stmt_servers.insert(id, server);
                    }
                } else {
                    self.forward_one(&server, capabilities).await?;
                }
            }
            RouteTarget::FanOut(servers) => {
                for server in &servers {
                    self.ensure_channel(server).await?;
                    self.record_activity(server, is_write);
                    self.send_command(server, packet).await?;
                }
                let (primary, rest) = servers.split_first().expect("fan-out target is non-empty");
                for server in rest {
                    let channel = self.channels.get_mut(server).expect("just ensured");
                    reply::discard_logical_reply(channel.reader_mut(), capabilities).await?;
                }
                self.forward_one(primary, capabilities).await?;
            }
        }
        Ok(())
    }

    /// COM_STMT_EXECUTE / COM_STMT_SEND_LONG_DATA / COM_STMT_FETCH: route to
    /// whichever server holds the referenced prepared statement.
    async fn handle_stmt_followup(&mut self, packet: &[u8]) -> io::Result<()> {
        if packet.len() < 5 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated stmt command"));
        }
        let stmt_id = u32::from_le_bytes([packet[1], packet[2], packet[3], packet[4]]);
        let Some(server) = self.stmt_servers.get(&stmt_id).cloned() else {
            writers::write_err_packet(
                crate::protocol::mysql::error_codes::ErrorKind::ER_HANDSHAKE_ERROR,
                b"Unknown prepared statement handle",
                &mut self.writer,
            )
            .await?;
            return self.writer.flush_all().await;
        };
        self.ensure_channel(&server).await?;
        self.send_command(&server, packet).await?;
        let capabilities = self.capabilities();
        self.forward_one(&server, capabilities).await
    }

    fn handle_stmt_close(&mut self, packet: &[u8]) {
        if packet.len() < 5 {
            return;
        }
        let stmt_id = u32::from_le_bytes([packet[1], packet[2], packet[3], packet[4]]);
        self.stmt_servers.remove(&stmt_id);
        // COM_STMT_CLOSE expects no reply; the backend channel this
        // referenced keeps its own prepared-statement table and is not
        // otherwise touched here.
    }

    /// Commands the proxy can't meaningfully classify (COM_FIELD_LIST,
    /// COM_PROCESS_INFO, ...): forward to every open channel, or to a fresh
    /// write-role pick if none is open yet, and relay only the primary
    /// reply. Conservative but correct: these are rare on the hot path.
    async fn handle_session_write(&mut self, packet: &[u8]) -> io::Result<()> {
        let classification = Classification {
            op: crate::classifier::OpCode::Other,
            type_mask: crate::classifier::TypeMask::SESSION_WRITE,
            kill_info: None,
            multi_statement: false,
        };
        let target = self.route(&classification).await?;
        let capabilities = self.capabilities();
        match target {
            RouteTarget::One(server) => {
                self.ensure_channel(&server).await?;
                self.record_activity(&server, true);
                self.send_command(&server, packet).await?;
                self.forward_one(&server, capabilities).await
            }
            RouteTarget::FanOut(servers) => {
                for server in &servers {
                    self.ensure_channel(server).await?;
                    self.record_activity(server, true);
                    self.send_command(server, packet).await?;
                }
                let (primary, rest) = servers.split_first().expect("fan-out target is non-empty");
                for server in rest {
                    let channel = self.channels.get_mut(server).expect("just ensured");
                    reply::discard_logical_reply(channel.reader_mut(), capabilities).await?;
                }
                self.forward_one(primary, capabilities).await
            }
        }
    }

    fn record_activity(&mut self, server: &str, is_write: bool) {
        let entry = self.server_activity.entry(server.to_string()).or_default();
        if is_write {
            entry.writes += 1;
        } else {
            entry.reads += 1;
        }
    }

    async fn handle_reset_connection(&mut self) -> io::Result<()> {
        self.stmt_servers.clear();
        for (_name, channel) in self.channels.iter_mut() {
            channel.writer_mut().reset_seq();
            if writers::write_reset_connection(channel.writer_mut()).await.is_ok() {
                let _ = reply::discard_logical_reply(channel.reader_mut(), self.capabilities()).await;
            }
        }
        writers::write_ok_packet(&mut self.writer, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
        self.writer.flush_all().await
    }

    /// Since the proxy authenticates clients directly rather than by
    /// forwarding to a backend, COM_CHANGE_USER is just a second
    /// authentication round against the credential store; open backend
    /// channels are dropped so the new identity starts from a clean slate.
    async fn handle_change_user(&mut self, packet: &[u8]) -> io::Result<()> {
        let Some((username, token, database)) = parse_change_user(packet) else {
            writers::write_err_packet(
                crate::protocol::mysql::error_codes::ErrorKind::ER_HANDSHAKE_ERROR,
                b"malformed COM_CHANGE_USER",
                &mut self.writer,
            )
            .await?;
            return self.writer.flush_all().await;
        };

        let authenticated = self
            .credentials
            .stored_hash2(&username)
            .map(|hash2| crate::server::auth::verify_native_password(&token, &self.scramble, &hash2))
            .unwrap_or(false);

        if !authenticated {
            warn!(user = %String::from_utf8_lossy(&username), "ProxySrv rejected COM_CHANGE_USER");
            writers::write_err_packet(
                crate::protocol::mysql::error_codes::ErrorKind::ER_ACCESS_DENIED_ERROR,
                format!("Access denied for user '{}'", String::from_utf8_lossy(&username)).as_bytes(),
                &mut self.writer,
            )
            .await?;
            return self.writer.flush_all().await;
        }

        self.close_all().await;
        self.stmt_servers.clear();

        if let Some(mut handshake) = self.handshake.take() {
            handshake.username = Some(username);
            handshake.database = database;
            self.handshake = Some(handshake);
        }
        debug!("ProxySrv COM_CHANGE_USER accepted");
        writers::write_ok_packet(&mut self.writer, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
        self.writer.flush_all().await
    }

    async fn send_command(&mut self, server: &str, packet: &[u8]) -> io::Result<()> {
        let channel = self.channels.get_mut(server).expect("channel just ensured");
        channel.set_state(ChannelState::Busy);
        channel.writer_mut().reset_seq();
        std::io::Write::write_all(channel.writer_mut(), packet)?;
        channel.writer_mut().end_packet().await?;
        channel.writer_mut().flush_all().await
    }

    async fn forward_one(
        &mut self,
        server: &str,
        capabilities: mysql_common::constants::CapabilityFlags,
    ) -> io::Result<()> {
        let channel = self.channels.get_mut(server).expect("channel just ensured");
        self.state = SessionState::AwaitingReply;
        let wait_start = Instant::now();
        reply::forward_logical_reply(channel.reader_mut(), &mut self.writer, capabilities).await?;
        self.active += wait_start.elapsed();
        channel.set_state(ChannelState::Idle);
        Ok(())
    }

    async fn forward_prepare(
        &mut self,
        server: &str,
        capabilities: mysql_common::constants::CapabilityFlags,
    ) -> io::Result<Option<u32>> {
        let channel = self.channels.get_mut(server).expect("channel just ensured");
        self.state = SessionState::AwaitingReply;
        let wait_start = Instant::now();
        let stmt_id =
            reply::forward_prepare_reply(channel.reader_mut(), &mut self.writer, capabilities).await?;
        self.active += wait_start.elapsed();
        channel.set_state(ChannelState::Idle);
        Ok(stmt_id)
    }

    /// Opens (and, if fresh, authenticates) a channel to `server` if the
    /// session doesn't already have one.
    async fn ensure_channel(&mut self, server_name: &str) -> io::Result<()> {
        if self.channels.contains_key(server_name) {
            return Ok(());
        }
        let server = self.registry.get(server_name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown backend server {server_name}"))
        })?;

        let mut channel = {
            let mut pool = self.pool.lock().await;
            pool.acquire(&server)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
        };

        if channel.state() == ChannelState::Connecting {
            channel.set_state(ChannelState::Authenticating);
            let authenticator = ProxyAuthenticator;
            authenticator
                .authenticate(
                    channel.reader_mut(),
                    channel.writer_mut(),
                    &self.backend_account.username,
                    &self.backend_account.password,
                    self.backend_account.database.as_deref(),
                )
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()))?;
        }
        channel.set_state(ChannelState::Idle);
        self.channels.insert(server_name.to_string(), channel);
        Ok(())
    }

    /// Releases every open backend channel back to the pool (or closes it,
    /// if it ended in a non-reusable state) on session teardown or
    /// COM_CHANGE_USER.
    async fn close_all(&mut self) {
        let names: Vec<String> = self.channels.keys().cloned().collect();
        let mut pool = self.pool.lock().await;
        for name in names {
            if let Some(channel) = self.channels.remove(&name) {
                pool.release(channel).await;
            }
        }
    }
}

/// Picks apart a `COM_CHANGE_USER` payload: command byte, NUL-terminated
/// username, a length-prefixed auth-response (the proxy always negotiates
/// `CLIENT_SECURE_CONNECTION`, so this is never the legacy NUL-terminated
/// form), then a NUL-terminated default schema. Character set, auth plugin
/// name and connect attributes that may follow aren't needed here.
fn parse_change_user(packet: &[u8]) -> Option<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)> {
    if packet.first() != Some(&(CommandCode::ComChangeUser as u8)) {
        return None;
    }
    let mut pos = 1;
    let name_len = packet[pos..].iter().position(|&b| b == 0)?;
    let username = packet[pos..pos + name_len].to_vec();
    pos += name_len + 1;

    let auth_len = *packet.get(pos)? as usize;
    pos += 1;
    if pos + auth_len > packet.len() {
        return None;
    }
    let auth_response = packet[pos..pos + auth_len].to_vec();
    pos += auth_len;

    let database = packet[pos..]
        .iter()
        .position(|&b| b == 0)
        .filter(|&n| n > 0)
        .map(|n| packet[pos..pos + n].to_vec());

    Some((username, auth_response, database))
}
