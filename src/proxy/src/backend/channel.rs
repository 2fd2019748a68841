//! One TCP connection to a backend server and the state machine that governs
//! its lifetime inside a session or the pool.

use crate::backend::registry::Server;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Uninitialised = 0,
    Connecting = 1,
    Handshaking = 2,
    Authenticating = 3,
    Idle = 4,
    Busy = 5,
    Pooled = 6,
    Closing = 7,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Uninitialised,
            1 => ChannelState::Connecting,
            2 => ChannelState::Handshaking,
            3 => ChannelState::Authenticating,
            4 => ChannelState::Idle,
            5 => ChannelState::Busy,
            6 => ChannelState::Pooled,
            _ => ChannelState::Closing,
        }
    }
}

/// A connection to one `server`, owning its socket halves and read/write
/// packet framing. Sequence-id tracking lives in the `PacketWriter`/
/// `PacketReader` themselves.
pub struct BackendChannel {
    pub server: Arc<Server>,
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
    state: AtomicU8,
    pub default_schema: Option<String>,
    pub in_transaction: bool,
}

impl BackendChannel {
    /// Opens a fresh TCP connection to `server` in the `CONNECTING` state.
    /// The caller drives the handshake/auth sub-protocol before handing the
    /// channel to a session or the pool as `IDLE`.
    pub async fn connect(server: Arc<Server>) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect(server.host_port()).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        server.record_connection_opened();
        Ok(Self {
            server,
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
            state: AtomicU8::new(ChannelState::Connecting as u8),
            default_schema: None,
            in_transaction: false,
        })
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn reader_mut(&mut self) -> &mut PacketReader<OwnedReadHalf> {
        &mut self.reader
    }

    pub fn writer_mut(&mut self) -> &mut PacketWriter<OwnedWriteHalf> {
        &mut self.writer
    }

    pub fn reset_seq(&mut self) {
        self.writer.reset_seq();
    }

    /// A channel is reusable from the pool's perspective: idle protocol
    /// state, default schema recorded (or never changed), no open
    /// transaction.
    pub fn is_reusable(&self) -> bool {
        self.state() == ChannelState::Idle && !self.in_transaction
    }

    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        self.set_state(ChannelState::Closing);
        self.server.record_connection_closed();
        use tokio::io::AsyncWriteExt;
        self.writer.inner_writer.shutdown().await
    }
}

impl std::fmt::Debug for BackendChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendChannel")
            .field("server", &self.server.name)
            .field("state", &self.state())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}
