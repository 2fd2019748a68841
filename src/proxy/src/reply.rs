//! Backend reply boundary detection shared by the session engine.
//!
//! A single client command can produce a chain of MariaDB result sets
//! (`SERVER_MORE_RESULTS_EXISTS`), so "the reply" to a routed command is not
//! one packet but a walk until that flag clears. The session engine only
//! needs a `CapabilityFlags` and a destination to drive that walk.

use crate::async_packet_read;
use crate::parse_err_packet;
use crate::protocol::mysql::basic::{eof_server_status, ok_packet};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;

use byteorder::ByteOrder;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncWrite};

/// Reads one logical reply from a backend and forwards every packet of it
/// to the client, returning the final status flags (so the caller can tell
/// whether a transaction is still open, e.g.).
pub async fn forward_logical_reply<R, W>(
    backend_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
    capabilities: CapabilityFlags,
) -> std::io::Result<StatusFlags>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let (seq, packet) = async_packet_read!(backend_reader);
        client_writer.set_seq(seq);
        client_writer.write_all(&packet)?;
        client_writer.end_packet().await?;

        let status = if packet.is_ok_packet() {
            client_writer.flush_all().await?;
            ok_packet(&packet, capabilities)
                .map(|(_, ok)| ok.status_flags)
                .unwrap_or_default()
        } else if packet.is_err_packet() {
            parse_err_packet!(capabilities, packet, "forward_logical_reply ERR");
            client_writer.flush_all().await?;
            return Ok(StatusFlags::empty());
        } else if packet.is_local_in_file_packet() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "LOCAL INFILE is not supported through the proxy",
            ));
        } else {
            forward_result_set(backend_reader, client_writer, capabilities).await?
        };

        if !status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
            return Ok(status);
        }
    }
}

async fn forward_result_set<R, W>(
    backend_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
    capabilities: CapabilityFlags,
) -> std::io::Result<StatusFlags>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let client_deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
    if !client_deprecate_eof {
        // Column definitions end in an EOF; a cursor-backed statement stops
        // right there instead of going on to row data.
        let column_eof = loop {
            let packet = forward_one(backend_reader, client_writer).await?;
            if packet.is_eof_packet() {
                break packet;
            }
        };
        let status_code = byteorder::LittleEndian::read_u16(&column_eof[3..]);
        if let Some(status) = StatusFlags::from_bits(status_code) {
            if status.contains(StatusFlags::SERVER_STATUS_CURSOR_EXISTS) {
                client_writer.flush_all().await?;
                return Ok(status);
            }
        }
    }
    forward_rows_to_end(backend_reader, client_writer, capabilities).await
}

async fn forward_rows_to_end<R, W>(
    backend_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
    capabilities: CapabilityFlags,
) -> std::io::Result<StatusFlags>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let client_deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
    loop {
        let packet = forward_one(backend_reader, client_writer).await?;
        if packet.is_err_packet() {
            parse_err_packet!(capabilities, packet, "forward_rows_to_end ERR");
            client_writer.flush_all().await?;
            return Ok(StatusFlags::empty());
        }
        if !client_deprecate_eof && packet.is_eof_packet() {
            client_writer.flush_all().await?;
            let (_, status) = eof_server_status(&packet)
                .unwrap_or((&[][..], StatusFlags::empty()));
            return Ok(status);
        }
        if client_deprecate_eof && packet.is_result_set_eof_packet() {
            let status = ok_packet(&packet, capabilities)
                .map(|(_, ok)| ok.status_flags)
                .unwrap_or_default();
            client_writer.flush_all().await?;
            return Ok(status);
        }
    }
}

async fn forward_one<R, W>(
    backend_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
) -> std::io::Result<Packet>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let (seq, packet) = async_packet_read!(backend_reader);
    client_writer.set_seq(seq);
    client_writer.write_all(&packet)?;
    client_writer.end_packet().await?;
    Ok(packet)
}

/// Forwards a `COM_STMT_PREPARE` reply: `COM_STMT_PREPARE_OK` plus the
/// column/param definition packets it promises, each ended by a legacy EOF
/// unless the client negotiated `CLIENT_DEPRECATE_EOF`. The reply shape
/// here does not follow the `SERVER_MORE_RESULTS_EXISTS` walk the other
/// commands use, since a prepare reply is never a result set.
///
/// Returns the prepared statement id from `COM_STMT_PREPARE_OK` on success,
/// so the caller can record which backend holds it for later
/// `COM_STMT_EXECUTE`/`COM_STMT_CLOSE` routing.
pub async fn forward_prepare_reply<R, W>(
    backend_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
    capabilities: CapabilityFlags,
) -> std::io::Result<Option<u32>>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let packet = forward_one(backend_reader, client_writer).await?;
    if packet.is_err_packet() {
        parse_err_packet!(capabilities, packet, "forward_prepare_reply ERR");
        client_writer.flush_all().await?;
        return Ok(None);
    }
    if !packet.is_ok_packet() || packet.len() < 9 {
        client_writer.flush_all().await?;
        return Ok(None);
    }

    let stmt_id = byteorder::LittleEndian::read_u32(&packet[1..]);
    let columns = byteorder::LittleEndian::read_u16(&packet[5..]);
    let params = byteorder::LittleEndian::read_u16(&packet[7..]);
    let mut expected = (columns + params) as usize;
    if !capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        if columns > 0 {
            expected += 1;
        }
        if params > 0 {
            expected += 1;
        }
    }
    for _ in 0..expected {
        forward_one(backend_reader, client_writer).await?;
    }
    client_writer.flush_all().await?;
    Ok(Some(stmt_id))
}

/// Reads and drops one logical reply from a backend without writing
/// anything to a client. Used for the replies a fan-out router's unwanted
/// targets send back (the session only forwards the primary reply).
///
/// `capabilities` should reflect whatever capability set the connection
/// that sent the original command negotiated, so `CLIENT_DEPRECATE_EOF`
/// parses the same way it would if this reply were being forwarded.
pub async fn discard_logical_reply<R>(
    backend_reader: &mut PacketReader<R>,
    capabilities: CapabilityFlags,
) -> std::io::Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let (_, packet) = async_packet_read!(backend_reader);
        let status = if packet.is_ok_packet() {
            ok_packet(&packet, capabilities)
                .map(|(_, ok)| ok.status_flags)
                .unwrap_or_default()
        } else if packet.is_err_packet() {
            return Ok(());
        } else if packet.is_local_in_file_packet() {
            return Ok(());
        } else {
            discard_result_set(backend_reader, capabilities).await?
        };

        if !status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
            return Ok(());
        }
    }
}

async fn discard_result_set<R>(
    backend_reader: &mut PacketReader<R>,
    capabilities: CapabilityFlags,
) -> std::io::Result<StatusFlags>
where
    R: AsyncRead + Send + Unpin,
{
    let client_deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
    if !client_deprecate_eof {
        loop {
            let (_, packet) = async_packet_read!(backend_reader);
            if packet.is_eof_packet() {
                break;
            }
        }
    }
    loop {
        let (_, packet) = async_packet_read!(backend_reader);
        if packet.is_err_packet() {
            return Ok(StatusFlags::empty());
        }
        if !client_deprecate_eof && packet.is_eof_packet() {
            let (_, status) = eof_server_status(&packet)
                .unwrap_or((&[][..], StatusFlags::empty()));
            return Ok(status);
        }
        if client_deprecate_eof && packet.is_result_set_eof_packet() {
            let status = ok_packet(&packet, capabilities)
                .map(|(_, ok)| ok.status_flags)
                .unwrap_or_default();
            return Ok(status);
        }
    }
}
