use crate::async_packet_read;
use crate::parse_err_packet;
use crate::protocol::mysql::basic::{client_handshake_response, HandshakeResponse};
use crate::protocol::mysql::constants::{HeaderInfo, MAX_PAYLOAD_LEN, SCRAMBLE_SIZE};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::server::auth::{
    compute_native_password_token, verify_native_password, AuthError, ClientAuthenticator,
    BackendAuthenticator, CredentialStore,
};
use crate::server::{default_capabilities, DEFAULT_BACKEND_VERSION};

use async_trait::async_trait;
use mysql_common::packets::AuthPlugin;
use mysql_common::proto::MySerialize;
use rustls::server::ServerConfig;
use std::io::Write;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_rustls::rustls;
use tracing::warn;

pub struct ProxyAuthenticator;

/// Recovers the 20-byte scramble out of a raw initial handshake packet, the
/// mirror image of `writers::write_initial_handshake`'s byte layout.
fn parse_server_scramble(packet: &[u8]) -> Result<[u8; SCRAMBLE_SIZE], AuthError> {
    if packet.first() != Some(&10) {
        return Err(AuthError::Protocol(
            "unsupported handshake protocol version".to_string(),
        ));
    }
    let version_len = packet[1..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| AuthError::Protocol("missing server version terminator".to_string()))?;

    let mut pos = 1 + version_len + 1; // protocol byte + version string + NUL
    pos += 4; // connection id

    let part1_end = pos + 8;
    if packet.len() < part1_end {
        return Err(AuthError::Protocol("truncated handshake".to_string()));
    }
    let mut scramble = [0u8; SCRAMBLE_SIZE];
    scramble[..8].copy_from_slice(&packet[pos..part1_end]);

    // filler(1) + capability_flags_1(2) + charset(1) + status_flags(2)
    // + capability_flags_2(2) + auth_plugin_data_len(1) + reserved(10)
    pos = part1_end + 1 + 2 + 1 + 2 + 2 + 1 + 10;
    let part2_len = SCRAMBLE_SIZE - 8;
    if packet.len() < pos + part2_len {
        return Err(AuthError::Protocol(
            "truncated handshake scramble".to_string(),
        ));
    }
    scramble[8..].copy_from_slice(&packet[pos..pos + part2_len]);
    Ok(scramble)
}

#[async_trait]
impl ClientAuthenticator for ProxyAuthenticator {
    async fn authenticate<R, W>(
        &self,
        conn_id: u64,
        scramble: [u8; SCRAMBLE_SIZE],
        credentials: &CredentialStore,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        #[cfg(feature = "tls")] tls_conf: &Option<std::sync::Arc<ServerConfig>>,
    ) -> Result<(u8, HandshakeResponse), AuthError>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        #[cfg(feature = "tls")]
        writers::write_initial_handshake(
            client_writer,
            conn_id,
            scramble,
            DEFAULT_BACKEND_VERSION,
            tls_conf,
        )
        .await?;
        #[cfg(not(feature = "tls"))]
        writers::write_initial_handshake(client_writer, conn_id, scramble, DEFAULT_BACKEND_VERSION)
            .await?;

        let Some((seq, packet)) = client_reader.next_async().await? else {
            warn!("ProxySrv client closed the connection before sending HandshakeResponse");
            return Err(AuthError::PeerClosed);
        };

        let (_, handshake) = client_handshake_response(&packet, false)
            .map_err(|_| AuthError::Protocol("malformed HandshakeResponse".to_string()))?;

        let username = handshake.username.clone().unwrap_or_default();
        let authenticated = credentials
            .stored_hash2(&username)
            .map(|hash2| verify_native_password(&handshake.auth_response, &scramble, &hash2))
            .unwrap_or(false);

        if !authenticated {
            warn!(
                user = %String::from_utf8_lossy(&username),
                "ProxySrv rejected client authentication"
            );
            writers::write_err_packet(
                ErrorKind::ER_ACCESS_DENIED_ERROR,
                format!(
                    "Access denied for user '{}'",
                    String::from_utf8_lossy(&username)
                )
                .as_bytes(),
                client_writer,
            )
            .await?;
            return Err(AuthError::AccessDenied);
        }

        Ok((seq, handshake))
    }
}

#[async_trait]
impl BackendAuthenticator for ProxyAuthenticator {
    async fn authenticate(
        &self,
        backend_reader: &mut PacketReader<OwnedReadHalf>,
        backend_writer: &mut PacketWriter<OwnedWriteHalf>,
        username: &[u8],
        password: &str,
        database: Option<&[u8]>,
    ) -> Result<(), AuthError> {
        let (seq, greeting) = async_packet_read!(backend_reader);
        let scramble = parse_server_scramble(&greeting)?;
        let token = compute_native_password_token(password.as_bytes(), &scramble);

        let response = mysql_common::packets::HandshakeResponse::new(
            Some(token.to_vec()),
            (10, 6, 0),
            Some(username.to_vec()),
            database.map(|d| d.to_vec()),
            Some(AuthPlugin::MysqlNativePassword),
            default_capabilities(),
            None,
            MAX_PAYLOAD_LEN as u32,
        );
        let mut response_bytes = Vec::new();
        response.serialize(&mut response_bytes);

        backend_writer.set_seq(seq + 1);
        backend_writer.write_all(&response_bytes)?;
        backend_writer.end_packet().await?;
        backend_writer.flush_all().await?;

        let (_, reply) = async_packet_read!(backend_reader);
        if reply.first() == Some(&(HeaderInfo::ErrHeader as u8)) {
            parse_err_packet!(default_capabilities(), reply, "backend rejected proxy credentials");
            return Err(AuthError::AccessDenied);
        }
        Ok(())
    }
}
