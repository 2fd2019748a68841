use crate::protocol::mysql::basic::HandshakeResponse;
use crate::protocol::mysql::constants::SCRAMBLE_SIZE;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;

use async_trait::async_trait;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::Digest;
use sha2::Sha256;
use thiserror::Error;

use rustls::server::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_rustls::rustls;

pub mod authenticator;

// Only for test purpose.
pub fn default_salt() -> [u8; SCRAMBLE_SIZE] {
    let bs = ";X,po_k}>o6^Wz!/kM}N".as_bytes();
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    for i in 0..SCRAMBLE_SIZE {
        salt[i] = bs[i];
        if salt[i] == b'\0' || salt[i] == b'$' {
            salt[i] += 1;
        }
    }
    salt
}

fn val(c: u8, idx: usize) -> Result<u8, std::io::Error> {
    match c {
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'0'..=b'9' => Ok(c - b'0'),
        _ => Err(std::io::Error::new(
            IoErrorKind::InvalidData,
            format!("Invalid hex character {}", idx),
        )),
    }
}

pub fn hex_string_decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, std::io::Error> {
    let data_ref = data.as_ref();
    if data_ref.len() % 2 != 0 {
        return Err(std::io::Error::new(
            IoErrorKind::InvalidData,
            "Input hex string's length needs to be even, as two digits correspond to one byte.",
        ));
    }

    data_ref
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            Ok::<u8, std::io::Error>(val(pair[0], 2 * i)? << 4 | val(pair[1], 2 * i + 1)?)
        })
        .try_collect()
}

/// Generate a random string user ASCII but avoid separator character.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_user_salt() -> [u8; SCRAMBLE_SIZE] {
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for salt_item in salt.iter_mut() {
        let salt_rand = r.gen_range(0..127) as u8;
        *salt_item = salt_rand;
        if *salt_item == b'\0' || *salt_item == b'$' {
            *salt_item += 1;
        }
    }
    salt
}

fn to_u8_32(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut out = [0; 32];
    (out[..]).copy_from_slice(bytes.as_ref());
    out
}

pub fn sha256_1(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha256_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha1_1(bytes: impl AsRef<[u8]>) -> [u8; 20] {
    sha1::Sha1::digest(bytes).into()
}

pub fn xor<T, U>(mut left: T, right: U) -> T
where
    T: AsMut<[u8]>,
    U: AsRef<[u8]>,
{
    left.as_mut()
        .iter_mut()
        .zip(right.as_ref().iter())
        .map(|(l, r)| *l ^= r)
        .last();
    left
}

pub fn sha1_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    hasher.finalize().into()
}

/// Checks a client's `mysql_native_password` response against a stored
/// stage-2 hash (`SHA1(SHA1(password))`), never touching the password itself.
///
/// `token = SHA1(scramble ++ stage2) XOR stage1`, so the stage1 candidate is
/// recovered as `token XOR SHA1(scramble ++ stage2)` and checked by hashing
/// it again and comparing against the stored stage2.
pub fn verify_native_password(
    token: &[u8],
    scramble: &[u8; SCRAMBLE_SIZE],
    stored_hash2: &[u8; 20],
) -> bool {
    if token.len() != 20 {
        return false;
    }
    let mut candidate_hash1 = [0u8; 20];
    candidate_hash1.copy_from_slice(token);
    let mask = sha1_2(scramble, stored_hash2);
    let hash1 = xor(candidate_hash1, mask);
    sha1_1(hash1) == *stored_hash2
}

/// Computes the `mysql_native_password` response the proxy presents to a
/// backend when it holds the backend account's plaintext password. This is
/// the client-side half of the same formula `verify_native_password` checks.
pub fn compute_native_password_token(password: &[u8], scramble: &[u8; SCRAMBLE_SIZE]) -> [u8; 20] {
    let stage1 = sha1_1(password);
    let stage2 = sha1_1(stage1);
    xor(sha1_2(scramble, stage2), stage1)
}

/// Holds, per username, only the stage-2 hash of that account's password.
/// Sufficient to verify a `mysql_native_password` login; never enough to
/// recover the password or to authenticate as that user to a backend.
#[derive(Default, Clone)]
pub struct CredentialStore {
    users: HashMap<Vec<u8>, [u8; 20]>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, username: impl Into<Vec<u8>>, stored_hash2: [u8; 20]) {
        self.users.insert(username.into(), stored_hash2);
    }

    pub fn stored_hash2(&self, username: &[u8]) -> Option<[u8; 20]> {
        self.users.get(username).copied()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("I/O error during authentication: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error during authentication: {0}")]
    Protocol(String),
    #[error("access denied")]
    AccessDenied,
    #[error("peer closed the connection before completing the handshake")]
    PeerClosed,
}

/// Authenticates a client directly against the credentials the proxy holds.
/// No backend is involved: the proxy is the authenticating server here.
#[async_trait]
pub trait ClientAuthenticator: Send + Sync {
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
        W: AsyncWrite + Send + Unpin;
}

/// Authenticates the proxy itself to a backend when opening a fresh pooled
/// connection. The proxy plays the client role here, using the backend
/// account's plaintext password (decrypted from the secrets store) to
/// compute a `mysql_native_password` response.
#[async_trait]
pub trait BackendAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        backend_reader: &mut PacketReader<OwnedReadHalf>,
        backend_writer: &mut PacketWriter<OwnedWriteHalf>,
        username: &[u8],
        password: &str,
        database: Option<&[u8]>,
    ) -> Result<(), AuthError>;
}
