//! Candidate gathering over a STUN binding request (RFC 5389).
//!
//! This is the same trick a browser performs when it opens a throwaway peer
//! connection: ask a public STUN server which address our UDP packet came
//! from, and report it as a server-reflexive candidate.

use crate::address::CandidateGatherer;
use async_trait::async_trait;
use rand::RngCore;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

// Initial retransmission timeout, doubled per retry
const INITIAL_RTO: Duration = Duration::from_millis(500);
const MAX_TRANSMISSIONS: u32 = 3;

pub type TransactionId = [u8; 12];

#[derive(Debug, Clone)]
pub struct StunGatherer {
    server: String,
    include_host_candidate: bool,
}

impl Default for StunGatherer {
    fn default() -> Self {
        Self::new(DEFAULT_STUN_SERVER)
    }
}

impl StunGatherer {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            include_host_candidate: false,
        }
    }

    /// Also report the local socket address before the reflexive one.
    /// Off by default, like browsers that mask host candidates.
    pub fn with_host_candidate(mut self, include: bool) -> Self {
        self.include_host_candidate = include;
        self
    }

    async fn bind_for(server: SocketAddr) -> io::Result<UdpSocket> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        Ok(socket)
    }

    async fn request_mapped_address(socket: &UdpSocket) -> io::Result<Option<SocketAddr>> {
        let mut transaction_id = TransactionId::default();
        rand::thread_rng().fill_bytes(&mut transaction_id);
        let request = encode_binding_request(&transaction_id);

        let mut buf = [0u8; 576];
        let mut rto = INITIAL_RTO;

        for attempt in 1..=MAX_TRANSMISSIONS {
            socket.send(&request).await?;
            debug!(attempt, "Sent STUN binding request");

            let deadline = tokio::time::Instant::now() + rto;
            loop {
                let recv = tokio::time::timeout_at(deadline, socket.recv(&mut buf));
                let received = match recv.await {
                    Ok(received) => received?,
                    Err(_) => break,
                };
                // stray datagrams for other transactions are skipped
                if let Some(mapped) = parse_binding_response(&buf[..received], &transaction_id) {
                    return Ok(Some(mapped));
                }
            }
            rto *= 2;
        }

        Ok(None)
    }
}

#[async_trait]
impl CandidateGatherer for StunGatherer {
    async fn gather(&self, tx: mpsc::Sender<String>) -> io::Result<()> {
        let server = tokio::net::lookup_host(&self.server)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", self.server),
                )
            })?;

        let socket = Self::bind_for(server).await?;
        let local = socket.local_addr()?;

        if self.include_host_candidate
            && !local.ip().is_unspecified()
            && tx.send(host_candidate(local)).await.is_err()
        {
            return Ok(());
        }

        match Self::request_mapped_address(&socket).await? {
            Some(mapped) => {
                debug!(%server, %mapped, "STUN server reported mapped address");
                // receiver may already be gone; nothing left to do either way
                let _ = tx.send(reflexive_candidate(mapped, local)).await;
            }
            None => debug!(%server, "No STUN binding response"),
        }

        Ok(())
    }
}

fn host_candidate(local: SocketAddr) -> String {
    format!("candidate:1 1 udp 2122260223 {} {} typ host", local.ip(), local.port())
}

fn reflexive_candidate(mapped: SocketAddr, local: SocketAddr) -> String {
    format!(
        "candidate:2 1 udp 1686052607 {} {} typ srflx raddr {} rport {}",
        mapped.ip(),
        mapped.port(),
        local.ip(),
        local.port()
    )
}

pub fn encode_binding_request(transaction_id: &TransactionId) -> [u8; HEADER_LEN] {
    let mut message = [0u8; HEADER_LEN];
    message[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // bytes 2..4: attribute length, zero
    message[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    message[8..20].copy_from_slice(transaction_id);
    message
}

/// Returns the mapped address from a Binding Success Response carrying our
/// transaction id. XOR-MAPPED-ADDRESS is preferred over MAPPED-ADDRESS.
pub fn parse_binding_response(
    message: &[u8],
    transaction_id: &TransactionId,
) -> Option<SocketAddr> {
    if message.len() < HEADER_LEN {
        return None;
    }

    let message_type = u16::from_be_bytes([message[0], message[1]]);
    let length = u16::from_be_bytes([message[2], message[3]]) as usize;
    let cookie = u32::from_be_bytes([message[4], message[5], message[6], message[7]]);

    if message_type != BINDING_SUCCESS
        || cookie != MAGIC_COOKIE
        || &message[8..20] != transaction_id
    {
        return None;
    }

    let body = message.get(HEADER_LEN..HEADER_LEN + length)?;
    let mut mapped = None;
    let mut offset = 0;

    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body.get(offset + 4..offset + 4 + attr_len)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, Some(transaction_id)) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => mapped = mapped.or_else(|| decode_address(value, None)),
            _ => {}
        }

        // attributes are padded to a multiple of four bytes
        offset += 4 + attr_len.div_ceil(4) * 4;
    }

    mapped
}

// `xor` carries the transaction id when the value is XOR-obfuscated
fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }

    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();

    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let raw: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            let mut octets = raw;
            if xor.is_some() {
                for (byte, mask) in octets.iter_mut().zip(cookie.iter()) {
                    *byte ^= mask;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            let raw: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            let mut octets = raw;
            if let Some(transaction_id) = xor {
                let mask = cookie.iter().chain(transaction_id.iter());
                for (byte, mask) in octets.iter_mut().zip(mask) {
                    *byte ^= mask;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}
