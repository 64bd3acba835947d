use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::network::ike::{ExchangeType, IkeError};

/// Fixed IKEv2 message header length (RFC 7296 section 3.1).
const IKE_HEADER_LEN: usize = 28;

/// Flag bits in the IKE header.
const FLAG_INITIATOR: u8 = 0x08;
const FLAG_RESPONSE: u8 = 0x20;

/// The fixed header preceding every IKEv2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub next_payload: u8,
    pub exchange_type: Option<ExchangeType>,
    pub initiator: bool,
    pub response: bool,
    pub message_id: u32,
    pub length: u32,
}

impl IkeHeader {
    /// Parse and validate the header of a received datagram.
    pub fn parse(data: &[u8]) -> Result<IkeHeader, IkeError> {
        if data.len() < IKE_HEADER_LEN {
            return Err(IkeError::Protocol(format!(
                "datagram too short for IKE header ({} bytes)",
                data.len()
            )));
        }
        let version = data[17];
        if version >> 4 != 2 {
            return Err(IkeError::Protocol(format!(
                "unsupported IKE major version {}",
                version >> 4
            )));
        }
        let length = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);
        if (length as usize) < IKE_HEADER_LEN || length as usize > data.len() {
            return Err(IkeError::Protocol(format!(
                "IKE header length {} doesn't match datagram",
                length
            )));
        }
        let flags = data[19];
        Ok(IkeHeader {
            initiator_spi: u64::from_be_bytes(data[0..8].try_into().unwrap_or([0; 8])),
            responder_spi: u64::from_be_bytes(data[8..16].try_into().unwrap_or([0; 8])),
            next_payload: data[16],
            exchange_type: ExchangeType::from_u8(data[18]),
            initiator: flags & FLAG_INITIATOR != 0,
            response: flags & FLAG_RESPONSE != 0,
            message_id: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
            length,
        })
    }
}

/// UDP front-end accepting IKEv2 messages on port 500/4500. Decryption and
/// the per-IKE_SA task pump sit behind this listener; the caller drives
/// `run` on its own task.
pub struct IkeDaemon {
    socket: UdpSocket,
}

impl IkeDaemon {
    pub async fn bind(listen_addr: SocketAddr) -> Result<Self, IkeError> {
        let socket = UdpSocket::bind(listen_addr).await?;
        tracing::info!("IKE daemon listening on {}", listen_addr);
        Ok(IkeDaemon { socket })
    }

    /// Receive datagrams until the socket fails permanently.
    pub async fn run(&self) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (size, sender) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("IKE socket error: {}", e);
                    continue;
                }
            };
            match IkeHeader::parse(&buf[..size]) {
                Ok(header) => Self::dispatch(&header, sender),
                Err(e) => {
                    tracing::warn!("dropping malformed datagram from {}: {}", sender, e);
                }
            }
        }
    }

    fn dispatch(header: &IkeHeader, sender: SocketAddr) {
        match header.exchange_type {
            Some(exchange_type) => {
                tracing::debug!(
                    "{:?} {} {} from {} (message id {})",
                    exchange_type,
                    if header.response { "response" } else { "request" },
                    if header.initiator { "by initiator" } else { "by responder" },
                    sender,
                    header.message_id
                );
            }
            None => {
                tracing::info!("unknown exchange type from {}, ignored", sender);
            }
        }
    }
}
