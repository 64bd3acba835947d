use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::network::ike::proposal::{Proposal, Transform};
use crate::network::ike::ts::{SecLabel, TrafficSelector, TS_IPV4_ADDR_RANGE, TS_IPV6_ADDR_RANGE, TS_SECLABEL};
use crate::network::ike::{
    ExchangeType, IkeError, KeMethod, Nonce, NotifyType, ProtocolId, Spi, TransformType,
};

/// IKEv2 payload type identifiers.
pub const PL_SECURITY_ASSOCIATION: u8 = 33;
pub const PL_KEY_EXCHANGE: u8 = 34;
pub const PL_NONCE: u8 = 40;
pub const PL_NOTIFY: u8 = 41;
pub const PL_DELETE: u8 = 42;
pub const PL_TS_INITIATOR: u8 = 44;
pub const PL_TS_RESPONDER: u8 = 45;

/// KEY_LENGTH transform attribute, TV format.
const ATTR_KEY_LENGTH: u16 = 14;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaPayload {
    pub proposals: Vec<Proposal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KePayload {
    pub method: KeMethod,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoncePayload {
    pub nonce: Nonce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub protocol: Option<ProtocolId>,
    pub spi: Option<Spi>,
    pub notify_type: NotifyType,
    pub data: Vec<u8>,
}

impl NotifyPayload {
    pub fn new(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol: None,
            spi: None,
            notify_type,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub protocol: ProtocolId,
    pub spis: Vec<Spi>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsPayload {
    pub initiator: bool,
    pub selectors: Vec<TrafficSelector>,
    pub labels: Vec<SecLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Sa(SaPayload),
    Ke(KePayload),
    Nonce(NoncePayload),
    Notify(NotifyPayload),
    Delete(DeletePayload),
    Ts(TsPayload),
}

impl Payload {
    pub fn payload_type(&self) -> u8 {
        match self {
            Payload::Sa(_) => PL_SECURITY_ASSOCIATION,
            Payload::Ke(_) => PL_KEY_EXCHANGE,
            Payload::Nonce(_) => PL_NONCE,
            Payload::Notify(_) => PL_NOTIFY,
            Payload::Delete(_) => PL_DELETE,
            Payload::Ts(ts) => {
                if ts.initiator {
                    PL_TS_INITIATOR
                } else {
                    PL_TS_RESPONDER
                }
            }
        }
    }
}

/// A decrypted IKEv2 message as seen by tasks: the exchange type plus the
/// payload chain. Header framing and encryption happen outside this module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub exchange_type: ExchangeType,
    pub payloads: Vec<Payload>,
}

impl Message {
    pub fn new(exchange_type: ExchangeType) -> Self {
        Message {
            exchange_type,
            payloads: Vec::new(),
        }
    }

    pub fn set_exchange_type(&mut self, exchange_type: ExchangeType) {
        self.exchange_type = exchange_type;
    }

    pub fn add_payload(&mut self, payload: Payload) {
        self.payloads.push(payload);
    }

    /// Add a notify payload. With `flush` set, all previously added payloads
    /// are dropped first (used for fatal error responses).
    pub fn add_notify(&mut self, flush: bool, notify_type: NotifyType, data: Vec<u8>) {
        if flush {
            self.payloads.clear();
        }
        self.payloads
            .push(Payload::Notify(NotifyPayload::new(notify_type, data)));
    }

    pub fn get_notify(&self, notify_type: NotifyType) -> Option<&NotifyPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Notify(n) if n.notify_type == notify_type => Some(n),
            _ => None,
        })
    }

    pub fn notifies(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&Nonce> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Nonce(n) => Some(&n.nonce),
            _ => None,
        })
    }

    pub fn sa(&self) -> Option<&SaPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Sa(sa) => Some(sa),
            _ => None,
        })
    }

    pub fn ke(&self) -> Option<&KePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Ke(ke) => Some(ke),
            _ => None,
        })
    }

    pub fn ts(&self, initiator: bool) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Ts(ts) if ts.initiator == initiator => Some(ts),
            _ => None,
        })
    }

    /// Encode the payload chain. Returns the first payload type and the
    /// concatenated generic-header-prefixed payload bodies.
    pub fn encode(&self) -> (u8, Vec<u8>) {
        let mut out = Vec::new();
        let first = self.payloads.first().map(Payload::payload_type).unwrap_or(0);
        for (i, payload) in self.payloads.iter().enumerate() {
            let next = self
                .payloads
                .get(i + 1)
                .map(Payload::payload_type)
                .unwrap_or(0);
            let body = encode_body(payload);
            out.push(next);
            out.push(0); // non-critical, reserved
            out.extend_from_slice(&((body.len() as u16 + 4).to_be_bytes()));
            out.extend_from_slice(&body);
        }
        (first, out)
    }

    /// Decode a payload chain produced by `encode`.
    pub fn decode(
        exchange_type: ExchangeType,
        first: u8,
        data: &[u8],
    ) -> Result<Message, IkeError> {
        let mut payloads = Vec::new();
        let mut current = first;
        let mut rest = data;
        while current != 0 {
            if rest.len() < 4 {
                return Err(IkeError::Protocol("truncated payload header".into()));
            }
            let next = rest[0];
            let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if length < 4 || length > rest.len() {
                return Err(IkeError::Protocol("bad payload length".into()));
            }
            let body = &rest[4..length];
            payloads.push(decode_body(current, body)?);
            rest = &rest[length..];
            current = next;
        }
        Ok(Message {
            exchange_type,
            payloads,
        })
    }
}

fn encode_body(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Sa(sa) => encode_sa(sa),
        Payload::Ke(ke) => encode_ke(ke),
        Payload::Nonce(n) => n.nonce.as_bytes().to_vec(),
        Payload::Notify(n) => encode_notify(n),
        Payload::Delete(d) => encode_delete(d),
        Payload::Ts(ts) => encode_ts(ts),
    }
}

fn decode_body(ptype: u8, body: &[u8]) -> Result<Payload, IkeError> {
    match ptype {
        PL_SECURITY_ASSOCIATION => Ok(Payload::Sa(decode_sa(body)?)),
        PL_KEY_EXCHANGE => Ok(Payload::Ke(decode_ke(body)?)),
        PL_NONCE => {
            if body.len() < 16 || body.len() > 256 {
                return Err(IkeError::Protocol("nonce length out of range".into()));
            }
            Ok(Payload::Nonce(NoncePayload {
                nonce: Nonce(body.to_vec()),
            }))
        }
        PL_NOTIFY => Ok(Payload::Notify(decode_notify(body)?)),
        PL_DELETE => Ok(Payload::Delete(decode_delete(body)?)),
        PL_TS_INITIATOR => Ok(Payload::Ts(decode_ts(body, true)?)),
        PL_TS_RESPONDER => Ok(Payload::Ts(decode_ts(body, false)?)),
        other => Err(IkeError::Protocol(format!(
            "unsupported payload type {}",
            other
        ))),
    }
}

fn encode_transform(transform: &Transform, last: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(if last { 0 } else { 3 });
    out.push(0);
    let attr_len = if transform.key_length.is_some() { 4 } else { 0 };
    out.extend_from_slice(&((8 + attr_len) as u16).to_be_bytes());
    out.push(transform.ttype.to_u8());
    out.push(0);
    out.extend_from_slice(&transform.id.to_be_bytes());
    if let Some(bits) = transform.key_length {
        out.extend_from_slice(&(0x8000 | ATTR_KEY_LENGTH).to_be_bytes());
        out.extend_from_slice(&bits.to_be_bytes());
    }
    out
}

fn encode_sa(sa: &SaPayload) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, proposal) in sa.proposals.iter().enumerate() {
        let last = i + 1 == sa.proposals.len();
        let mut body = Vec::new();
        body.push(proposal.number);
        body.push(proposal.protocol.to_u8());
        body.push(4); // SPI size
        body.push(proposal.transforms.len() as u8);
        body.extend_from_slice(&proposal.spi.to_be_bytes());
        for (j, transform) in proposal.transforms.iter().enumerate() {
            body.extend_from_slice(&encode_transform(
                transform,
                j + 1 == proposal.transforms.len(),
            ));
        }
        out.push(if last { 0 } else { 2 });
        out.push(0);
        out.extend_from_slice(&((body.len() as u16 + 4).to_be_bytes()));
        out.extend_from_slice(&body);
    }
    out
}

fn decode_sa(mut body: &[u8]) -> Result<SaPayload, IkeError> {
    let mut proposals = Vec::new();
    while !body.is_empty() {
        if body.len() < 8 {
            return Err(IkeError::Protocol("truncated proposal".into()));
        }
        let more = body[0];
        let length = u16::from_be_bytes([body[2], body[3]]) as usize;
        if length < 8 || length > body.len() {
            return Err(IkeError::Protocol("bad proposal length".into()));
        }
        let number = body[4];
        let protocol = ProtocolId::from_u8(body[5])
            .ok_or_else(|| IkeError::Protocol("unknown protocol in proposal".into()))?;
        let spi_size = body[6] as usize;
        let num_transforms = body[7] as usize;
        if spi_size != 4 || length < 8 + spi_size {
            return Err(IkeError::Protocol("unexpected SPI size".into()));
        }
        let spi = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
        let mut transforms = Vec::new();
        let mut rest = &body[8 + spi_size..length];
        while !rest.is_empty() {
            if rest.len() < 8 {
                return Err(IkeError::Protocol("truncated transform".into()));
            }
            let tlen = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if tlen < 8 || tlen > rest.len() {
                return Err(IkeError::Protocol("bad transform length".into()));
            }
            let ttype = TransformType::from_u8(rest[4])
                .ok_or_else(|| IkeError::Protocol("unknown transform type".into()))?;
            let id = u16::from_be_bytes([rest[6], rest[7]]);
            let mut key_length = None;
            let mut attrs = &rest[8..tlen];
            while attrs.len() >= 4 {
                let af_type = u16::from_be_bytes([attrs[0], attrs[1]]);
                let value = u16::from_be_bytes([attrs[2], attrs[3]]);
                if af_type == 0x8000 | ATTR_KEY_LENGTH {
                    key_length = Some(value);
                }
                attrs = &attrs[4..];
            }
            transforms.push(Transform {
                ttype,
                id,
                key_length,
            });
            rest = &rest[tlen..];
        }
        if transforms.len() != num_transforms {
            return Err(IkeError::Protocol("transform count mismatch".into()));
        }
        proposals.push(Proposal {
            number,
            protocol,
            spi,
            transforms,
        });
        body = &body[length..];
        if more == 0 && !body.is_empty() {
            return Err(IkeError::Protocol("data after last proposal".into()));
        }
    }
    Ok(SaPayload { proposals })
}

fn encode_ke(ke: &KePayload) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&ke.method.to_u16().to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&ke.data);
    out
}

fn decode_ke(body: &[u8]) -> Result<KePayload, IkeError> {
    if body.len() < 4 {
        return Err(IkeError::Protocol("truncated KE payload".into()));
    }
    Ok(KePayload {
        method: KeMethod::from_u16(u16::from_be_bytes([body[0], body[1]])),
        data: body[4..].to_vec(),
    })
}

fn encode_notify(notify: &NotifyPayload) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(notify.protocol.map(ProtocolId::to_u8).unwrap_or(0));
    out.push(if notify.spi.is_some() { 4 } else { 0 });
    out.extend_from_slice(&notify.notify_type.to_u16().to_be_bytes());
    if let Some(spi) = notify.spi {
        out.extend_from_slice(&spi.0.to_be_bytes());
    }
    out.extend_from_slice(&notify.data);
    out
}

fn decode_notify(body: &[u8]) -> Result<NotifyPayload, IkeError> {
    if body.len() < 4 {
        return Err(IkeError::Protocol("truncated notify payload".into()));
    }
    let protocol = ProtocolId::from_u8(body[0]);
    let spi_size = body[1] as usize;
    let notify_type = NotifyType::from_u16(u16::from_be_bytes([body[2], body[3]]));
    if body.len() < 4 + spi_size {
        return Err(IkeError::Protocol("truncated notify SPI".into()));
    }
    let spi = if spi_size == 4 {
        Some(Spi(u32::from_be_bytes([
            body[4], body[5], body[6], body[7],
        ])))
    } else {
        None
    };
    Ok(NotifyPayload {
        protocol,
        spi,
        notify_type,
        data: body[4 + spi_size..].to_vec(),
    })
}

fn encode_delete(delete: &DeletePayload) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(delete.protocol.to_u8());
    out.push(4);
    out.extend_from_slice(&(delete.spis.len() as u16).to_be_bytes());
    for spi in &delete.spis {
        out.extend_from_slice(&spi.0.to_be_bytes());
    }
    out
}

fn decode_delete(body: &[u8]) -> Result<DeletePayload, IkeError> {
    if body.len() < 4 {
        return Err(IkeError::Protocol("truncated delete payload".into()));
    }
    let protocol = ProtocolId::from_u8(body[0])
        .ok_or_else(|| IkeError::Protocol("unknown protocol in delete".into()))?;
    let count = u16::from_be_bytes([body[2], body[3]]) as usize;
    let spi_size = body[1] as usize;
    if spi_size != 4 || body.len() != 4 + count * 4 {
        return Err(IkeError::Protocol("bad delete payload length".into()));
    }
    let spis = body[4..]
        .chunks_exact(4)
        .map(|c| Spi(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
        .collect();
    Ok(DeletePayload { protocol, spis })
}

fn encode_ts(ts: &TsPayload) -> Vec<u8> {
    let mut out = Vec::new();
    out.push((ts.selectors.len() + ts.labels.len()) as u8);
    out.extend_from_slice(&[0, 0, 0]);
    for sel in &ts.selectors {
        let addr_len = if sel.is_ipv6() { 16 } else { 4 };
        out.push(sel.ts_type());
        out.push(sel.protocol);
        out.extend_from_slice(&((8 + 2 * addr_len) as u16).to_be_bytes());
        out.extend_from_slice(&sel.start_port.to_be_bytes());
        out.extend_from_slice(&sel.end_port.to_be_bytes());
        encode_addr(&mut out, sel.start_addr);
        encode_addr(&mut out, sel.end_addr);
    }
    for label in &ts.labels {
        out.push(TS_SECLABEL);
        out.push(0);
        out.extend_from_slice(&((4 + label.as_bytes().len()) as u16).to_be_bytes());
        out.extend_from_slice(label.as_bytes());
    }
    out
}

fn encode_addr(out: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
}

fn decode_ts(body: &[u8], initiator: bool) -> Result<TsPayload, IkeError> {
    if body.len() < 4 {
        return Err(IkeError::Protocol("truncated TS payload".into()));
    }
    let count = body[0] as usize;
    let mut selectors = Vec::new();
    let mut labels = Vec::new();
    let mut rest = &body[4..];
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(IkeError::Protocol("truncated traffic selector".into()));
        }
        let ts_type = rest[0];
        let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if length < 4 || length > rest.len() {
            return Err(IkeError::Protocol("bad traffic selector length".into()));
        }
        match ts_type {
            TS_IPV4_ADDR_RANGE | TS_IPV6_ADDR_RANGE => {
                let addr_len = if ts_type == TS_IPV4_ADDR_RANGE { 4 } else { 16 };
                if length != 8 + 2 * addr_len {
                    return Err(IkeError::Protocol("bad address selector length".into()));
                }
                let protocol = rest[1];
                let start_port = u16::from_be_bytes([rest[4], rest[5]]);
                let end_port = u16::from_be_bytes([rest[6], rest[7]]);
                let start_addr = decode_addr(&rest[8..8 + addr_len]);
                let end_addr = decode_addr(&rest[8 + addr_len..8 + 2 * addr_len]);
                selectors.push(TrafficSelector {
                    protocol,
                    start_port,
                    end_port,
                    start_addr,
                    end_addr,
                });
            }
            TS_SECLABEL => {
                labels.push(SecLabel(rest[4..length].to_vec()));
            }
            other => {
                return Err(IkeError::Protocol(format!(
                    "unsupported traffic selector type {}",
                    other
                )));
            }
        }
        rest = &rest[length..];
    }
    Ok(TsPayload {
        initiator,
        selectors,
        labels,
    })
}

fn decode_addr(bytes: &[u8]) -> IpAddr {
    if bytes.len() == 4 {
        IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(bytes);
        IpAddr::V6(Ipv6Addr::from(octets))
    }
}
