use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub mod bus;
pub mod child_cfg;
pub mod child_create;
pub mod child_sa;
pub mod ike_sa;
pub mod kernel;
pub mod keymat;
pub mod payload;
pub mod proposal;
pub mod scheduler;
pub mod session;
pub mod ts;

/// Nonce length we generate for CREATE_CHILD_SA exchanges.
pub const NONCE_SIZE: usize = 32;

/// Maximum number of additional key exchanges (RFC 9370 transform types 6..12).
pub const MAX_ADDITIONAL_KEY_EXCHANGES: usize = 7;

/// Maximum number of key exchanges, including the initial one.
pub const MAX_KEY_EXCHANGES: usize = MAX_ADDITIONAL_KEY_EXCHANGES + 1;

/// Seconds to wait before retrying a CHILD_SA after TEMPORARY_FAILURE.
pub const RETRY_INTERVAL: u64 = 15;

/// Jitter subtracted from the retry interval to avoid synchronized retries.
pub const RETRY_JITTER: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeType {
    IkeSaInit,
    IkeAuth,
    CreateChildSa,
    Informational,
    IkeFollowupKe,
    /// Message suppressed before sending, e.g. on duplicate detection.
    Undefined,
}

impl ExchangeType {
    pub fn to_u8(self) -> u8 {
        match self {
            ExchangeType::IkeSaInit => 34,
            ExchangeType::IkeAuth => 35,
            ExchangeType::CreateChildSa => 36,
            ExchangeType::Informational => 37,
            ExchangeType::IkeFollowupKe => 44,
            ExchangeType::Undefined => 255,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            44 => Some(ExchangeType::IkeFollowupKe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolId {
    Esp,
    Ah,
}

impl ProtocolId {
    pub fn to_u8(self) -> u8 {
        match self {
            ProtocolId::Esp => 3,
            ProtocolId::Ah => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            3 => Some(ProtocolId::Esp),
            2 => Some(ProtocolId::Ah),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpsecMode {
    #[default]
    Tunnel,
    Transport,
    Beet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpcompTransform {
    #[default]
    None,
    Deflate,
    Lzs,
    Lzjh,
}

impl IpcompTransform {
    pub fn to_u8(self) -> u8 {
        match self {
            IpcompTransform::None => 0,
            IpcompTransform::Deflate => 2,
            IpcompTransform::Lzs => 3,
            IpcompTransform::Lzjh => 4,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => IpcompTransform::Deflate,
            3 => IpcompTransform::Lzs,
            4 => IpcompTransform::Lzjh,
            _ => IpcompTransform::None,
        }
    }
}

/// IKEv2 transform types, including the additional key exchanges of RFC 9370.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformType {
    Encryption,
    Prf,
    Integrity,
    KeyExchangeMethod,
    ExtendedSequenceNumbers,
    AdditionalKeyExchange(u8),
}

impl TransformType {
    pub fn to_u8(self) -> u8 {
        match self {
            TransformType::Encryption => 1,
            TransformType::Prf => 2,
            TransformType::Integrity => 3,
            TransformType::KeyExchangeMethod => 4,
            TransformType::ExtendedSequenceNumbers => 5,
            TransformType::AdditionalKeyExchange(n) => 5 + n,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransformType::Encryption),
            2 => Some(TransformType::Prf),
            3 => Some(TransformType::Integrity),
            4 => Some(TransformType::KeyExchangeMethod),
            5 => Some(TransformType::ExtendedSequenceNumbers),
            6..=12 => Some(TransformType::AdditionalKeyExchange(value - 5)),
            _ => None,
        }
    }

    /// The seven ADDITIONAL_KEY_EXCHANGE_1..7 transform types in order.
    pub fn additional_key_exchanges() -> impl Iterator<Item = TransformType> {
        (1..=MAX_ADDITIONAL_KEY_EXCHANGES as u8).map(TransformType::AdditionalKeyExchange)
    }
}

/// Key exchange methods (IKEv2 Transform Type 4 IDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeMethod {
    #[default]
    None,
    Modp2048,
    Modp3072,
    Ecp256,
    Ecp384,
    Ecp521,
    Curve25519,
    MlKem512,
    MlKem768,
    MlKem1024,
    Other(u16),
}

impl KeMethod {
    pub fn to_u16(self) -> u16 {
        match self {
            KeMethod::None => 0,
            KeMethod::Modp2048 => 14,
            KeMethod::Modp3072 => 15,
            KeMethod::Ecp256 => 19,
            KeMethod::Ecp384 => 20,
            KeMethod::Ecp521 => 21,
            KeMethod::Curve25519 => 31,
            KeMethod::MlKem512 => 35,
            KeMethod::MlKem768 => 36,
            KeMethod::MlKem1024 => 37,
            KeMethod::Other(id) => id,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => KeMethod::None,
            14 => KeMethod::Modp2048,
            15 => KeMethod::Modp3072,
            19 => KeMethod::Ecp256,
            20 => KeMethod::Ecp384,
            21 => KeMethod::Ecp521,
            31 => KeMethod::Curve25519,
            35 => KeMethod::MlKem512,
            36 => KeMethod::MlKem768,
            37 => KeMethod::MlKem1024,
            id => KeMethod::Other(id),
        }
    }
}

impl std::fmt::Display for KeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeMethod::None => write!(f, "NONE"),
            KeMethod::Modp2048 => write!(f, "MODP_2048"),
            KeMethod::Modp3072 => write!(f, "MODP_3072"),
            KeMethod::Ecp256 => write!(f, "ECP_256"),
            KeMethod::Ecp384 => write!(f, "ECP_384"),
            KeMethod::Ecp521 => write!(f, "ECP_521"),
            KeMethod::Curve25519 => write!(f, "CURVE_25519"),
            KeMethod::MlKem512 => write!(f, "ML_KEM_512"),
            KeMethod::MlKem768 => write!(f, "ML_KEM_768"),
            KeMethod::MlKem1024 => write!(f, "ML_KEM_1024"),
            KeMethod::Other(id) => write!(f, "KE_{}", id),
        }
    }
}

/// Notify message types consumed or emitted by CHILD_SA negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyType {
    InvalidSyntax,
    NoProposalChosen,
    InvalidKePayload,
    SinglePairRequired,
    NoAdditionalSas,
    InternalAddressFailure,
    FailedCpRequired,
    TsUnacceptable,
    InvalidSelectors,
    TemporaryFailure,
    StateNotFound,
    IpcompSupported,
    UseTransportMode,
    EspTfcPaddingNotSupported,
    AdditionalKeyExchange,
    /// Private-use notify for BEET mode.
    UseBeetMode,
    Other(u16),
}

impl NotifyType {
    pub fn to_u16(self) -> u16 {
        match self {
            NotifyType::InvalidSyntax => 7,
            NotifyType::NoProposalChosen => 14,
            NotifyType::InvalidKePayload => 17,
            NotifyType::SinglePairRequired => 34,
            NotifyType::NoAdditionalSas => 35,
            NotifyType::InternalAddressFailure => 36,
            NotifyType::FailedCpRequired => 37,
            NotifyType::TsUnacceptable => 38,
            NotifyType::InvalidSelectors => 39,
            NotifyType::TemporaryFailure => 43,
            NotifyType::StateNotFound => 47,
            NotifyType::IpcompSupported => 16387,
            NotifyType::UseTransportMode => 16391,
            NotifyType::EspTfcPaddingNotSupported => 16394,
            NotifyType::AdditionalKeyExchange => 16441,
            NotifyType::UseBeetMode => 40961,
            NotifyType::Other(id) => id,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            7 => NotifyType::InvalidSyntax,
            14 => NotifyType::NoProposalChosen,
            17 => NotifyType::InvalidKePayload,
            34 => NotifyType::SinglePairRequired,
            35 => NotifyType::NoAdditionalSas,
            36 => NotifyType::InternalAddressFailure,
            37 => NotifyType::FailedCpRequired,
            38 => NotifyType::TsUnacceptable,
            39 => NotifyType::InvalidSelectors,
            43 => NotifyType::TemporaryFailure,
            47 => NotifyType::StateNotFound,
            16387 => NotifyType::IpcompSupported,
            16391 => NotifyType::UseTransportMode,
            16394 => NotifyType::EspTfcPaddingNotSupported,
            16441 => NotifyType::AdditionalKeyExchange,
            40961 => NotifyType::UseBeetMode,
            id => NotifyType::Other(id),
        }
    }

    /// Error notifies use the range below 16384; status notifies sit above.
    pub fn is_error(self) -> bool {
        self.to_u16() <= 16383
    }
}

/// Result of a task half-step. `NeedMore` suspends the task; it never
/// terminates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    NeedMore,
    Failed,
    NotFound,
    DestroyMe,
    InvalidState,
    NotSupported,
}

/// A nonce exchanged in IKE_SA_INIT or CREATE_CHILD_SA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce(pub Vec<u8>);

impl Nonce {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Opaque token linking the rounds of a multi-KE negotiation. The responder
/// issues it, the initiator echoes it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkToken(pub Vec<u8>);

impl LinkToken {
    pub fn random() -> Self {
        LinkToken(rand::random::<[u8; 8]>().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Constant-time comparison, the token travels with negotiation state.
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        ring::constant_time::verify_slices_are_equal(&self.0, other).is_ok()
    }
}

/// Secret byte string: a key exchange shared secret or derived key material.
/// Zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(pub Vec<u8>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret({} bytes)", self.0.len())
    }
}

/// 32-bit Security Parameter Index of an IPsec SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Spi(pub u32);

impl std::fmt::Display for Spi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// 16-bit Compression Parameter Index for IPComp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cpi(pub u16);

impl std::fmt::Display for Cpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IkeError {
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Kernel error: {0}")]
    Kernel(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_type_additional_ke_range() {
        assert_eq!(
            TransformType::from_u8(6),
            Some(TransformType::AdditionalKeyExchange(1))
        );
        assert_eq!(
            TransformType::from_u8(12),
            Some(TransformType::AdditionalKeyExchange(7))
        );
        assert_eq!(TransformType::AdditionalKeyExchange(7).to_u8(), 12);
        assert_eq!(TransformType::additional_key_exchanges().count(), 7);
    }

    #[test]
    fn test_ke_method_u16_round_trip() {
        for id in [0u16, 14, 19, 20, 31, 36, 1234] {
            assert_eq!(KeMethod::from_u16(id).to_u16(), id);
        }
    }

    #[test]
    fn test_notify_error_classification() {
        assert!(NotifyType::NoProposalChosen.is_error());
        assert!(NotifyType::TemporaryFailure.is_error());
        assert!(!NotifyType::IpcompSupported.is_error());
        assert!(!NotifyType::AdditionalKeyExchange.is_error());
    }

    #[test]
    fn test_link_token_constant_time_eq() {
        let link = LinkToken(vec![1, 2, 3, 4]);
        assert!(link.ct_eq(&[1, 2, 3, 4]));
        assert!(!link.ct_eq(&[1, 2, 3, 5]));
        assert!(!link.ct_eq(&[1, 2, 3]));
    }

    #[test]
    fn test_link_token_random_length() {
        assert_eq!(LinkToken::random().as_bytes().len(), 8);
    }
}
