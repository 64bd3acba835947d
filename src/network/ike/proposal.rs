use serde::{Deserialize, Serialize};

use crate::network::ike::{KeMethod, ProtocolId, TransformType};

/// Well-known encryption transform IDs.
pub const ENCR_AES_CBC: u16 = 12;
pub const ENCR_AES_GCM_16: u16 = 20;
pub const ENCR_CHACHA20_POLY1305: u16 = 28;

/// Well-known integrity transform IDs.
pub const AUTH_HMAC_SHA1_96: u16 = 2;
pub const AUTH_HMAC_SHA2_256_128: u16 = 12;
pub const AUTH_HMAC_SHA2_384_192: u16 = 13;
pub const AUTH_HMAC_SHA2_512_256: u16 = 14;

/// Transform IDs at or above this value are private use.
const PRIVATE_USE_START: u16 = 1024;

/// A single algorithm selection within a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub ttype: TransformType,
    pub id: u16,
    /// KEY_LENGTH attribute in bits, for keyed ciphers.
    pub key_length: Option<u16>,
}

impl Transform {
    pub fn new(ttype: TransformType, id: u16) -> Self {
        Transform {
            ttype,
            id,
            key_length: None,
        }
    }

    pub fn with_key_length(ttype: TransformType, id: u16, bits: u16) -> Self {
        Transform {
            ttype,
            id,
            key_length: Some(bits),
        }
    }
}

/// A suite of transforms offered or accepted for one SA, with the sender's
/// SPI stamped on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub number: u8,
    pub protocol: ProtocolId,
    pub spi: u32,
    pub transforms: Vec<Transform>,
}

/// Flags steering responder-side proposal selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionFlags {
    /// Ignore key exchange transforms (IKE_AUTH piggyback has no KE).
    pub skip_ke: bool,
    /// Reject private-use transform IDs from the peer.
    pub skip_private: bool,
    /// Prefer the peer's transform order over our configured order.
    pub prefer_supplied: bool,
}

impl Proposal {
    pub fn new(protocol: ProtocolId) -> Self {
        Proposal {
            number: 1,
            protocol,
            spi: 0,
            transforms: Vec::new(),
        }
    }

    pub fn add_transform(&mut self, transform: Transform) {
        self.transforms.push(transform);
    }

    pub fn set_spi(&mut self, spi: u32) {
        self.spi = spi;
    }

    /// First algorithm of the given transform type, with its key length.
    pub fn get_algorithm(&self, ttype: TransformType) -> Option<(u16, Option<u16>)> {
        self.transforms
            .iter()
            .find(|t| t.ttype == ttype)
            .map(|t| (t.id, t.key_length))
    }

    pub fn has_transform(&self, ttype: TransformType, id: u16) -> bool {
        self.transforms.iter().any(|t| t.ttype == ttype && t.id == id)
    }

    /// Move the transform with the given id to the front of its type group.
    /// Returns false if the proposal does not contain it at all.
    pub fn promote_transform(&mut self, ttype: TransformType, id: u16) -> bool {
        let Some(pos) = self
            .transforms
            .iter()
            .position(|t| t.ttype == ttype && t.id == id)
        else {
            return false;
        };
        let promoted = self.transforms.remove(pos);
        let insert_at = self
            .transforms
            .iter()
            .position(|t| t.ttype == ttype)
            .unwrap_or(pos);
        self.transforms.insert(insert_at, promoted);
        true
    }

    /// Strip all key exchange transform types (initial and additional).
    pub fn strip_ke(&mut self) {
        self.transforms.retain(|t| {
            t.ttype != TransformType::KeyExchangeMethod
                && !matches!(t.ttype, TransformType::AdditionalKeyExchange(_))
        });
    }

    /// The distinct transform types present in this proposal, in order.
    fn transform_types(&self) -> Vec<TransformType> {
        let mut types = Vec::new();
        for t in &self.transforms {
            if !types.contains(&t.ttype) {
                types.push(t.ttype);
            }
        }
        types
    }

    fn ids_of(&self, ttype: TransformType) -> impl Iterator<Item = &Transform> {
        self.transforms.iter().filter(move |t| t.ttype == ttype)
    }

    /// Intersect with a peer proposal. A match needs the same protocol and a
    /// common algorithm for every transform type we configured (KE types
    /// skipped with `skip_ke`). The result keeps the peer's proposal number
    /// and SPI.
    pub fn matches(&self, supplied: &Proposal, flags: SelectionFlags) -> Option<Proposal> {
        if self.protocol != supplied.protocol {
            return None;
        }
        let mut chosen = Vec::new();
        for ttype in self.transform_types() {
            let is_ke = ttype == TransformType::KeyExchangeMethod
                || matches!(ttype, TransformType::AdditionalKeyExchange(_));
            if flags.skip_ke && is_ke {
                continue;
            }
            let (primary, secondary): (&Proposal, &Proposal) = if flags.prefer_supplied {
                (supplied, self)
            } else {
                (self, supplied)
            };
            let found = primary.ids_of(ttype).find(|cand| {
                if flags.skip_private && cand.id >= PRIVATE_USE_START {
                    return false;
                }
                secondary
                    .ids_of(ttype)
                    .any(|t| t.id == cand.id && t.key_length == cand.key_length)
            });
            match found {
                Some(t) => chosen.push(t.clone()),
                None => return None,
            }
        }
        Some(Proposal {
            number: supplied.number,
            protocol: self.protocol,
            spi: supplied.spi,
            transforms: chosen,
        })
    }
}

/// Pick the first configured proposal that matches any of the supplied ones,
/// in configured preference order.
pub fn select_proposal(
    configured: &[Proposal],
    supplied: &[Proposal],
    flags: SelectionFlags,
) -> Option<Proposal> {
    for ours in configured {
        for theirs in supplied {
            if let Some(proposal) = ours.matches(theirs, flags) {
                return Some(proposal);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esp_proposal(kes: &[u16]) -> Proposal {
        let mut p = Proposal::new(ProtocolId::Esp);
        p.add_transform(Transform::with_key_length(
            TransformType::Encryption,
            ENCR_AES_GCM_16,
            128,
        ));
        for ke in kes {
            p.add_transform(Transform::new(TransformType::KeyExchangeMethod, *ke));
        }
        p
    }

    #[test]
    fn test_get_algorithm_returns_first() {
        let p = esp_proposal(&[19, 20]);
        assert_eq!(
            p.get_algorithm(TransformType::KeyExchangeMethod),
            Some((19, None))
        );
        assert_eq!(p.get_algorithm(TransformType::Integrity), None);
    }

    #[test]
    fn test_promote_transform_moves_to_front_of_group() {
        let mut p = esp_proposal(&[19, 20, 31]);
        assert!(p.promote_transform(TransformType::KeyExchangeMethod, 31));
        assert_eq!(
            p.get_algorithm(TransformType::KeyExchangeMethod),
            Some((31, None))
        );
        // encryption transform stays in front of the KE group
        assert_eq!(p.transforms[0].ttype, TransformType::Encryption);
    }

    #[test]
    fn test_promote_transform_missing() {
        let mut p = esp_proposal(&[19]);
        assert!(!p.promote_transform(TransformType::KeyExchangeMethod, 20));
    }

    #[test]
    fn test_select_proposal_common_suite() {
        let configured = vec![esp_proposal(&[20])];
        let mut supplied = esp_proposal(&[19, 20]);
        supplied.spi = 0xdead;
        supplied.number = 3;
        let chosen = select_proposal(&configured, &[supplied], SelectionFlags::default()).unwrap();
        assert_eq!(chosen.spi, 0xdead);
        assert_eq!(chosen.number, 3);
        assert!(chosen.has_transform(TransformType::KeyExchangeMethod, 20));
        assert!(!chosen.has_transform(TransformType::KeyExchangeMethod, 19));
    }

    #[test]
    fn test_select_proposal_no_common_ke() {
        let configured = vec![esp_proposal(&[20])];
        let supplied = esp_proposal(&[19]);
        assert!(select_proposal(&configured, &[supplied], SelectionFlags::default()).is_none());
    }

    #[test]
    fn test_select_proposal_skip_ke() {
        let configured = vec![esp_proposal(&[20])];
        let supplied = esp_proposal(&[]);
        let flags = SelectionFlags {
            skip_ke: true,
            ..Default::default()
        };
        let chosen = select_proposal(&configured, &[supplied], flags).unwrap();
        assert_eq!(chosen.get_algorithm(TransformType::KeyExchangeMethod), None);
    }

    #[test]
    fn test_select_proposal_skip_private() {
        let mut configured = esp_proposal(&[]);
        configured.add_transform(Transform::new(TransformType::KeyExchangeMethod, 1025));
        configured.add_transform(Transform::new(TransformType::KeyExchangeMethod, 19));
        let supplied = esp_proposal(&[1025, 19]);
        let flags = SelectionFlags {
            skip_private: true,
            ..Default::default()
        };
        let chosen = select_proposal(&[configured], &[supplied], flags).unwrap();
        assert_eq!(
            chosen.get_algorithm(TransformType::KeyExchangeMethod),
            Some((19, None))
        );
    }

    #[test]
    fn test_select_proposal_prefer_supplied_order() {
        let configured = vec![esp_proposal(&[19, 20])];
        let supplied = esp_proposal(&[20, 19]);
        let flags = SelectionFlags {
            prefer_supplied: true,
            ..Default::default()
        };
        let chosen = select_proposal(&configured, &[supplied], flags).unwrap();
        assert_eq!(
            chosen.get_algorithm(TransformType::KeyExchangeMethod),
            Some((20, None))
        );
    }

    #[test]
    fn test_strip_ke_removes_additional_exchanges() {
        let mut p = esp_proposal(&[19]);
        p.add_transform(Transform::new(TransformType::AdditionalKeyExchange(1), 36));
        p.strip_ke();
        assert_eq!(p.get_algorithm(TransformType::KeyExchangeMethod), None);
        assert_eq!(p.get_algorithm(TransformType::AdditionalKeyExchange(1)), None);
        assert!(p.get_algorithm(TransformType::Encryption).is_some());
    }

    #[test]
    fn test_key_length_must_match() {
        let mut ours = Proposal::new(ProtocolId::Esp);
        ours.add_transform(Transform::with_key_length(
            TransformType::Encryption,
            ENCR_AES_GCM_16,
            256,
        ));
        let mut theirs = Proposal::new(ProtocolId::Esp);
        theirs.add_transform(Transform::with_key_length(
            TransformType::Encryption,
            ENCR_AES_GCM_16,
            128,
        ));
        assert!(ours.matches(&theirs, SelectionFlags::default()).is_none());
    }
}
