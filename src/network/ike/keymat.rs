use ring::rand::SecureRandom;
use ring::{agreement, hmac, rand};

use crate::network::ike::proposal::{
    Proposal, AUTH_HMAC_SHA1_96, AUTH_HMAC_SHA2_256_128, AUTH_HMAC_SHA2_384_192,
    AUTH_HMAC_SHA2_512_256, ENCR_AES_CBC, ENCR_AES_GCM_16, ENCR_CHACHA20_POLY1305,
};
use crate::network::ike::{IkeError, KeMethod, Nonce, SharedSecret, TransformType, NONCE_SIZE};

/// One Diffie-Hellman-style key exchange: our ephemeral pair plus the shared
/// secret once the peer's public key has been applied.
pub trait KeyExchange: Send {
    fn method(&self) -> KeMethod;
    fn public_key(&self) -> &[u8];
    fn set_public_key(&mut self, peer: &[u8]) -> Result<(), IkeError>;
    fn shared_secret(&self) -> Result<SharedSecret, IkeError>;
}

/// Key material services an IKE_SA offers to its CHILD_SA tasks.
pub trait ChildKeymat: Send + Sync {
    fn create_nonce(&self) -> Result<Nonce, IkeError>;
    fn create_ke(&self, method: KeMethod) -> Result<Box<dyn KeyExchange>, IkeError>;
    fn derive_child_keys(
        &self,
        proposal: &Proposal,
        kes: &[Box<dyn KeyExchange>],
        nonce_i: &Nonce,
        nonce_r: &Nonce,
    ) -> Result<ChildKeys, IkeError>;
}

/// The four keying material chunks of a CHILD_SA, in i/r order.
pub struct ChildKeys {
    pub encr_i: SharedSecret,
    pub integ_i: SharedSecret,
    pub encr_r: SharedSecret,
    pub integ_r: SharedSecret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl PrfAlgorithm {
    fn hmac(self) -> hmac::Algorithm {
        match self {
            PrfAlgorithm::HmacSha256 => hmac::HMAC_SHA256,
            PrfAlgorithm::HmacSha384 => hmac::HMAC_SHA384,
            PrfAlgorithm::HmacSha512 => hmac::HMAC_SHA512,
        }
    }
}

/// ECDH key exchange backed by ring's agreement API.
pub struct EcdhKeyExchange {
    method: KeMethod,
    private: Option<agreement::EphemeralPrivateKey>,
    public: Vec<u8>,
    secret: Option<SharedSecret>,
}

impl EcdhKeyExchange {
    pub fn new(method: KeMethod) -> Result<Self, IkeError> {
        let alg = match method {
            KeMethod::Ecp256 => &agreement::ECDH_P256,
            KeMethod::Ecp384 => &agreement::ECDH_P384,
            KeMethod::Curve25519 => &agreement::X25519,
            other => {
                return Err(IkeError::Crypto(format!(
                    "key exchange method {} not supported",
                    other
                )))
            }
        };
        let rng = rand::SystemRandom::new();
        let private = agreement::EphemeralPrivateKey::generate(alg, &rng)
            .map_err(|_| IkeError::Crypto("ephemeral key generation failed".to_string()))?;
        let public = private
            .compute_public_key()
            .map_err(|_| IkeError::Crypto("public key computation failed".to_string()))?
            .as_ref()
            .to_vec();
        Ok(EcdhKeyExchange {
            method,
            private: Some(private),
            public,
            secret: None,
        })
    }
}

impl KeyExchange for EcdhKeyExchange {
    fn method(&self) -> KeMethod {
        self.method
    }

    fn public_key(&self) -> &[u8] {
        &self.public
    }

    fn set_public_key(&mut self, peer: &[u8]) -> Result<(), IkeError> {
        let private = self
            .private
            .take()
            .ok_or_else(|| IkeError::Crypto("peer public key already applied".to_string()))?;
        let alg = private.algorithm();
        let peer_key = agreement::UnparsedPublicKey::new(alg, peer.to_vec());
        let secret =
            agreement::agree_ephemeral(private, &peer_key, |material| {
                SharedSecret(material.to_vec())
            })
            .map_err(|_| IkeError::Crypto("key agreement failed".to_string()))?;
        self.secret = Some(secret);
        Ok(())
    }

    fn shared_secret(&self) -> Result<SharedSecret, IkeError> {
        self.secret
            .clone()
            .ok_or_else(|| IkeError::Crypto("shared secret not yet computed".to_string()))
    }
}

/// Keymat bound to one IKE_SA: holds SK_d and the negotiated PRF.
pub struct IkeKeymat {
    sk_d: SharedSecret,
    prf: PrfAlgorithm,
}

impl IkeKeymat {
    pub fn new(sk_d: SharedSecret, prf: PrfAlgorithm) -> Self {
        IkeKeymat { sk_d, prf }
    }
}

impl ChildKeymat for IkeKeymat {
    fn create_nonce(&self) -> Result<Nonce, IkeError> {
        let rng = rand::SystemRandom::new();
        let mut nonce = vec![0u8; NONCE_SIZE];
        rng.fill(&mut nonce)
            .map_err(|e| IkeError::Crypto(format!("nonce generation failed: {:?}", e)))?;
        Ok(Nonce(nonce))
    }

    fn create_ke(&self, method: KeMethod) -> Result<Box<dyn KeyExchange>, IkeError> {
        Ok(Box::new(EcdhKeyExchange::new(method)?))
    }

    fn derive_child_keys(
        &self,
        proposal: &Proposal,
        kes: &[Box<dyn KeyExchange>],
        nonce_i: &Nonce,
        nonce_r: &Nonce,
    ) -> Result<ChildKeys, IkeError> {
        // KEYMAT = prf+(SK_d, [g^ir |] Ni | Nr), with the shared secrets of
        // all performed key exchanges concatenated in exchange order
        let mut seed = Vec::new();
        for ke in kes {
            seed.extend_from_slice(ke.shared_secret()?.as_bytes());
        }
        seed.extend_from_slice(nonce_i.as_bytes());
        seed.extend_from_slice(nonce_r.as_bytes());

        let (encr_len, integ_len) = key_sizes(proposal)?;
        let total = 2 * (encr_len + integ_len);
        let keymat = prf_plus(self.prf, self.sk_d.as_bytes(), &seed, total);
        let mut offset = 0;
        let mut chunk = |len: usize| {
            let out = SharedSecret(keymat.as_bytes()[offset..offset + len].to_vec());
            offset += len;
            out
        };
        Ok(ChildKeys {
            encr_i: chunk(encr_len),
            integ_i: chunk(integ_len),
            encr_r: chunk(encr_len),
            integ_r: chunk(integ_len),
        })
    }
}

/// Key sizes in bytes for the proposal's encryption and integrity transforms.
fn key_sizes(proposal: &Proposal) -> Result<(usize, usize), IkeError> {
    let (encr, key_length) = proposal
        .get_algorithm(TransformType::Encryption)
        .ok_or_else(|| IkeError::Protocol("proposal lacks encryption transform".to_string()))?;
    let encr_len = match encr {
        // AEAD ciphers carry extra salt bytes in their keying material
        ENCR_AES_GCM_16 => key_length.unwrap_or(128) as usize / 8 + 4,
        ENCR_CHACHA20_POLY1305 => 32 + 4,
        ENCR_AES_CBC => key_length.unwrap_or(128) as usize / 8,
        other => {
            return Err(IkeError::Protocol(format!(
                "unsupported encryption transform {}",
                other
            )))
        }
    };
    let integ_len = match proposal.get_algorithm(TransformType::Integrity) {
        None => 0,
        Some((AUTH_HMAC_SHA1_96, _)) => 20,
        Some((AUTH_HMAC_SHA2_256_128, _)) => 32,
        Some((AUTH_HMAC_SHA2_384_192, _)) => 48,
        Some((AUTH_HMAC_SHA2_512_256, _)) => 64,
        Some((other, _)) => {
            return Err(IkeError::Protocol(format!(
                "unsupported integrity transform {}",
                other
            )))
        }
    };
    Ok((encr_len, integ_len))
}

/// prf+ of RFC 7296 section 2.13: T1 = prf(K, S | 0x01),
/// Tn = prf(K, Tn-1 | S | n).
fn prf_plus(prf: PrfAlgorithm, key: &[u8], seed: &[u8], length: usize) -> SharedSecret {
    let key = hmac::Key::new(prf.hmac(), key);
    let mut out = Vec::with_capacity(length);
    let mut last: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while out.len() < length {
        let mut input = last.clone();
        input.extend_from_slice(seed);
        input.push(counter);
        last = hmac::sign(&key, &input).as_ref().to_vec();
        out.extend_from_slice(&last);
        counter = counter.wrapping_add(1);
    }
    out.truncate(length);
    SharedSecret(out)
}
