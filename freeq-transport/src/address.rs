//! Node addresses and the signed-display-name identity check.
//!
//! A room-service user id embeds a hex-encoded [`Address`] in its
//! local part; that user's display name is expected to be a signature
//! over the user id, recoverable to the same address. Users that fail
//! this check are treated as if they don't exist (§3, §4.4 of
//! SPEC_FULL.md).

use std::fmt;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

/// 20-byte binary node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    /// Lowercase hex, no checksum casing — used for directory lookups.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// EIP-55-style checksummed hex: each hex digit is upper-cased iff
    /// the corresponding nibble of keccak256(lowercase hex) is >= 8.
    /// Used in logs, matching the source system's `to_checksum_address`.
    pub fn to_checksum_hex(&self) -> String {
        let lower = self.to_hex();
        let mut hasher = Keccak256::new();
        hasher.update(lower.as_bytes());
        let digest = hasher.finalize();

        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, ch) in lower.chars().enumerate() {
            if ch.is_ascii_digit() {
                out.push(ch);
                continue;
            }
            let byte = digest[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            if nibble >= 8 {
                out.push(ch.to_ascii_uppercase());
            } else {
                out.push(ch);
            }
        }
        out
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_checksum_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_checksum_hex())
    }
}

/// Opaque room-service user identifier, e.g. `@peer_<hex addr>:server`.
/// The local part before `:` embeds the address; see [`parse_embedded_address`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerUserId(pub String);

impl fmt::Debug for PeerUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PeerUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerUserId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Extracts the 20-byte address embedded in the local part of the
    /// user id. Local part format: `@<prefix>_<40-hex-chars>(.<suffix>)?`.
    pub fn parse_embedded_address(&self) -> Option<Address> {
        let local = self.0.strip_prefix('@')?;
        let local = local.split(':').next()?;
        let hex_candidate = local.rsplit('_').next()?;
        let hex_candidate = hex_candidate.split('.').next()?;
        let bytes = hex::decode(hex_candidate).ok()?;
        Address::from_slice(&bytes)
    }
}

/// A room-service display name: hex-encoded recoverable ECDSA signature
/// over the UTF-8 bytes of the user id it belongs to.
pub struct SignedDisplayName<'a> {
    pub user_id: &'a PeerUserId,
    pub display_name: &'a str,
}

impl<'a> SignedDisplayName<'a> {
    /// Validates the signature and returns the address it recovers to,
    /// iff that address matches the one embedded in the user id.
    pub fn verify(&self) -> Option<Address> {
        let embedded = self.user_id.parse_embedded_address()?;
        let sig_bytes = hex::decode(self.display_name.trim_start_matches("0x")).ok()?;
        if sig_bytes.len() != 65 {
            return None;
        }
        let signature = Signature::from_slice(&sig_bytes[..64]).ok()?;
        let recovery_id = RecoveryId::from_byte(sig_bytes[64] % 2)?;
        let recovered = VerifyingKey::recover_from_msg(
            self.user_id.0.as_bytes(),
            &signature,
            recovery_id,
        )
        .ok()?;
        let recovered_address = address_from_verifying_key(&recovered);
        if recovered_address == embedded {
            Some(embedded)
        } else {
            None
        }
    }
}

/// Derives a 20-byte address from a public key the same way the
/// checksum scheme this crate's addressing was modeled on does:
/// keccak256 of the uncompressed point (sans prefix byte), last 20 bytes.
pub fn address_from_verifying_key(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let mut hasher = Keccak256::new();
    hasher.update(&point.as_bytes()[1..]);
    let digest = hasher.finalize();
    Address::from_slice(&digest[12..]).expect("keccak256 output is 32 bytes, tail is 20")
}

/// Deterministic tie-break for room-creation responsibility: the
/// lexicographically smaller address creates the room.
pub fn my_place_or_yours(our_address: Address, partner_address: Address) -> Address {
    if our_address.0 <= partner_address.0 {
        our_address
    } else {
        partner_address
    }
}

/// Generates a fresh signing key and the matching `(address, user_id,
/// signed_display_name)` triple, for tests (both this crate's own and
/// the integration tests under `tests/`) that need a room-service
/// identity whose display name actually verifies.
pub fn test_signed_identity(server: &str) -> (Address, PeerUserId, String) {
    use k256::ecdsa::{signature::Signer, RecoveryId, Signature, SigningKey, VerifyingKey};
    use rand::rngs::OsRng;

    let signing_key = SigningKey::random(&mut OsRng);
    let verifying_key = VerifyingKey::from(&signing_key);
    let address = address_from_verifying_key(&verifying_key);
    let user_id = PeerUserId::new(format!("@peer_{}:{}", address.to_hex(), server));
    let (signature, recovery_id): (Signature, RecoveryId) =
        signing_key.sign_recoverable(user_id.0.as_bytes()).expect("recoverable signing never fails here");
    let mut sig_bytes = signature.to_bytes().to_vec();
    sig_bytes.push(recovery_id.to_byte());
    (address, user_id, hex::encode(sig_bytes))
}
