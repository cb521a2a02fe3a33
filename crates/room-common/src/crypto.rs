//! Signing helpers for room alias confirmations plus clock utilities.
//!
//! An alias registration is confirmed by the user signing
//! `=room-alias-registration:<room>:<user>:<alias>` with their feed key.
//! Signatures travel as base64 with a `.sig.ed25519` suffix.

use crate::FeedRef;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

/// Suffix appended to base64 encoded ed25519 signatures.
pub const SIGNATURE_SUFFIX: &str = ".sig.ed25519";

const ALIAS_CONFIRMATION_PREFIX: &str = "=room-alias-registration:";

/// Errors decoding a transported signature.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureDecodeError {
    /// The `.sig.ed25519` suffix is missing.
    #[error("signature does not have the expected suffix")]
    MissingSuffix,
    /// The body is not valid base64.
    #[error("bad signature encoding")]
    Base64,
    /// The decoded signature is not 64 bytes long.
    #[error("signature must be 64 bytes, got {0}")]
    WrongLength(usize),
}

/// Build the exact byte sequence a user signs to claim `alias` on `room`.
///
/// # Examples
///
/// ```
/// use room_common::{crypto, FeedRef};
///
/// let room = FeedRef::ed25519([1u8; 32]);
/// let user = FeedRef::ed25519([2u8; 32]);
/// let msg = crypto::alias_confirmation(&room, &user, "bob");
/// assert!(msg.starts_with(b"=room-alias-registration:@"));
/// assert!(msg.ends_with(b".ed25519:bob"));
/// ```
#[must_use]
pub fn alias_confirmation(room: &FeedRef, user: &FeedRef, alias: &str) -> Vec<u8> {
    format!("{ALIAS_CONFIRMATION_PREFIX}{room}:{user}:{alias}").into_bytes()
}

/// Sign an alias confirmation with the user's key.
#[must_use]
pub fn sign_alias(signing_key: &SigningKey, room: &FeedRef, alias: &str) -> [u8; 64] {
    let user = FeedRef::ed25519(signing_key.verifying_key().to_bytes());
    signing_key
        .sign(&alias_confirmation(room, &user, alias))
        .to_bytes()
}

/// Verify an alias confirmation signature against `user`'s public key.
///
/// Returns `false` for non-ed25519 feeds and for keys that are not valid
/// curve points.
///
/// # Examples
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use room_common::{crypto, FeedRef};
///
/// let key = SigningKey::from_bytes(&[5u8; 32]);
/// let user = FeedRef::ed25519(key.verifying_key().to_bytes());
/// let room = FeedRef::ed25519([9u8; 32]);
/// let sig = crypto::sign_alias(&key, &room, "alice");
/// assert!(crypto::verify_alias(&room, &user, "alice", &sig));
/// assert!(!crypto::verify_alias(&room, &user, "mallory", &sig));
/// ```
#[must_use]
pub fn verify_alias(room: &FeedRef, user: &FeedRef, alias: &str, signature: &[u8; 64]) -> bool {
    if user.algo() != crate::FeedAlgo::Ed25519 {
        return false;
    }
    let Ok(verifying_key) = VerifyingKey::from_bytes(user.key()) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify(&alias_confirmation(room, user, alias), &sig)
        .is_ok()
}

/// Encode a signature for transport (`<base64>.sig.ed25519`).
#[must_use]
pub fn encode_signature(signature: &[u8; 64]) -> String {
    format!("{}{SIGNATURE_SUFFIX}", STANDARD.encode(signature))
}

/// Decode a transported signature.
///
/// # Errors
///
/// Returns [`SignatureDecodeError`] when the suffix is missing, the body is
/// not base64 or it does not hold exactly 64 bytes.
pub fn decode_signature(encoded: &str) -> Result<[u8; 64], SignatureDecodeError> {
    let body = encoded
        .strip_suffix(SIGNATURE_SUFFIX)
        .ok_or(SignatureDecodeError::MissingSuffix)?;
    let bytes = STANDARD
        .decode(body)
        .map_err(|_| SignatureDecodeError::Base64)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureDecodeError::WrongLength(bytes.len()))
}

/// Microseconds since the Unix epoch, or 0 if the clock is before it.
#[must_use]
pub fn unix_now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
#[must_use]
pub fn unix_now_millis() -> u64 {
    unix_now_micros() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_key() -> SigningKey {
        SigningKey::from_bytes(&[0x42u8; 32])
    }

    #[test]
    fn confirmation_message_layout() {
        let room = FeedRef::ed25519([1u8; 32]);
        let user = FeedRef::ed25519([2u8; 32]);
        let msg = String::from_utf8(alias_confirmation(&room, &user, "bob")).unwrap();
        assert_eq!(msg, format!("=room-alias-registration:{room}:{user}:bob"));
    }

    #[test]
    fn signature_is_bound_to_room() {
        let key = user_key();
        let user = FeedRef::ed25519(key.verifying_key().to_bytes());
        let room = FeedRef::ed25519([1u8; 32]);
        let other_room = FeedRef::ed25519([3u8; 32]);
        let sig = sign_alias(&key, &room, "bob");
        assert!(verify_alias(&room, &user, "bob", &sig));
        assert!(!verify_alias(&other_room, &user, "bob", &sig));
    }

    #[test]
    fn signature_is_bound_to_user() {
        let key = user_key();
        let room = FeedRef::ed25519([1u8; 32]);
        let imposter = FeedRef::ed25519(SigningKey::from_bytes(&[7u8; 32]).verifying_key().to_bytes());
        let sig = sign_alias(&key, &room, "bob");
        assert!(!verify_alias(&room, &imposter, "bob", &sig));
    }

    #[test]
    fn flipped_bit_fails_verification() {
        let key = user_key();
        let user = FeedRef::ed25519(key.verifying_key().to_bytes());
        let room = FeedRef::ed25519([1u8; 32]);
        let mut sig = sign_alias(&key, &room, "bob");
        sig[10] ^= 0x01;
        assert!(!verify_alias(&room, &user, "bob", &sig));
    }

    #[test]
    fn transport_encoding_round_trips() {
        let sig = [0x11u8; 64];
        let encoded = encode_signature(&sig);
        assert!(encoded.ends_with(".sig.ed25519"));
        assert_eq!(decode_signature(&encoded), Ok(sig));
    }

    #[test]
    fn decode_requires_suffix() {
        let encoded = STANDARD.encode([0u8; 64]);
        assert_eq!(
            decode_signature(&encoded),
            Err(SignatureDecodeError::MissingSuffix)
        );
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert_eq!(
            decode_signature("!!!.sig.ed25519"),
            Err(SignatureDecodeError::Base64)
        );
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let encoded = format!("{}{SIGNATURE_SUFFIX}", STANDARD.encode([0u8; 32]));
        assert_eq!(
            decode_signature(&encoded),
            Err(SignatureDecodeError::WrongLength(32))
        );
    }

    #[test]
    fn clock_is_after_2023() {
        assert!(unix_now_micros() > 1_700_000_000_000_000);
        assert!(unix_now_millis() > 1_700_000_000_000);
    }
}
