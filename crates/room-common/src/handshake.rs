//! Secret handshake: four-message mutual authentication over a raw stream.
//!
//! Both sides prove knowledge of the network capability, exchange ephemeral
//! x25519 keys and sign the transcript with their long-term ed25519 keys.
//! The outcome holds the remote's verified identity and the key material for
//! the two boxstream directions.
//!
//! Messages on the wire:
//!
//! 1. client hello: `hmac(cap, a_p) ‖ a_p` (64 bytes)
//! 2. server hello: `hmac(cap, b_p) ‖ b_p` (64 bytes)
//! 3. client auth: `box(sig_A ‖ A_p)` keyed by `sha256(cap ‖ ab ‖ aB)` (112 bytes)
//! 4. server accept: `box(sig_B)` keyed by `sha256(cap ‖ ab ‖ aB ‖ Ab)` (80 bytes)

use crate::boxstream::{open_detached, seal_detached, BoxKeys, NONCE_LEN, TAG_LEN};
use crate::{FeedRef, Pubkey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use x25519_dalek::{PublicKey as CurvePublic, StaticSecret};

type HmacSha512 = Hmac<Sha512>;

/// Length of both hello messages.
pub const HELLO_LEN: usize = 64;
/// Length of the client authentication message.
pub const CLIENT_AUTH_LEN: usize = TAG_LEN + 64 + 32;
/// Length of the server accept message.
pub const SERVER_ACCEPT_LEN: usize = TAG_LEN + 64;

const ZERO_NONCE: [u8; NONCE_LEN] = [0u8; NONCE_LEN];

/// Errors raised while performing the handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer failed one of the checks. The reason is for local logs only.
    #[error("handshake rejected: {0}")]
    Rejected(&'static str),
    /// The transport failed or closed mid-handshake.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// A completed handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// The remote's long-term key, as proven during the handshake.
    pub remote: FeedRef,
    /// Keys and nonces for the boxstream that follows.
    pub keys: BoxKeys,
}

struct Ephemeral {
    secret: StaticSecret,
    public: [u8; 32],
}

impl Ephemeral {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = CurvePublic::from(&secret).to_bytes();
        Self { secret, public }
    }

    fn agree(&self, remote: &[u8; 32]) -> Result<[u8; 32], HandshakeError> {
        agree(&self.secret, &CurvePublic::from(*remote))
    }
}

/// Diffie-Hellman that refuses low-order remote points.
fn agree(secret: &StaticSecret, remote: &CurvePublic) -> Result<[u8; 32], HandshakeError> {
    let shared = secret.diffie_hellman(remote);
    if !shared.was_contributory() {
        return Err(HandshakeError::Rejected("key exchange gave a low-order secret"));
    }
    Ok(shared.to_bytes())
}

fn cap_mac(cap: &[u8; 32], msg: &[u8]) -> Result<HmacSha512, HandshakeError> {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(cap)
        .map_err(|_| HandshakeError::Rejected("network capability is not a usable key"))?;
    mac.update(msg);
    Ok(mac)
}

fn auth_tag(cap: &[u8; 32], msg: &[u8]) -> Result<[u8; 32], HandshakeError> {
    let full = cap_mac(cap, msg)?.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&full[..32]);
    Ok(out)
}

fn verify_auth_tag(cap: &[u8; 32], msg: &[u8], tag: &[u8]) -> Result<bool, HandshakeError> {
    Ok(cap_mac(cap, msg)?.verify_truncated_left(tag).is_ok())
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn curve_secret(signing_key: &SigningKey) -> StaticSecret {
    StaticSecret::from(signing_key.to_scalar_bytes())
}

fn curve_public(ed_public: &Pubkey) -> Result<CurvePublic, HandshakeError> {
    let vk = VerifyingKey::from_bytes(ed_public)
        .map_err(|_| HandshakeError::Rejected("long-term key is not a valid point"))?;
    Ok(CurvePublic::from(vk.to_montgomery().to_bytes()))
}

fn hello(
    cap: &[u8; 32],
    ephemeral_public: &[u8; 32],
) -> Result<[u8; HELLO_LEN], HandshakeError> {
    let mut msg = [0u8; HELLO_LEN];
    msg[..32].copy_from_slice(&auth_tag(cap, ephemeral_public)?);
    msg[32..].copy_from_slice(ephemeral_public);
    Ok(msg)
}

fn check_hello(cap: &[u8; 32], msg: &[u8; HELLO_LEN]) -> Result<[u8; 32], HandshakeError> {
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&msg[32..]);
    if verify_auth_tag(cap, &ephemeral, &msg[..32])? {
        Ok(ephemeral)
    } else {
        Err(HandshakeError::Rejected("hello is not tagged with our network capability"))
    }
}

fn derive_keys(
    cap: &[u8; 32],
    secrets: [&[u8; 32]; 3],
    local_public: &Pubkey,
    remote_public: &Pubkey,
    local_ephemeral: &[u8; 32],
    remote_ephemeral: &[u8; 32],
) -> Result<BoxKeys, HandshakeError> {
    let [ab, a_b, ab_long] = secrets;
    let shared = sha256(&[&sha256(&[cap, ab, a_b, ab_long])]);
    let mut encrypt_nonce = [0u8; NONCE_LEN];
    encrypt_nonce.copy_from_slice(&auth_tag(cap, remote_ephemeral)?[..NONCE_LEN]);
    let mut decrypt_nonce = [0u8; NONCE_LEN];
    decrypt_nonce.copy_from_slice(&auth_tag(cap, local_ephemeral)?[..NONCE_LEN]);
    Ok(BoxKeys {
        encrypt_key: sha256(&[&shared, remote_public]),
        encrypt_nonce,
        decrypt_key: sha256(&[&shared, local_public]),
        decrypt_nonce,
    })
}

/// Run the server side of the handshake.
///
/// # Errors
///
/// Returns [`HandshakeError::Rejected`] when the client uses another network
/// capability or fails authentication, and [`HandshakeError::Transport`] when
/// the stream breaks. Nothing is written back to the client after a
/// rejection.
pub async fn server_handshake<S>(
    stream: &mut S,
    cap: &[u8; 32],
    local: &SigningKey,
) -> Result<HandshakeOutcome, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local_public = local.verifying_key().to_bytes();
    let ephemeral = Ephemeral::generate();

    let mut client_hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut client_hello).await?;
    let client_ephemeral = check_hello(cap, &client_hello)?;

    stream.write_all(&hello(cap, &ephemeral.public)?).await?;
    stream.flush().await?;

    let shared_ab = ephemeral.agree(&client_ephemeral)?;
    let shared_a_b = agree(&curve_secret(local), &CurvePublic::from(client_ephemeral))?;

    let mut auth = [0u8; CLIENT_AUTH_LEN];
    stream.read_exact(&mut auth).await?;
    let auth_key = sha256(&[cap, &shared_ab, &shared_a_b]);
    let mut body = auth[TAG_LEN..].to_vec();
    open_detached(&auth_key, &ZERO_NONCE, &auth[..TAG_LEN], &mut body)
        .map_err(|_| HandshakeError::Rejected("client auth did not decrypt"))?;

    let mut sig_a = [0u8; 64];
    sig_a.copy_from_slice(&body[..64]);
    let mut client_public = [0u8; 32];
    client_public.copy_from_slice(&body[64..96]);

    let client_vk = VerifyingKey::from_bytes(&client_public)
        .map_err(|_| HandshakeError::Rejected("client key is not a valid point"))?;
    let ab_hash = sha256(&[&shared_ab]);
    let signed = [cap.as_slice(), &local_public, &ab_hash].concat();
    client_vk
        .verify(&signed, &Signature::from_bytes(&sig_a))
        .map_err(|_| HandshakeError::Rejected("client signature invalid"))?;

    let shared_ab_long = agree(&ephemeral.secret, &curve_public(&client_public)?)?;

    let accept_msg = [cap.as_slice(), &sig_a, &client_public, &ab_hash].concat();
    let mut sig_b = local.sign(&accept_msg).to_bytes().to_vec();
    let accept_key = sha256(&[cap, &shared_ab, &shared_a_b, &shared_ab_long]);
    let tag = seal_detached(&accept_key, &ZERO_NONCE, &mut sig_b)
        .map_err(|_| HandshakeError::Rejected("could not seal accept"))?;
    stream.write_all(&tag).await?;
    stream.write_all(&sig_b).await?;
    stream.flush().await?;

    let remote = FeedRef::ed25519(client_public);
    debug!(remote = %remote.short(), "secret handshake completed");
    Ok(HandshakeOutcome {
        remote,
        keys: derive_keys(
            cap,
            [&shared_ab, &shared_a_b, &shared_ab_long],
            &local_public,
            &client_public,
            &ephemeral.public,
            &client_ephemeral,
        )?,
    })
}

/// Run the client side of the handshake against a server whose long-term
/// key is known in advance.
///
/// # Errors
///
/// Returns [`HandshakeError::Rejected`] if the server cannot prove it holds
/// `server` or speaks another capability, and [`HandshakeError::Transport`]
/// when the server hangs up (which is how servers reject clients).
pub async fn client_handshake<S>(
    stream: &mut S,
    cap: &[u8; 32],
    local: &SigningKey,
    server: &Pubkey,
) -> Result<HandshakeOutcome, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local_public = local.verifying_key().to_bytes();
    let ephemeral = Ephemeral::generate();

    stream.write_all(&hello(cap, &ephemeral.public)?).await?;
    stream.flush().await?;

    let mut server_hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut server_hello).await?;
    let server_ephemeral = check_hello(cap, &server_hello)?;

    let shared_ab = ephemeral.agree(&server_ephemeral)?;
    let shared_a_b = agree(&ephemeral.secret, &curve_public(server)?)?;

    let ab_hash = sha256(&[&shared_ab]);
    let sig_a = local
        .sign(&[cap.as_slice(), server, &ab_hash].concat())
        .to_bytes();
    let mut auth_body = [sig_a.as_slice(), &local_public].concat();
    let auth_key = sha256(&[cap, &shared_ab, &shared_a_b]);
    let tag = seal_detached(&auth_key, &ZERO_NONCE, &mut auth_body)
        .map_err(|_| HandshakeError::Rejected("could not seal auth"))?;
    stream.write_all(&tag).await?;
    stream.write_all(&auth_body).await?;
    stream.flush().await?;

    let shared_ab_long = agree(&curve_secret(local), &CurvePublic::from(server_ephemeral))?;

    let mut accept = [0u8; SERVER_ACCEPT_LEN];
    stream.read_exact(&mut accept).await?;
    let accept_key = sha256(&[cap, &shared_ab, &shared_a_b, &shared_ab_long]);
    let mut sig_b = accept[TAG_LEN..].to_vec();
    open_detached(&accept_key, &ZERO_NONCE, &accept[..TAG_LEN], &mut sig_b)
        .map_err(|_| HandshakeError::Rejected("server accept did not decrypt"))?;
    let mut sig_b_bytes = [0u8; 64];
    sig_b_bytes.copy_from_slice(&sig_b);

    let server_vk = VerifyingKey::from_bytes(server)
        .map_err(|_| HandshakeError::Rejected("server key is not a valid point"))?;
    let expected = [cap.as_slice(), &sig_a, &local_public, &ab_hash].concat();
    server_vk
        .verify(&expected, &Signature::from_bytes(&sig_b_bytes))
        .map_err(|_| HandshakeError::Rejected("server signature invalid"))?;

    Ok(HandshakeOutcome {
        remote: FeedRef::ed25519(*server),
        keys: derive_keys(
            cap,
            [&shared_ab, &shared_a_b, &shared_ab_long],
            &local_public,
            server,
            &ephemeral.public,
            &server_ephemeral,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_NETWORK_CAP;
    use std::time::Duration;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    async fn run_pair(
        server_cap: [u8; 32],
        client_cap: [u8; 32],
        server_key: SigningKey,
        client_key: SigningKey,
        claimed_server: Pubkey,
    ) -> (
        Result<HandshakeOutcome, HandshakeError>,
        Result<HandshakeOutcome, HandshakeError>,
    ) {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let server = async move {
            let res = server_handshake(&mut a, &server_cap, &server_key).await;
            drop(a);
            res
        };
        let client = async move {
            let res = client_handshake(&mut b, &client_cap, &client_key, &claimed_server).await;
            drop(b);
            res
        };
        tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(server, client) })
            .await
            .expect("handshake must not hang")
    }

    #[tokio::test]
    async fn both_sides_agree_on_keys() {
        let server_key = key(1);
        let client_key = key(2);
        let server_pub = server_key.verifying_key().to_bytes();
        let client_pub = client_key.verifying_key().to_bytes();

        let (server, client) = run_pair(
            DEFAULT_NETWORK_CAP,
            DEFAULT_NETWORK_CAP,
            server_key,
            client_key,
            server_pub,
        )
        .await;
        let server = server.unwrap();
        let client = client.unwrap();

        assert_eq!(server.remote, FeedRef::ed25519(client_pub));
        assert_eq!(client.remote, FeedRef::ed25519(server_pub));
        assert_eq!(server.keys.encrypt_key, client.keys.decrypt_key);
        assert_eq!(server.keys.encrypt_nonce, client.keys.decrypt_nonce);
        assert_eq!(server.keys.decrypt_key, client.keys.encrypt_key);
        assert_eq!(server.keys.decrypt_nonce, client.keys.encrypt_nonce);
        assert_ne!(server.keys.encrypt_key, server.keys.decrypt_key);
    }

    #[tokio::test]
    async fn capability_mismatch_is_rejected() {
        let server_key = key(1);
        let server_pub = server_key.verifying_key().to_bytes();
        let (server, client) = run_pair(
            DEFAULT_NETWORK_CAP,
            [0x55u8; 32],
            server_key,
            key(2),
            server_pub,
        )
        .await;

        assert!(matches!(server, Err(HandshakeError::Rejected(_))));
        assert!(matches!(client, Err(HandshakeError::Transport(_))));
    }

    #[tokio::test]
    async fn client_dialing_wrong_server_key_is_rejected() {
        let (server, client) = run_pair(
            DEFAULT_NETWORK_CAP,
            DEFAULT_NETWORK_CAP,
            key(1),
            key(2),
            key(3).verifying_key().to_bytes(),
        )
        .await;

        assert!(matches!(server, Err(HandshakeError::Rejected(_))));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn truncated_hello_is_a_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(256);
        b.write_all(&[0u8; 10]).await.unwrap();
        drop(b);
        let res = server_handshake(&mut a, &DEFAULT_NETWORK_CAP, &key(1)).await;
        assert!(matches!(res, Err(HandshakeError::Transport(_))));
    }

    #[test]
    fn auth_tag_is_truncated_hmac_sha512() {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(&DEFAULT_NETWORK_CAP).unwrap();
        mac.update(b"ephemeral");
        let full = mac.finalize().into_bytes();
        let tag = auth_tag(&DEFAULT_NETWORK_CAP, b"ephemeral").unwrap();
        assert_eq!(tag.as_slice(), &full[..32]);
        assert!(verify_auth_tag(&DEFAULT_NETWORK_CAP, b"ephemeral", &tag).unwrap());
        assert!(!verify_auth_tag(&DEFAULT_NETWORK_CAP, b"other", &tag).unwrap());
    }

    #[tokio::test]
    async fn low_order_ephemeral_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let zero_hello = hello(&DEFAULT_NETWORK_CAP, &[0u8; 32]).unwrap();
        b.write_all(&zero_hello).await.unwrap();
        let res = server_handshake(&mut a, &DEFAULT_NETWORK_CAP, &key(1)).await;
        assert!(matches!(
            res,
            Err(HandshakeError::Rejected("key exchange gave a low-order secret"))
        ));
    }

    #[test]
    fn hello_tag_depends_on_capability() {
        let eph = [7u8; 32];
        let msg = hello(&DEFAULT_NETWORK_CAP, &eph).unwrap();
        assert_eq!(check_hello(&DEFAULT_NETWORK_CAP, &msg).unwrap(), eph);
        assert!(check_hello(&[0u8; 32], &msg).is_err());
    }
}
