//! Boxstream: the sealed frame layer that follows a secret handshake.
//!
//! Every message is a 34-byte sealed header (`body_len: u16 ‖ body_tag`)
//! followed by the body ciphertext whose tag lives in the header. A header
//! sealing 18 zero bytes is the goodbye. Each direction has its own key and a
//! 24-byte big-endian nonce counter that advances twice per message.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use xsalsa20poly1305::aead::{AeadInPlace, KeyInit};
use xsalsa20poly1305::{Key, Nonce, Tag, XSalsa20Poly1305};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;
/// XSalsa20 nonce length.
pub const NONCE_LEN: usize = 24;
/// Plaintext header: body length plus body tag.
const HEADER_PLAIN_LEN: usize = 2 + TAG_LEN;
/// Sealed header length on the wire.
pub const HEADER_LEN: usize = TAG_LEN + HEADER_PLAIN_LEN;
/// Largest body carried by a single boxstream message.
pub const MAX_BODY: usize = 4096;

/// Errors raised by boxstream readers and writers.
#[derive(Debug, Error)]
pub enum BoxStreamError {
    /// A header or body failed authentication.
    #[error("boxstream authentication failed")]
    Authentication,
    /// The header announced a body longer than [`MAX_BODY`].
    #[error("boxstream body too large: {0} bytes")]
    BodyTooLarge(usize),
    /// The nonce counter wrapped around.
    #[error("boxstream nonce overflow")]
    NonceOverflow,
    /// A write was attempted after goodbye.
    #[error("boxstream terminated")]
    Terminated,
    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Key material for both directions of a boxstream.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BoxKeys {
    /// Key for frames we send.
    pub encrypt_key: [u8; 32],
    /// Starting nonce for frames we send.
    pub encrypt_nonce: [u8; NONCE_LEN],
    /// Key for frames we receive.
    pub decrypt_key: [u8; 32],
    /// Starting nonce for frames we receive.
    pub decrypt_nonce: [u8; NONCE_LEN],
}

impl std::fmt::Debug for BoxKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxKeys { .. }")
    }
}

/// Seal `buf` in place, returning the detached tag.
pub(crate) fn seal_detached(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    buf: &mut [u8],
) -> Result<[u8; TAG_LEN], BoxStreamError> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    seal_with(&cipher, nonce, buf)
}

/// Open `buf` in place against a detached tag.
pub(crate) fn open_detached(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    tag: &[u8],
    buf: &mut [u8],
) -> Result<(), BoxStreamError> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    open_with(&cipher, nonce, tag, buf)
}

fn seal_with(
    cipher: &XSalsa20Poly1305,
    nonce: &[u8; NONCE_LEN],
    buf: &mut [u8],
) -> Result<[u8; TAG_LEN], BoxStreamError> {
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", buf)
        .map_err(|_| BoxStreamError::Authentication)?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

fn open_with(
    cipher: &XSalsa20Poly1305,
    nonce: &[u8; NONCE_LEN],
    tag: &[u8],
    buf: &mut [u8],
) -> Result<(), BoxStreamError> {
    if tag.len() != TAG_LEN {
        return Err(BoxStreamError::Authentication);
    }
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", buf, Tag::from_slice(tag))
        .map_err(|_| BoxStreamError::Authentication)
}

/// Big-endian 192-bit counter used as the per-direction nonce.
#[derive(Zeroize)]
struct NonceCounter([u8; NONCE_LEN]);

impl NonceCounter {
    /// Return the current value and advance.
    fn next(&mut self) -> Result<[u8; NONCE_LEN], BoxStreamError> {
        let current = self.0;
        for byte in self.0.iter_mut().rev() {
            let (value, carry) = byte.overflowing_add(1);
            *byte = value;
            if !carry {
                return Ok(current);
            }
        }
        Err(BoxStreamError::NonceOverflow)
    }
}

/// Split an authenticated transport into its boxstream halves.
pub fn split<S>(stream: S, keys: &BoxKeys) -> (BoxReader<ReadHalf<S>>, BoxWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (rd, wr) = tokio::io::split(stream);
    (
        BoxReader::new(rd, &keys.decrypt_key, keys.decrypt_nonce),
        BoxWriter::new(wr, &keys.encrypt_key, keys.encrypt_nonce),
    )
}

/// Writing half of a boxstream.
pub struct BoxWriter<W> {
    inner: W,
    cipher: XSalsa20Poly1305,
    nonce: NonceCounter,
    finished: bool,
}

impl<W: AsyncWrite + Unpin> BoxWriter<W> {
    /// Wrap a transport writer with the send key and starting nonce.
    pub fn new(inner: W, key: &[u8; 32], nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            inner,
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
            nonce: NonceCounter(nonce),
            finished: false,
        }
    }

    /// Seal and send `data`, split into messages of at most [`MAX_BODY`] bytes.
    ///
    /// # Errors
    ///
    /// Fails after [`BoxWriter::goodbye`], on nonce exhaustion or when the
    /// transport fails.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), BoxStreamError> {
        if self.finished {
            return Err(BoxStreamError::Terminated);
        }
        for chunk in data.chunks(MAX_BODY) {
            self.write_chunk(chunk).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), BoxStreamError> {
        let header_nonce = self.nonce.next()?;
        let body_nonce = self.nonce.next()?;

        let mut body = chunk.to_vec();
        let body_tag = seal_with(&self.cipher, &body_nonce, &mut body)?;

        let len = u16::try_from(chunk.len()).map_err(|_| BoxStreamError::BodyTooLarge(chunk.len()))?;
        let mut header = [0u8; HEADER_PLAIN_LEN];
        header[..2].copy_from_slice(&len.to_be_bytes());
        header[2..].copy_from_slice(&body_tag);
        let header_tag = seal_with(&self.cipher, &header_nonce, &mut header)?;

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&header_tag);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&body);
        self.inner.write_all(&frame).await?;
        Ok(())
    }

    /// Send the goodbye header. Further writes fail with
    /// [`BoxStreamError::Terminated`].
    ///
    /// # Errors
    ///
    /// Returns an error when the transport fails.
    pub async fn goodbye(&mut self) -> Result<(), BoxStreamError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let nonce = self.nonce.next()?;
        let mut header = [0u8; HEADER_PLAIN_LEN];
        let tag = seal_with(&self.cipher, &nonce, &mut header)?;
        self.inner.write_all(&tag).await?;
        self.inner.write_all(&header).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send goodbye and shut the transport down.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport fails.
    pub async fn shutdown(&mut self) -> Result<(), BoxStreamError> {
        self.goodbye().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reading half of a boxstream.
pub struct BoxReader<R> {
    inner: R,
    cipher: XSalsa20Poly1305,
    nonce: NonceCounter,
    finished: bool,
}

impl<R: AsyncRead + Unpin> BoxReader<R> {
    /// Wrap a transport reader with the receive key and starting nonce.
    pub fn new(inner: R, key: &[u8; 32], nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            inner,
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
            nonce: NonceCounter(nonce),
            finished: false,
        }
    }

    /// Read and open the next message.
    ///
    /// Returns `Ok(None)` once the peer said goodbye, and on every call after.
    ///
    /// # Errors
    ///
    /// Any authentication failure is returned before plaintext is exposed.
    /// A transport EOF without goodbye is a [`BoxStreamError::Transport`].
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>, BoxStreamError> {
        if self.finished {
            return Ok(None);
        }

        let mut sealed = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut sealed).await?;
        let header_nonce = self.nonce.next()?;
        let mut header = [0u8; HEADER_PLAIN_LEN];
        header.copy_from_slice(&sealed[TAG_LEN..]);
        open_with(&self.cipher, &header_nonce, &sealed[..TAG_LEN], &mut header)?;

        if header.iter().all(|b| *b == 0) {
            self.finished = true;
            return Ok(None);
        }

        let len = usize::from(u16::from_be_bytes([header[0], header[1]]));
        if len > MAX_BODY {
            return Err(BoxStreamError::BodyTooLarge(len));
        }
        let body_nonce = self.nonce.next()?;
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        open_with(&self.cipher, &body_nonce, &header[2..], &mut body)?;
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x24u8; 32];
    const NONCE: [u8; NONCE_LEN] = [0x01u8; NONCE_LEN];

    async fn seal_messages(messages: &[&[u8]], goodbye: bool) -> Vec<u8> {
        let mut writer = BoxWriter::new(Vec::new(), &KEY, NONCE);
        for msg in messages {
            writer.write_all(msg).await.unwrap();
        }
        if goodbye {
            writer.goodbye().await.unwrap();
        }
        writer.inner
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let wire = seal_messages(&[b"hello", b"world"], true).await;
        let mut reader = BoxReader::new(wire.as_slice(), &KEY, NONCE);
        assert_eq!(reader.read_message().await.unwrap().unwrap(), b"hello");
        assert_eq!(reader.read_message().await.unwrap().unwrap(), b"world");
        assert!(reader.read_message().await.unwrap().is_none());
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_writes_are_split() {
        let data = vec![0x5Au8; MAX_BODY * 2 + 10];
        let wire = seal_messages(&[&data], false).await;
        assert_eq!(wire.len(), data.len() + 3 * HEADER_LEN);

        let mut reader = BoxReader::new(wire.as_slice(), &KEY, NONCE);
        let mut total = Vec::new();
        while total.len() < data.len() {
            let chunk = reader.read_message().await.unwrap().unwrap();
            assert!(chunk.len() <= MAX_BODY);
            total.extend(chunk);
        }
        assert_eq!(total, data);
    }

    #[tokio::test]
    async fn flipped_body_bit_fails_before_plaintext() {
        let mut wire = seal_messages(&[b"attack at dawn"], true).await;
        wire[HEADER_LEN + 3] ^= 0x80;
        let mut reader = BoxReader::new(wire.as_slice(), &KEY, NONCE);
        assert!(matches!(
            reader.read_message().await,
            Err(BoxStreamError::Authentication)
        ));
    }

    #[tokio::test]
    async fn flipped_header_bit_fails() {
        let mut wire = seal_messages(&[b"attack at dawn"], false).await;
        wire[TAG_LEN] ^= 0x01;
        let mut reader = BoxReader::new(wire.as_slice(), &KEY, NONCE);
        assert!(matches!(
            reader.read_message().await,
            Err(BoxStreamError::Authentication)
        ));
    }

    #[tokio::test]
    async fn wrong_key_fails() {
        let wire = seal_messages(&[b"x"], false).await;
        let mut reader = BoxReader::new(wire.as_slice(), &[0u8; 32], NONCE);
        assert!(matches!(
            reader.read_message().await,
            Err(BoxStreamError::Authentication)
        ));
    }

    #[tokio::test]
    async fn eof_without_goodbye_is_transport_error() {
        let wire = seal_messages(&[b"x"], false).await;
        let mut reader = BoxReader::new(wire.as_slice(), &KEY, NONCE);
        reader.read_message().await.unwrap();
        assert!(matches!(
            reader.read_message().await,
            Err(BoxStreamError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn write_after_goodbye_is_rejected() {
        let mut writer = BoxWriter::new(Vec::new(), &KEY, NONCE);
        writer.goodbye().await.unwrap();
        assert!(matches!(
            writer.write_all(b"late").await,
            Err(BoxStreamError::Terminated)
        ));
    }

    #[tokio::test]
    async fn split_halves_talk_to_mirrored_keys() {
        let ours = BoxKeys {
            encrypt_key: [1u8; 32],
            encrypt_nonce: [2u8; NONCE_LEN],
            decrypt_key: [3u8; 32],
            decrypt_nonce: [4u8; NONCE_LEN],
        };
        let theirs = BoxKeys {
            encrypt_key: ours.decrypt_key,
            encrypt_nonce: ours.decrypt_nonce,
            decrypt_key: ours.encrypt_key,
            decrypt_nonce: ours.encrypt_nonce,
        };
        let (a, b) = tokio::io::duplex(16 * 1024);
        let (mut a_rd, mut a_wr) = split(a, &ours);
        let (mut b_rd, mut b_wr) = split(b, &theirs);

        a_wr.write_all(b"ping").await.unwrap();
        assert_eq!(b_rd.read_message().await.unwrap().unwrap(), b"ping");
        b_wr.write_all(b"pong").await.unwrap();
        assert_eq!(a_rd.read_message().await.unwrap().unwrap(), b"pong");
    }

    #[test]
    fn nonce_counter_carries() {
        let mut start = [0u8; NONCE_LEN];
        start[NONCE_LEN - 1] = 0xFF;
        let mut counter = NonceCounter(start);
        assert_eq!(counter.next().unwrap(), start);
        let mut expected = [0u8; NONCE_LEN];
        expected[NONCE_LEN - 2] = 0x01;
        assert_eq!(counter.0, expected);
    }

    #[test]
    fn nonce_counter_overflow_is_an_error() {
        let mut counter = NonceCounter([0xFFu8; NONCE_LEN]);
        assert!(matches!(counter.next(), Err(BoxStreamError::NonceOverflow)));
    }
}
