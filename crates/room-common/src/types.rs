//! Core type definitions and protocol constants for SSB rooms.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 32-byte Ed25519 public key.
pub type Pubkey = [u8; 32];

/// The well-known SSB main network capability
/// (`1KHLiKZvAvjbY1ziZEHMXawbCEIM6qwjCDm3VYRan/s=`).
pub const DEFAULT_NETWORK_CAP: [u8; 32] = [
    0xd4, 0xa1, 0xcb, 0x88, 0xa6, 0x6f, 0x02, 0xf8, 0xdb, 0x63, 0x5c, 0xe2, 0x64, 0x41, 0xcc, 0x5d,
    0xac, 0x1b, 0x08, 0x42, 0x0c, 0xea, 0xac, 0x23, 0x08, 0x39, 0xb7, 0x55, 0x84, 0x5a, 0x9f, 0xfb,
];

/// Signing algorithm a feed reference is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedAlgo {
    /// Classic `@….ed25519` feeds.
    Ed25519,
    /// Gabby Grove feeds (`@….ggfeed-v1`).
    GabbyGrove,
    /// Bendy Butt meta feeds (`@….bendybutt-v1`).
    BendyButt,
}

impl FeedAlgo {
    /// Suffix used in the canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::GabbyGrove => "ggfeed-v1",
            Self::BendyButt => "bendybutt-v1",
        }
    }
}

/// Errors produced when parsing a feed reference.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefError {
    /// The string does not start with `@`.
    #[error("feed reference must start with '@'")]
    MissingSigil,
    /// No `.algo` suffix was found.
    #[error("feed reference has no algorithm suffix")]
    MissingAlgo,
    /// The algorithm suffix is not one we know.
    #[error("unknown feed algorithm: {0}")]
    UnknownAlgo(String),
    /// The key part is not valid base64.
    #[error("invalid base64 in feed reference")]
    Base64,
    /// The key part does not decode to 32 bytes.
    #[error("feed key must be 32 bytes, got {0}")]
    WrongLength(usize),
}

/// A peer identity: a 32-byte public key plus an algorithm tag.
///
/// The canonical form is `@` + base64(key) + `.` + algo. Ordering follows the
/// canonical string so sorted lists are deterministic.
///
/// # Examples
///
/// ```
/// use room_common::FeedRef;
///
/// let feed = FeedRef::ed25519([7u8; 32]);
/// let text = feed.to_string();
/// assert!(text.starts_with('@') && text.ends_with(".ed25519"));
/// assert_eq!(text.parse::<FeedRef>().unwrap(), feed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedRef {
    key: Pubkey,
    algo: FeedAlgo,
}

impl FeedRef {
    /// Build a reference for an Ed25519 key.
    #[must_use]
    pub const fn ed25519(key: Pubkey) -> Self {
        Self {
            key,
            algo: FeedAlgo::Ed25519,
        }
    }

    /// Build a reference with an explicit algorithm.
    #[must_use]
    pub const fn new(key: Pubkey, algo: FeedAlgo) -> Self {
        Self { key, algo }
    }

    /// Raw public key bytes.
    #[must_use]
    pub const fn key(&self) -> &Pubkey {
        &self.key
    }

    /// Algorithm tag.
    #[must_use]
    pub const fn algo(&self) -> FeedAlgo {
        self.algo
    }

    /// Abbreviated form for log lines, e.g. `<@AbCdE.ed25519>`.
    #[must_use]
    pub fn short(&self) -> String {
        let encoded = STANDARD.encode(self.key);
        format!("<@{}.{}>", &encoded[..5], self.algo.as_str())
    }
}

impl fmt::Display for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", STANDARD.encode(self.key), self.algo.as_str())
    }
}

impl fmt::Debug for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedRef({self})")
    }
}

impl PartialOrd for FeedRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Base64 length of a 32-byte key, padding included.
const ENCODED_KEY_LEN: usize = 44;

impl FeedRef {
    fn encoded_key(&self) -> [u8; ENCODED_KEY_LEN] {
        let mut out = [0u8; ENCODED_KEY_LEN];
        // Always fits: 32 bytes encode to exactly 44.
        let _ = STANDARD.encode_slice(self.key, &mut out);
        out
    }
}

/// Same order as the canonical strings, without building them: every key
/// encodes to the same width, so the algorithm suffix only breaks ties.
impl Ord for FeedRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.encoded_key()
            .cmp(&other.encoded_key())
            .then_with(|| self.algo.as_str().cmp(other.algo.as_str()))
    }
}

impl FromStr for FeedRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix('@').ok_or(RefError::MissingSigil)?;
        let (encoded, algo) = body.rsplit_once('.').ok_or(RefError::MissingAlgo)?;
        let algo = match algo {
            "ed25519" => FeedAlgo::Ed25519,
            "ggfeed-v1" => FeedAlgo::GabbyGrove,
            "bendybutt-v1" => FeedAlgo::BendyButt,
            other => return Err(RefError::UnknownAlgo(other.to_string())),
        };
        let bytes = STANDARD.decode(encoded).map_err(|_| RefError::Base64)?;
        let key: Pubkey = bytes
            .as_slice()
            .try_into()
            .map_err(|_| RefError::WrongLength(bytes.len()))?;
        Ok(Self { key, algo })
    }
}

impl Serialize for FeedRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FeedRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_uses_standard_base64() {
        let feed = FeedRef::ed25519([0xFFu8; 32]);
        assert_eq!(
            feed.to_string(),
            "@//////////////////////////////////////////8=.ed25519"
        );
    }

    #[test]
    fn parse_rejects_missing_sigil() {
        let text = FeedRef::ed25519([1u8; 32]).to_string();
        assert_eq!(text[1..].parse::<FeedRef>(), Err(RefError::MissingSigil));
    }

    #[test]
    fn parse_rejects_unknown_algo() {
        let text = FeedRef::ed25519([1u8; 32]).to_string().replace("ed25519", "sha256");
        assert!(matches!(
            text.parse::<FeedRef>(),
            Err(RefError::UnknownAlgo(a)) if a == "sha256"
        ));
    }

    #[test]
    fn parse_rejects_short_key() {
        let text = format!("@{}.ed25519", STANDARD.encode([1u8; 16]));
        assert_eq!(text.parse::<FeedRef>(), Err(RefError::WrongLength(16)));
    }

    #[test]
    fn equality_includes_algo() {
        let a = FeedRef::new([3u8; 32], FeedAlgo::Ed25519);
        let b = FeedRef::new([3u8; 32], FeedAlgo::GabbyGrove);
        assert_ne!(a, b);
        assert_eq!(b.to_string().parse::<FeedRef>().unwrap(), b);
    }

    #[test]
    fn ordering_follows_canonical_string() {
        let mut feeds = vec![
            FeedRef::ed25519([0xFFu8; 32]),
            FeedRef::ed25519([0x00u8; 32]),
            FeedRef::ed25519([0x80u8; 32]),
        ];
        feeds.sort();
        let strings: Vec<String> = feeds.iter().map(ToString::to_string).collect();
        let mut sorted = strings.clone();
        sorted.sort();
        assert_eq!(strings, sorted);
    }

    #[test]
    fn serde_uses_string_form() {
        let feed = FeedRef::ed25519([9u8; 32]);
        let json = serde_json::to_string(&feed).unwrap();
        assert_eq!(json, format!("\"{feed}\""));
        let back: FeedRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, feed);
    }

    #[test]
    fn short_form_is_abbreviated() {
        let feed = FeedRef::ed25519([0u8; 32]);
        assert_eq!(feed.short(), "<@AAAAA.ed25519>");
    }
}
