use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use room_common::FeedRef;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

const KEY_FILE_PERMS: u32 = 0o600;
const SUFFIX: &str = ".ed25519";

#[derive(Serialize, Deserialize)]
struct SecretFile {
    curve: String,
    id: String,
    private: String,
    public: String,
}

/// # Errors
///
/// Returns an error if the key file has wrong permissions, cannot be
/// parsed, holds mismatching halves, or if file I/O fails.
pub fn load_or_generate_keypair(path: &Path) -> anyhow::Result<SigningKey> {
    if path.exists() {
        load_keypair(path)
    } else {
        let signing_key = SigningKey::generate(&mut OsRng);
        save_keypair(path, &signing_key)?;
        tracing::info!("generated new keypair at {}", path.display());
        Ok(signing_key)
    }
}

/// # Errors
///
/// See [`load_or_generate_keypair`].
pub fn load_keypair(path: &Path) -> anyhow::Result<SigningKey> {
    #[cfg(unix)]
    {
        let permissions = fs::metadata(path)?.permissions().mode();
        if permissions & 0o077 != 0 {
            anyhow::bail!(
                "key file {} has overly permissive permissions ({:o}), must be 0600",
                path.display(),
                permissions & 0o777
            );
        }
    }

    let raw = fs::read_to_string(path)?;
    let json: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    let file: SecretFile = serde_json::from_str(&json)
        .map_err(|e| anyhow::anyhow!("key file {} is not valid: {e}", path.display()))?;

    if file.curve != "ed25519" {
        anyhow::bail!("unsupported key curve {:?}", file.curve);
    }

    let private = decode_part(&file.private, "private")?;
    let Ok(keypair_bytes) = <[u8; 64]>::try_from(private.as_slice()) else {
        anyhow::bail!("private key must be 64 bytes, got {}", private.len());
    };
    let signing_key = SigningKey::from_keypair_bytes(&keypair_bytes)
        .map_err(|_| anyhow::anyhow!("private and public halves of the key do not match"))?;

    let public = decode_part(&file.public, "public")?;
    if public.as_slice() != signing_key.verifying_key().as_bytes() {
        anyhow::bail!("public key does not match the private key");
    }

    Ok(signing_key)
}

/// Write `signing_key` as a 0600 JSON key file, creating parent directories.
///
/// # Errors
///
/// Returns an error if file I/O fails.
pub fn save_keypair(path: &Path, signing_key: &SigningKey) -> anyhow::Result<()> {
    let public = signing_key.verifying_key().to_bytes();
    let file = SecretFile {
        curve: "ed25519".to_string(),
        id: FeedRef::ed25519(public).to_string(),
        private: format!("{}{SUFFIX}", STANDARD.encode(signing_key.to_keypair_bytes())),
        public: format!("{}{SUFFIX}", STANDARD.encode(public)),
    };
    let body = serde_json::to_string_pretty(&file)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(KEY_FILE_PERMS);
    let mut out = options.open(path)?;
    writeln!(out, "# this is your SECRET key, do not share it")?;
    out.write_all(body.as_bytes())?;
    out.write_all(b"\n")?;
    Ok(())
}

fn decode_part(value: &str, what: &str) -> anyhow::Result<Vec<u8>> {
    let body = value.strip_suffix(SUFFIX).unwrap_or(value);
    STANDARD
        .decode(body)
        .map_err(|_| anyhow::anyhow!("{what} key is not valid base64"))
}
