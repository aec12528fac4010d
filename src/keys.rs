use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::settings::DebugMode;

pub const KEY_LEN: usize = 32;

const PLACEHOLDER_PRIVATE_KEY: &str = "CHANGE_ME_PRIVATE_KEY";
const PLACEHOLDER_PUBLIC_KEY: &str = "CHANGE_ME_PUBLIC_KEY";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key generation unavailable: {0}")]
    KeyGenUnavailable(String),
    #[error("invalid key: expected base64 of 32 bytes")]
    InvalidKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

#[async_trait]
pub trait KeyPairProvider: Send + Sync {
    async fn generate(&self) -> Result<KeyPair, KeyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum KeySource {
    /// In-process Curve25519.
    Native,
    /// `wg genkey` / `wg pubkey`.
    Wg,
}

pub fn decode_key(key: &str) -> Result<[u8; KEY_LEN], KeyError> {
    STANDARD
        .decode(key.trim())
        .map_err(|_| KeyError::InvalidKey)?
        .try_into()
        .map_err(|_| KeyError::InvalidKey)
}

pub fn validate_public_key(key: &str) -> Result<(), KeyError> {
    decode_key(key).map(|_| ())
}

pub fn derive_public(private_key: &str) -> Result<String, KeyError> {
    let secret = StaticSecret::from(decode_key(private_key)?);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

pub struct NativeKeys;

#[async_trait]
impl KeyPairProvider for NativeKeys {
    async fn generate(&self) -> Result<KeyPair, KeyError> {
        let private = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&private);

        Ok(KeyPair {
            private_key: STANDARD.encode(private.to_bytes()),
            public_key: STANDARD.encode(public.as_bytes()),
        })
    }
}

pub struct WgTool {
    binary: PathBuf,
}

impl WgTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, arg: &str, input: Option<&str>) -> Result<String, KeyError> {
        let binary = self.binary.display();
        let unavailable =
            |e: std::io::Error| KeyError::KeyGenUnavailable(format!("{binary} {arg}: {e}"));

        let mut child = Command::new(&self.binary)
            .arg(arg)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(unavailable)?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(input) = input {
                stdin.write_all(input.as_bytes()).await.map_err(unavailable)?;
                stdin.write_all(b"\n").await.map_err(unavailable)?;
            }
        }

        let output = child.wait_with_output().await.map_err(unavailable)?;
        if !output.status.success() {
            return Err(KeyError::KeyGenUnavailable(format!(
                "{} {arg} exited with {}: {}",
                binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let key = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        decode_key(&key).map_err(|_| {
            KeyError::KeyGenUnavailable(format!("{binary} {arg} printed a malformed key"))
        })?;

        Ok(key)
    }
}

#[async_trait]
impl KeyPairProvider for WgTool {
    async fn generate(&self) -> Result<KeyPair, KeyError> {
        let private_key = self.run("genkey", None).await?;
        let public_key = self.run("pubkey", Some(&private_key)).await?;

        Ok(KeyPair {
            private_key,
            public_key,
        })
    }
}

/// Hands out fixed, non-cryptographic keys when the inner provider fails.
/// Only reachable through [`provider`] with [`DebugMode::On`].
struct PlaceholderFallback<P> {
    inner: P,
}

#[async_trait]
impl<P: KeyPairProvider> KeyPairProvider for PlaceholderFallback<P> {
    async fn generate(&self) -> Result<KeyPair, KeyError> {
        match self.inner.generate().await {
            Ok(pair) => Ok(pair),
            Err(e) => {
                warn!("debug mode: key generation failed ({e}), using placeholder keys");
                Ok(KeyPair {
                    private_key: PLACEHOLDER_PRIVATE_KEY.to_owned(),
                    public_key: PLACEHOLDER_PUBLIC_KEY.to_owned(),
                })
            }
        }
    }
}

pub fn provider(source: KeySource, wg: PathBuf, debug: DebugMode) -> Box<dyn KeyPairProvider> {
    match (source, debug) {
        (KeySource::Native, DebugMode::Off) => Box::new(NativeKeys),
        (KeySource::Wg, DebugMode::Off) => Box::new(WgTool::new(wg)),
        (KeySource::Native, DebugMode::On) => Box::new(PlaceholderFallback { inner: NativeKeys }),
        (KeySource::Wg, DebugMode::On) => Box::new(PlaceholderFallback {
            inner: WgTool::new(wg),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn native_pair_matches_derivation() {
        let pair = NativeKeys.generate().await.unwrap();

        assert_eq!(decode_key(&pair.private_key).unwrap().len(), KEY_LEN);
        assert_eq!(derive_public(&pair.private_key).unwrap(), pair.public_key);
    }

    #[tokio::test]
    async fn native_pairs_differ() {
        let a = NativeKeys.generate().await.unwrap();
        let b = NativeKeys.generate().await.unwrap();
        assert_ne!(a.private_key, b.private_key);
    }

    #[test]
    fn short_keys_are_rejected() {
        assert!(matches!(validate_public_key("AAAA"), Err(KeyError::InvalidKey)));
        assert!(validate_public_key("not base64 at all!").is_err());
        assert!(validate_public_key(&STANDARD.encode([7u8; 32])).is_ok());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let tool = WgTool::new("/nonexistent/wg-binary");
        assert!(matches!(
            tool.generate().await,
            Err(KeyError::KeyGenUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn production_provider_never_falls_back() {
        let keys = provider(KeySource::Wg, "/nonexistent/wg-binary".into(), DebugMode::Off);
        assert!(keys.generate().await.is_err());
    }

    #[tokio::test]
    async fn debug_provider_falls_back_to_placeholders() {
        let keys = provider(KeySource::Wg, "/nonexistent/wg-binary".into(), DebugMode::On);
        let pair = keys.generate().await.unwrap();
        assert_eq!(pair.private_key, PLACEHOLDER_PRIVATE_KEY);
        assert_eq!(pair.public_key, PLACEHOLDER_PUBLIC_KEY);
    }
}
