//! # Credential Resolver
//!
//! Resolves a secret value from an inline value, a file, or the output of an
//! executable, optionally base64-decoded.
//!
//! The directory client resolves its bind credentials through this type on
//! every connection attempt, so a rotated file or a fresh token from an
//! executable is picked up between retries without restarting the process.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::{Result, SyncError};

/// A secret source declared in the configuration file.
///
/// Exactly one of `value` and `file` must be set. A `file` with any execute
/// bit set is run and its stdout captured instead of reading its contents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub base64: bool,
}

impl Credential {
    /// Resolve the secret to its final cleartext value.
    pub async fn resolve(&self) -> Result<String> {
        let raw = match (&self.value, &self.file) {
            (Some(value), _) => value.clone(),
            (None, Some(file)) => from_file(file).await?,
            (None, None) => {
                return Err(SyncError::Credential(
                    "either value or file must be set".into(),
                ))
            }
        };

        let resolved = if self.base64 {
            let decoded = BASE64
                .decode(raw.trim().as_bytes())
                .map_err(|e| SyncError::Credential(format!("invalid base64: {e}")))?;
            String::from_utf8(decoded)
                .map_err(|e| SyncError::Credential(format!("decoded value is not UTF-8: {e}")))?
        } else {
            raw
        };

        if resolved.is_empty() {
            return Err(SyncError::Credential("credential is empty".into()));
        }
        Ok(resolved)
    }
}

async fn from_file(path: &Path) -> Result<String> {
    if is_executable(path).await? {
        return from_executable(path).await;
    }
    let contents = tokio::fs::read_to_string(path).await?;
    if contents.is_empty() {
        return Err(SyncError::Credential(format!(
            "file {} is empty",
            path.display()
        )));
    }
    Ok(contents.trim_end_matches(['\n', '\r']).to_string())
}

async fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = tokio::fs::metadata(path).await?;
    Ok(metadata.permissions().mode() & 0o111 != 0)
}

async fn from_executable(path: &Path) -> Result<String> {
    let output = tokio::process::Command::new(path).output().await?;
    if !output.status.success() {
        return Err(SyncError::Credential(format!(
            "{} exited with {}",
            path.display(),
            output.status
        )));
    }
    let stdout = String::from_utf8(output.stdout)
        .map_err(|e| SyncError::Credential(format!("output of {} is not UTF-8: {e}", path.display())))?;
    Ok(stdout.trim_end_matches(['\n', '\r']).to_string())
}
