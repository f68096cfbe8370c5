//! Credential resolution for the catalog API and the mirror endpoint.
//!
//! A credential can be configured three ways, checked in this order:
//!
//! 1. **Inline value** (`clientSecret: "..."`), handy for local runs
//! 2. **File** (`clientSecretFile: /run/secrets/reddit`), the Docker secrets layout
//! 3. **Environment variable** (`clientSecretEnv: REDDIT_SECRET`)

use secrecy::SecretString;
use std::fs;

/// Error type for secret resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: inline value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },

    #[error("Secret from {origin} is empty")]
    Empty { origin: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// The three places a single credential may come from.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretRef<'a> {
    pub direct: Option<&'a str>,
    pub file: Option<&'a str>,
    pub env: Option<&'a str>,
}

impl<'a> SecretRef<'a> {
    pub fn new(direct: Option<&'a str>, file: Option<&'a str>, env: Option<&'a str>) -> Self {
        Self { direct, file, env }
    }

    /// Whether any non-empty source is configured.
    pub fn is_configured(&self) -> bool {
        [self.direct, self.file, self.env]
            .iter()
            .any(|s| s.is_some_and(|v| !v.is_empty()))
    }

    pub fn resolve(&self) -> Result<SecretString> {
        resolve_secret(self.direct, self.file, self.env)
    }

    pub fn resolve_optional(&self) -> Result<Option<SecretString>> {
        resolve_secret_optional(self.direct, self.file, self.env)
    }
}

/// Resolves a secret from the first configured source.
///
/// File contents and environment values are trimmed, so a trailing newline
/// in a mounted secret does not end up in an `Authorization` header.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        let content = fs::read_to_string(&expanded).map_err(|e| SecretError::FileReadError {
            path: expanded.clone(),
            source: e,
        })?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SecretError::Empty { origin: expanded });
        }
        return Ok(SecretString::from(trimmed.to_string()));
    }

    if let Some(var_name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(var_name) {
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: var_name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: var_name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Like [`resolve_secret`], but an unconfigured secret is `Ok(None)`.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Expands a leading `~` to the current user's home directory.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy();
            if path == "~" {
                return home.into_owned();
            }
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}
