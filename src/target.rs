//! Catalog target records and their per-format custom payloads.
//!
//! A [`Target`] is a named, hash-identified artifact published by the trust
//! catalog. Its opaque `custom` payload is resolved into one of two
//! variants, tagged by `targetFormat`: [`BaseCustom`] for OS images and
//! [`ComposeCustom`] for application stacks. Both share the fields of
//! [`CustomMeta`] by composition.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Compose file assumed when a stack payload declares none.
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

#[derive(Debug, Error)]
pub enum CustomError {
    #[error("unable to parse custom payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid targetFormat: expected = '{expected}', actual = '{actual}'")]
    Format {
        expected: TargetFormat,
        actual: String,
    },

    #[error("missing required field '{field}' in {format} custom payload")]
    MissingField {
        field: &'static str,
        format: TargetFormat,
    },
}

#[derive(Debug, Error)]
#[error("invalid sha256 hash '{0}'")]
pub struct InvalidHashError(String);

/// A sha256 digest, used as both cache key and download integrity check.
///
/// Serialized as a lowercase hex string; exactly 32 bytes once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Digest of a byte buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = InvalidHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| InvalidHashError(s.to_owned()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| InvalidHashError(s.to_owned()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidHashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_hex()
    }
}

/// A named, hash-identified artifact record from the trust catalog.
///
/// Immutable once obtained; the catalog has already verified the
/// signatures covering it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,

    #[serde(rename = "sha256")]
    pub hash: ContentHash,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

/// Tag keying the two custom payload variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    OsTree,
    DockerCompose,
}

impl TargetFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OsTree => "OSTREE",
            Self::DockerCompose => "DOCKER_COMPOSE",
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every custom payload variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomMeta {
    #[serde(default, rename = "targetFormat")]
    pub target_format: String,

    #[serde(default)]
    pub uri: String,
}

/// OSTREE custom payload: where the base image is pulled from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseCustom {
    #[serde(flatten)]
    pub meta: CustomMeta,

    #[serde(default, rename = "ostree")]
    pub source_url: String,
}

/// DOCKER_COMPOSE custom payload: the stack tarball and how to run it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeCustom {
    #[serde(flatten)]
    pub meta: CustomMeta,

    #[serde(default, rename = "tgz")]
    pub tarball_url: String,

    #[serde(default, rename = "tgzLeadingDir")]
    pub strip_leading_dir: bool,

    #[serde(default, rename = "compose-files", skip_serializing_if = "Vec::is_empty")]
    pub compose_files: Vec<String>,

    #[serde(default, rename = "compose-env", skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
}

impl ComposeCustom {
    /// Declared compose file set, defaulting to the single standard name.
    pub fn file_names(&self) -> Vec<String> {
        if self.compose_files.is_empty() {
            vec![DEFAULT_COMPOSE_FILE.to_owned()]
        } else {
            self.compose_files.clone()
        }
    }
}

/// Resolve a target's custom payload as a base image descriptor.
///
/// An absent payload validates as the all-empty struct, so callers need
/// not special-case "absent" separately from "empty but valid."
pub fn base_custom(custom: Option<&serde_json::Value>) -> Result<BaseCustom, CustomError> {
    let Some(value) = custom else {
        return Ok(BaseCustom::default());
    };
    let parsed: BaseCustom = serde_json::from_value(value.clone())?;
    if parsed.meta.target_format != TargetFormat::OsTree.as_str() {
        return Err(CustomError::Format {
            expected: TargetFormat::OsTree,
            actual: parsed.meta.target_format,
        });
    }
    if parsed.source_url.is_empty() {
        return Err(CustomError::MissingField {
            field: "ostree",
            format: TargetFormat::OsTree,
        });
    }
    Ok(parsed)
}

/// Resolve a target's custom payload as a compose stack descriptor.
pub fn compose_custom(custom: Option<&serde_json::Value>) -> Result<ComposeCustom, CustomError> {
    let Some(value) = custom else {
        return Ok(ComposeCustom::default());
    };
    let parsed: ComposeCustom = serde_json::from_value(value.clone())?;
    if parsed.meta.target_format != TargetFormat::DockerCompose.as_str() {
        return Err(CustomError::Format {
            expected: TargetFormat::DockerCompose,
            actual: parsed.meta.target_format,
        });
    }
    if parsed.tarball_url.is_empty() {
        return Err(CustomError::MissingField {
            field: "tgz",
            format: TargetFormat::DockerCompose,
        });
    }
    Ok(parsed)
}

#[derive(Debug, Error)]
#[error("invalid base target name '{0}': expected <version>-<hardwareId>")]
pub struct InvalidNameError(String);

/// Split a base target name like `v38-hikey` into (version, hardware id).
///
/// The first `-` separates the two; a name with no separator, or with a
/// leading one, is rejected.
pub fn split_base_name(name: &str) -> Result<(&str, &str), InvalidNameError> {
    match name.find('-') {
        Some(idx) if idx > 0 => Ok((&name[..idx], &name[idx + 1..])),
        _ => Err(InvalidNameError(name.to_owned())),
    }
}
