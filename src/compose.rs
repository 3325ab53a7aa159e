//! Compose-stack validation and runtime control.
//!
//! A stack ships as a verified tarball of compose manifests. Before the
//! runtime is ever touched, [`ComposeStack::load`] re-verifies the
//! tarball, pulls the required manifests straight out of the tar stream
//! (no extraction to disk), parses them, and enforces the image trust
//! policy. Only a fully validated stack can be started or stopped.

use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info};

use crate::archive::{self, strip_leading_dir};
use crate::cache::{BlobCache, CacheError};
use crate::target::{ComposeCustom, ContentHash};
use crate::util::cmd::{CmdError, Runner};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("unable to read stack tarball: {0}")]
    Archive(#[source] std::io::Error),

    #[error("missing required compose files in stack tarball: {}", .0.join(", "))]
    MissingFiles(Vec<String>),

    #[error("invalid compose manifest '{name}': {source}")]
    BadManifest {
        name: String,
        source: serde_yaml::Error,
    },

    #[error("unable to prepare stack directory {}: {source}", .dir.display())]
    Workdir {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to extract stack to {}: {source}", .dir.display())]
    Extract {
        dir: PathBuf,
        source: archive::ExtractError,
    },

    #[error(transparent)]
    Cmd(#[from] CmdError),
}

/// A compose document pulled out of the stack tarball.
#[derive(Debug, Clone)]
pub struct ComposeFile {
    pub name: String,
    pub document: serde_yaml::Value,
}

/// Image signing policy, scoped to a single registry.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    /// Registry prefix whose images must be pulled with content trust
    /// enforced. Images outside it skip the check entirely.
    pub registry: Option<String>,
    /// Content-trust server answering for that registry.
    pub server: String,
}

impl TrustPolicy {
    fn requires_signed(&self, image: &str) -> bool {
        self.registry
            .as_deref()
            .map(|prefix| image.starts_with(prefix))
            .unwrap_or(false)
    }
}

/// A verified, validated application stack, ready to run.
pub struct ComposeStack {
    tarball: PathBuf,
    custom: ComposeCustom,
    runner: Arc<dyn Runner>,
}

impl std::fmt::Debug for ComposeStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposeStack")
            .field("tarball", &self.tarball)
            .field("custom", &self.custom)
            .finish_non_exhaustive()
    }
}

impl ComposeStack {
    /// Validate a stack end-to-end before anything touches the runtime:
    /// re-verify the cached tarball, load the required manifests, and
    /// content-trust pull every image the policy covers.
    pub async fn load(
        cache: &BlobCache,
        runner: Arc<dyn Runner>,
        trust: &TrustPolicy,
        hash: &ContentHash,
        custom: ComposeCustom,
    ) -> Result<Self, ComposeError> {
        let bytes = cache.read_verified(hash)?;
        let files = collect_manifests(&bytes, custom.strip_leading_dir, &custom.file_names())?;

        for image in service_images(&files, &custom.environment) {
            if trust.requires_signed(&image) {
                info!("pulling signed image {image}");
                runner
                    .stream(
                        None,
                        &["docker", "pull", &image],
                        &[
                            ("DOCKER_CONTENT_TRUST", "1"),
                            ("DOCKER_CONTENT_TRUST_SERVER", &trust.server),
                        ],
                    )
                    .await?;
            } else {
                debug!("skipping content trust validation of {image}");
            }
        }

        Ok(Self {
            tarball: cache.blob_path(hash),
            custom,
            runner,
        })
    }

    /// Stop the stack's services.
    pub async fn stop(&self, project_dir: &Path) -> Result<(), ComposeError> {
        self.run(project_dir, &["stop"]).await
    }

    /// Start the stack's services detached.
    pub async fn start(&self, project_dir: &Path) -> Result<(), ComposeError> {
        self.run(project_dir, &["up", "-d"]).await
    }

    async fn run(&self, project_dir: &Path, action: &[&str]) -> Result<(), ComposeError> {
        // Extraction wants a fresh directory: files from a prior partial
        // run must not interleave with this stack's. The directory name
        // stays stable so the runtime keeps its project identity.
        fresh_dir(project_dir).map_err(|source| ComposeError::Workdir {
            dir: project_dir.to_owned(),
            source,
        })?;

        info!("extracting stack to {}", project_dir.display());
        archive::extract_file(&self.tarball, project_dir, self.custom.strip_leading_dir).map_err(
            |source| ComposeError::Extract {
                dir: project_dir.to_owned(),
                source,
            },
        )?;

        let files = self.custom.file_names();
        let mut argv = vec!["docker-compose"];
        for file in &files {
            argv.push("-f");
            argv.push(file.as_str());
        }
        argv.extend_from_slice(action);

        self.runner.stream(Some(project_dir), &argv, &[]).await?;
        Ok(())
    }
}

fn fresh_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dir)
}

/// Collect the required compose documents from a tarball's bytes without
/// extracting it to disk.
///
/// Required names absent at end-of-stream are reported together in one
/// error rather than one at a time.
fn collect_manifests(
    bytes: &[u8],
    strip_leading: bool,
    required: &[String],
) -> Result<Vec<ComposeFile>, ComposeError> {
    let mut wanted: BTreeSet<String> = required.iter().cloned().collect();
    let mut files = Vec::new();

    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
    for entry in archive.entries().map_err(ComposeError::Archive)? {
        let mut entry = entry.map_err(ComposeError::Archive)?;

        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = if strip_leading {
            strip_leading_dir(&raw).to_owned()
        } else {
            raw
        };
        if !wanted.remove(&name) {
            continue;
        }

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(ComposeError::Archive)?;
        let document = serde_yaml::from_slice(&data).map_err(|source| {
            ComposeError::BadManifest {
                name: name.clone(),
                source,
            }
        })?;
        files.push(ComposeFile { name, document });
    }

    if !wanted.is_empty() {
        return Err(ComposeError::MissingFiles(wanted.into_iter().collect()));
    }
    Ok(files)
}

/// Service images declared across the compose documents, in document
/// order, with the stack environment applied.
fn service_images(files: &[ComposeFile], env: &HashMap<String, String>) -> Vec<String> {
    let mut images = Vec::new();
    for file in files {
        let Some(services) = file
            .document
            .get("services")
            .and_then(serde_yaml::Value::as_mapping)
        else {
            continue;
        };
        for service in services.values() {
            if let Some(image) = service.get("image").and_then(serde_yaml::Value::as_str) {
                images.push(interpolate(image, env));
            }
        }
    }
    images
}

/// Expand `${VAR}` and `$VAR` references against the stack environment.
/// Unknown variables expand to the empty string; `$$` escapes a literal
/// dollar sign.
fn interpolate(value: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                if let Some(v) = env.get(&name) {
                    out.push_str(v);
                }
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(v) = env.get(&name) {
                    out.push_str(v);
                }
            }
            _ => out.push('$'),
        }
    }
    out
}
