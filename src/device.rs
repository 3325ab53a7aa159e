//! Device update orchestration.
//!
//! [`Device`] is the explicit context every operation receives: the
//! persistent configuration, the blob cache, the image manager and the
//! subprocess runner. Updates run as two independent tracks — base image
//! and personality — each moving through resolve → apply. One track
//! failing never rolls back the other.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{BlobCache, CacheError};
use crate::catalog::{self, CatalogClient, CatalogError};
use crate::compose::{ComposeError, ComposeStack, TrustPolicy};
use crate::config::{CollectionConfig, ConfigError, DeviceConfig};
use crate::ostree::{ImageManager, OsStatus, OsTreeError};
use crate::target::{self, CustomError, InvalidNameError, Target};
use crate::util::cmd::{Exec, Runner};
use crate::util::fs::{ensure_exists, safe_write_all};

const CACHE_DIR: &str = "cache";
const STACK_DIR: &str = "stack";

/// Label of the ostree remote the orchestrator manages.
const BASE_REMOTE: &str = "catalog";

/// The two independently updated tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Base,
    Personality,
}

impl Track {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Personality => "personality",
        }
    }

    fn record_file(&self) -> &'static str {
        match self {
            Self::Base => "base.json",
            Self::Personality => "personality.json",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no target found for version '{0}'")]
    NotFound(String),

    #[error("target '{name}' is built for hardware '{actual}', this device is '{expected}'")]
    HardwareMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("device is not configured for {0} updates")]
    NotConfigured(Track),

    #[error("active image {0} does not match any catalog target")]
    ActiveImageUnknown(String),

    #[error("unable to read applied target record {}: {source}", .path.display())]
    RecordRead { path: PathBuf, source: io::Error },

    #[error("invalid applied target record {}: {source}", .path.display())]
    RecordParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unable to persist applied target record {}: {source}", .path.display())]
    RecordWrite { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Name(#[from] InvalidNameError),

    #[error(transparent)]
    Custom(#[from] CustomError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    OsTree(#[from] OsTreeError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Explicit per-invocation context for update operations.
pub struct Device {
    config: DeviceConfig,
    config_dir: PathBuf,
    cache: BlobCache,
    images: ImageManager,
    runner: Arc<dyn Runner>,
}

impl Device {
    /// Open the device context from an initialized config dir.
    pub fn open(config_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();
        let config = DeviceConfig::load(&config_dir)?;
        Ok(Self::with_runner(config, config_dir, Arc::new(Exec)))
    }

    /// Assemble a context with an explicit runner; tests inject a fake.
    pub fn with_runner(
        config: DeviceConfig,
        config_dir: PathBuf,
        runner: Arc<dyn Runner>,
    ) -> Self {
        let cache = BlobCache::new(config_dir.join(CACHE_DIR));
        let images = ImageManager::new(Arc::clone(&runner));
        Self {
            config,
            config_dir,
            cache,
            images,
            runner,
        }
    }

    /// Replace the image manager, e.g. to point at a mounted sysroot.
    pub fn with_image_manager(mut self, images: ImageManager) -> Self {
        self.images = images;
        self
    }

    /// First-run initialization: persist the configuration, probing the
    /// hardware id from the active image when it is not supplied.
    pub async fn initialize(
        config_dir: impl Into<PathBuf>,
        config: DeviceConfig,
    ) -> Result<Self, UpdateError> {
        Self::initialize_with_runner(config_dir.into(), config, Arc::new(Exec)).await
    }

    pub async fn initialize_with_runner(
        config_dir: PathBuf,
        mut config: DeviceConfig,
        runner: Arc<dyn Runner>,
    ) -> Result<Self, UpdateError> {
        if config.hardware_id.is_empty() {
            info!("probing image manager and catalog for the hardware id");
            let device = Self::with_runner(config.clone(), config_dir.clone(), Arc::clone(&runner));
            let probed = device.probe_base_target().await?;
            let (_, hardware_id) = target::split_base_name(&probed.name)?;
            config.hardware_id = hardware_id.to_owned();
            // The probed target is what the device currently runs; record
            // it so "what's applied" starts out consistent.
            device.persist_applied(Track::Base, &probed)?;
        }

        config.store(&config_dir)?;
        Ok(Self::with_runner(config, config_dir, runner))
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn hardware_id(&self) -> &str {
        &self.config.hardware_id
    }

    pub fn is_configured(&self, track: Track) -> bool {
        self.collection(track).is_ok()
    }

    /// Live image status, queried from the image manager.
    pub async fn status(&self) -> Result<OsStatus, UpdateError> {
        Ok(self.images.status().await?)
    }

    fn collection(&self, track: Track) -> Result<&CollectionConfig, UpdateError> {
        match track {
            Track::Base => self.config.base.as_ref(),
            Track::Personality => self.config.personality.as_ref(),
        }
        .ok_or(UpdateError::NotConfigured(track))
    }

    /// List the catalog's published targets for a track.
    pub async fn list_targets(&self, track: Track) -> Result<Vec<Target>, UpdateError> {
        let collection = self.collection(track)?;
        let catalog = CatalogClient::new(&collection.server, collection.ca_file.as_deref())?;
        Ok(catalog.list_targets(&collection.collection).await?)
    }

    /// Resolve a version token (`"latest"` or an exact name) against the
    /// catalog for a track.
    pub async fn resolve(&self, track: Track, version: &str) -> Result<Target, UpdateError> {
        let targets = self.list_targets(track).await?;
        catalog::resolve(version, &targets)
            .cloned()
            .ok_or_else(|| UpdateError::NotFound(version.to_owned()))
    }

    /// Last successfully-applied target for a track, if any.
    pub fn applied(&self, track: Track) -> Result<Option<Target>, UpdateError> {
        let path = self.record_path(track);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(UpdateError::RecordRead { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| UpdateError::RecordParse { path, source })
    }

    fn record_path(&self, track: Track) -> PathBuf {
        self.config_dir.join(track.record_file())
    }

    fn persist_applied(&self, track: Track, target: &Target) -> Result<(), UpdateError> {
        let path = self.record_path(track);
        ensure_exists(&self.config_dir).map_err(|source| UpdateError::RecordWrite {
            path: path.clone(),
            source,
        })?;
        let data = serde_json::to_vec_pretty(target).map_err(|source| UpdateError::RecordParse {
            path: path.clone(),
            source,
        })?;
        safe_write_all(&path, data).map_err(|source| UpdateError::RecordWrite { path, source })
    }

    /// Apply a base-image target as the next-boot deployment.
    ///
    /// Success is reported without waiting for a reboot; real completion
    /// is observed later through the live image status.
    pub async fn apply_base(&self, target: &Target) -> Result<(), UpdateError> {
        let status = self.images.status().await?;
        let desired = target.hash.to_hex();

        if status.active == desired {
            info!("device already running image {desired}");
            // Keep the applied record consistent even with no transfer.
            self.persist_applied(Track::Base, target)?;
            return Ok(());
        }

        let (version, hardware_id) = target::split_base_name(&target.name)?;
        if hardware_id != self.config.hardware_id {
            return Err(UpdateError::HardwareMismatch {
                name: target.name.clone(),
                expected: self.config.hardware_id.clone(),
                actual: hardware_id.to_owned(),
            });
        }

        let custom = target::base_custom(target.custom.as_ref())?;
        info!("updating device to version {version}, image {desired}");
        self.images
            .add_remote(BASE_REMOTE, &custom.source_url, true)?;
        self.images.pull_and_deploy(BASE_REMOTE, &desired).await?;
        Ok(())
    }

    /// Apply a personality target.
    ///
    /// Fail-closed: the new stack is downloaded, verified and fully
    /// validated before the running stack is touched, so a bad new stack
    /// never tears down a good running one.
    pub async fn apply_personality(&self, target: &Target) -> Result<(), UpdateError> {
        let collection = self.collection(Track::Personality)?;
        let custom = target::compose_custom(target.custom.as_ref())?;
        info!("updating personality to {}, stack {}", target.name, target.hash);

        self.cache.fetch(&custom.tarball_url, &target.hash).await?;

        let trust = TrustPolicy {
            registry: self.config.trusted_registry.clone(),
            server: collection.server.clone(),
        };
        let stack = ComposeStack::load(
            &self.cache,
            Arc::clone(&self.runner),
            &trust,
            &target.hash,
            custom,
        )
        .await?;

        let project_dir = self.config_dir.join(STACK_DIR);
        self.stop_previous(&trust, &project_dir).await;

        stack.start(&project_dir).await?;
        self.persist_applied(Track::Personality, target)?;
        Ok(())
    }

    /// Best-effort stop of the previously applied stack.
    ///
    /// A device with no record (first run), or a previous stack that can
    /// no longer be loaded or stopped, only logs: a stale-but-running
    /// stack beats none, and attempting the new stack beats refusing to
    /// act.
    async fn stop_previous(&self, trust: &TrustPolicy, project_dir: &Path) {
        let previous = match self.applied(Track::Personality) {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                info!("no personality applied yet, skipping stack stop");
                return;
            }
            Err(e) => {
                warn!("unable to load the applied personality record, skipping stack stop: {e}");
                return;
            }
        };

        let custom = match target::compose_custom(previous.custom.as_ref()) {
            Ok(custom) => custom,
            Err(e) => {
                warn!(
                    "unable to resolve previous personality {}, skipping stack stop: {e}",
                    previous.name
                );
                return;
            }
        };

        let stack = match ComposeStack::load(
            &self.cache,
            Arc::clone(&self.runner),
            trust,
            &previous.hash,
            custom,
        )
        .await
        {
            Ok(stack) => stack,
            Err(e) => {
                warn!(
                    "unable to load previous personality {}, skipping stack stop: {e}",
                    previous.name
                );
                return;
            }
        };

        if let Err(e) = stack.stop(project_dir).await {
            warn!(
                "unable to stop stack {}, continuing with the new one: {e}",
                previous.name
            );
        }
    }

    /// Find the catalog target matching the live active image.
    async fn probe_base_target(&self) -> Result<Target, UpdateError> {
        let status = self.images.status().await?;
        let targets = self.list_targets(Track::Base).await?;
        targets
            .into_iter()
            .find(|target| target.hash.to_hex() == status.active)
            .ok_or(UpdateError::ActiveImageUnknown(status.active))
    }
}
