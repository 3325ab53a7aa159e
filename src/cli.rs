use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{CollectionConfig, DeviceConfig};

/// updraft keeps a device's base OS image and personality up to date.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration directory path to use
    #[arg(
        env = "UPDRAFT_CONFIG_DIR",
        long = "config-dir",
        short = 'c',
        value_name = "dir",
        default_value = "/var/lib/updraft",
        global = true
    )]
    pub config_dir: PathBuf,

    /// Print more information
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Set up the initial device configuration
    Initialize(InitializeArgs),
    /// Display the status of the device
    Status,
    /// List base updates published on the catalog
    ListBase,
    /// List personality updates published on the catalog
    ListPersonality,
    /// Update the base image and/or personality of the device
    Update(UpdateArgs),
}

#[derive(Debug, Args)]
pub struct InitializeArgs {
    /// Hardware id of this device; probed from the active image when omitted
    #[arg(env = "UPDRAFT_HARDWARE_ID", long = "hardware-id", value_name = "id")]
    pub hardware_id: Option<String>,

    /// Catalog server providing base-image targets
    #[arg(long = "base-server", value_name = "url")]
    pub base_server: String,

    /// Catalog collection providing base-image targets
    #[arg(long = "base-collection", value_name = "name")]
    pub base_collection: String,

    /// Additional CA certificate for the base catalog server
    #[arg(long = "base-ca", value_name = "file")]
    pub base_ca: Option<PathBuf>,

    /// Catalog server providing personality targets; defaults to the base server
    #[arg(
        long = "personality-server",
        value_name = "url",
        requires = "personality_collection"
    )]
    pub personality_server: Option<String>,

    /// Catalog collection providing personality targets; when omitted, no
    /// personality will be configured
    #[arg(long = "personality-collection", value_name = "name")]
    pub personality_collection: Option<String>,

    /// Additional CA certificate for the personality catalog server
    #[arg(
        long = "personality-ca",
        value_name = "file",
        requires = "personality_collection"
    )]
    pub personality_ca: Option<PathBuf>,

    /// Registry prefix whose images require content-trust pulls
    #[arg(long = "trusted-registry", value_name = "host")]
    pub trusted_registry: Option<String>,
}

impl InitializeArgs {
    pub fn into_config(self) -> DeviceConfig {
        let InitializeArgs {
            hardware_id,
            base_server,
            base_collection,
            base_ca,
            personality_server,
            personality_collection,
            personality_ca,
            trusted_registry,
        } = self;

        let personality = personality_collection.map(|collection| CollectionConfig {
            server: personality_server.unwrap_or_else(|| base_server.clone()),
            collection,
            ca_file: personality_ca,
        });

        DeviceConfig {
            hardware_id: hardware_id.unwrap_or_default(),
            base: Some(CollectionConfig {
                server: base_server,
                collection: base_collection,
                ca_file: base_ca,
            }),
            personality,
            trusted_registry,
        }
    }
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    /// Base version to update to; set empty to skip the base track
    #[arg(long, value_name = "version", default_value = "latest")]
    pub base: String,

    /// Personality version to update to; set empty to skip the personality track
    #[arg(long, value_name = "version", default_value = "latest")]
    pub personality: String,
}
