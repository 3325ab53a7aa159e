//! Command implementations behind the CLI.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::cli::{InitializeArgs, UpdateArgs};
use crate::device::{Device, Track, UpdateError};
use crate::target;

pub async fn initialize(config_dir: PathBuf, args: InitializeArgs) -> Result<()> {
    println!("Initializing device state ...");
    let device = Device::initialize(config_dir, args.into_config()).await?;

    let status = device.status().await?;
    println!("Hardware id:\t{}", device.hardware_id());
    println!("Active image:\t{}", status.active);
    if let Some(pending) = &status.pending {
        println!("Pending image:\t{pending}");
    }
    Ok(())
}

pub async fn status(config_dir: PathBuf) -> Result<()> {
    let device = Device::open(config_dir)?;
    let status = device.status().await?;

    println!("Hardware id:\t{}", device.hardware_id());
    println!("Active image:\t{}", status.active);
    if let Some(pending) = &status.pending {
        println!("Pending image:\t{pending}");
    }

    if device.is_configured(Track::Base) {
        match device.applied(Track::Base) {
            Ok(Some(applied)) => {
                let (version, _) = target::split_base_name(&applied.name)?;
                println!("Base version:\t{version}");
            }
            Ok(None) => println!("Base version:\tnone applied"),
            Err(e) => warn!("unable to load applied base record: {e}"),
        }
    }

    if device.is_configured(Track::Personality) {
        match device.applied(Track::Personality) {
            Ok(Some(applied)) => println!("Personality:\t{}", applied.name),
            Ok(None) => println!("Personality:\tnone applied"),
            Err(e) => warn!("unable to load applied personality record: {e}"),
        }
    }
    Ok(())
}

pub async fn list(config_dir: PathBuf, track: Track) -> Result<()> {
    let device = Device::open(config_dir)?;
    let targets = device.list_targets(track).await?;

    println!("Updates:");
    for target in targets {
        match track {
            Track::Base => {
                let version = target::split_base_name(&target.name)
                    .map(|(version, _)| version)
                    .unwrap_or(target.name.as_str());
                println!("{version}\t{}", target.hash);
                // A bad payload invalidates this target, not the listing.
                match target::base_custom(target.custom.as_ref()) {
                    Ok(custom) => {
                        println!("  OSTree URL: {}", custom.source_url);
                        println!("  URI:        {}", custom.meta.uri);
                    }
                    Err(e) => error!("invalid custom payload for {}: {e}", target.name),
                }
            }
            Track::Personality => {
                println!("{}\t{}", target.name, target.hash);
                match target::compose_custom(target.custom.as_ref()) {
                    Ok(custom) => {
                        println!("  Tarball URL: {}", custom.tarball_url);
                        println!("  URI:         {}", custom.meta.uri);
                    }
                    Err(e) => error!("invalid custom payload for {}: {e}", target.name),
                }
            }
        }
    }
    Ok(())
}

pub async fn update(config_dir: PathBuf, args: UpdateArgs) -> Result<()> {
    let device = Device::open(config_dir)?;
    let mut failed = Vec::new();

    // The two tracks are independent: one failing neither stops nor rolls
    // back the other.
    if !args.base.is_empty() {
        if let Err(e) = update_track(&device, Track::Base, &args.base).await {
            error!("base update failed: {e}");
            failed.push(Track::Base);
        }
    }
    if !args.personality.is_empty() {
        if let Err(e) = update_track(&device, Track::Personality, &args.personality).await {
            error!("personality update failed: {e}");
            failed.push(Track::Personality);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        let tracks: Vec<_> = failed.iter().map(Track::name).collect();
        anyhow::bail!("{} update failed", tracks.join(" and "))
    }
}

async fn update_track(device: &Device, track: Track, version: &str) -> Result<(), UpdateError> {
    info!("probing catalog for {track} updates");
    let target = device.resolve(track, version).await?;
    info!("selected {track} target {}", target.name);
    match track {
        Track::Base => device.apply_base(&target).await,
        Track::Personality => device.apply_personality(&target).await,
    }
}
