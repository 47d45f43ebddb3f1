//! Image finalization.
//!
//! Turns the completed target stage into a published image directory. The
//! image is assembled in a staging directory next to the output and
//! renamed into place, so a failed finalization publishes nothing.

use super::permissions::{apply_group_zero, audit_group_access};
use super::{export_layer, Image, ImageConfig, RuntimeConfig, UserSpec, CONFIG_FILE, ROOTFS_DIR};
use crate::config::FinalizeConfig;
use crate::errors::BuildError;
use crate::stages::StageState;
use crate::utils::env::split_search_path;
use crate::utils::fs::{copy_tree, remove_tree, rooted};
use crate::utils::{generate_uuid, iso_timestamp};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Assembles and publishes images.
#[derive(Debug, Clone)]
pub struct ImageFinalizer {
    config: FinalizeConfig,
    output_dir: PathBuf,
}

impl ImageFinalizer {
    /// Creates a finalizer publishing into `output_dir`.
    #[must_use]
    pub fn new(config: FinalizeConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
        }
    }

    /// The directory images are published into.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Finalizes `state` as the image `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Finalization`] if the stage has no non-root
    /// user or no entrypoint, if an environment's `bin` directory does not
    /// lead the search path, if a normalized tree lost group access, or if
    /// assembling and publishing the image fails.
    pub async fn finalize(&self, name: &str, state: &StageState) -> Result<Image, BuildError> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(BuildError::Finalization(format!("invalid image name '{name}'")));
        }

        let user = match state.user {
            Some(user) if user.uid != 0 => user,
            Some(_) => {
                return Err(BuildError::Finalization(format!(
                    "stage '{}' runs as uid 0; images must run as a non-root user",
                    state.name
                )))
            }
            None => {
                return Err(BuildError::Finalization(format!(
                    "stage '{}' declares no user; images must run as a fixed non-root uid",
                    state.name
                )))
            }
        };

        let entrypoint = state.entrypoint.clone().ok_or_else(|| {
            BuildError::Finalization(format!("stage '{}' declares no entrypoint", state.name))
        })?;

        check_search_path(state)?;

        let runtime = RuntimeConfig::new(
            state.env.clone(),
            user,
            state.workdir.clone().unwrap_or_else(|| PathBuf::from("/")),
        );

        let assembly = Assembly {
            name: name.to_string(),
            state: state.clone(),
            runtime,
            entrypoint,
            user,
            config: self.config.clone(),
            output_dir: self.output_dir.clone(),
        };

        let image = tokio::task::spawn_blocking(move || assembly.publish())
            .await
            .map_err(|e| BuildError::Internal(format!("finalization task failed: {e}")))??;

        info!(image = %name, id = %image.id(), dir = %image.dir().display(), "Image finalized");
        Ok(image)
    }
}

/// Every environment's `bin` directory must come before the first search
/// path entry that is not an environment's.
fn check_search_path(state: &StageState) -> Result<(), BuildError> {
    if state.environments.is_empty() {
        return Ok(());
    }

    let path = state.env.get("PATH").map(String::as_str).unwrap_or_default();
    let entries = split_search_path(path);
    let bins: Vec<String> = state
        .environments
        .iter()
        .map(|env| env.bin_dir().display().to_string())
        .collect();

    let first_inherited = entries
        .iter()
        .position(|entry| !bins.contains(entry))
        .unwrap_or(entries.len());

    for bin in &bins {
        match entries.iter().position(|entry| entry == bin) {
            Some(index) if index < first_inherited => {}
            _ => {
                return Err(BuildError::Finalization(format!(
                    "environment bin directory '{bin}' must precede inherited search path entries (PATH={path})"
                )))
            }
        }
    }
    Ok(())
}

struct Assembly {
    name: String,
    state: StageState,
    runtime: RuntimeConfig,
    entrypoint: super::EntrypointContract,
    user: UserSpec,
    config: FinalizeConfig,
    output_dir: PathBuf,
}

impl Assembly {
    fn publish(self) -> Result<Image, BuildError> {
        fs::create_dir_all(&self.output_dir)?;
        let staging = self.output_dir.join(format!(".staging-{}", generate_uuid()));

        let result = self.assemble(&staging).and_then(|config| {
            let dest = self.output_dir.join(&self.name);
            swap_into_place(&staging, &dest)?;
            Ok(Image::new(dest, config))
        });

        if result.is_err() && staging.exists() {
            if let Err(e) = remove_tree(&staging) {
                warn!(dir = %staging.display(), error = %e, "Failed to remove staging directory");
            }
        }
        result
    }

    fn assemble(&self, staging: &Path) -> Result<ImageConfig, BuildError> {
        let rootfs = staging.join(ROOTFS_DIR);
        fs::create_dir_all(staging)?;
        copy_tree(&self.state.rootfs, &rootfs)?;

        for path in &self.state.normalized {
            let host = rooted(&rootfs, path)?;
            let offenders = audit_group_access(&host)?;
            if !offenders.is_empty() {
                return Err(BuildError::Finalization(format!(
                    "{} entries under '{}' are not group accessible, e.g. {}",
                    offenders.len(),
                    path.display(),
                    offenders[0].display()
                )));
            }
        }

        if self.config.apply_ownership {
            apply_group_zero(&rootfs)
                .map_err(|e| BuildError::Finalization(format!("cannot set group 0 ownership: {e}")))?;
        }

        let layer = export_layer(&rootfs, staging, self.config.compress)?;
        debug!(file = %layer.file, size = layer.size, digest = %layer.digest, "Layer exported");

        let mut hasher = Sha256::new();
        hasher.update(layer.digest.as_bytes());
        hasher.update(serde_json::to_vec(&self.runtime).map_err(|e| BuildError::Serialization(e.to_string()))?);
        hasher.update(serde_json::to_vec(&self.entrypoint).map_err(|e| BuildError::Serialization(e.to_string()))?);

        let config = ImageConfig {
            id: format!("sha256:{}", hex::encode(hasher.finalize())),
            name: self.name.clone(),
            target_stage: self.state.name.clone(),
            created: iso_timestamp(),
            runtime: self.runtime.clone(),
            entrypoint: self.entrypoint.clone(),
            exposed_ports: self.state.ports.iter().copied().collect(),
            volumes: self.state.volumes.iter().cloned().collect(),
            dependencies: self
                .state
                .runtime_dependencies()
                .into_iter()
                .map(|dep| dep.name)
                .collect(),
            environments: self.state.environments.clone(),
            artifacts: self.state.artifacts.clone(),
            layer,
        };

        let json = serde_json::to_string_pretty(&config).map_err(|e| BuildError::Serialization(e.to_string()))?;
        fs::write(staging.join(CONFIG_FILE), json)?;
        debug!(uid = self.user.uid, gid = self.user.gid, "Image config written");
        Ok(config)
    }
}

/// Renames `staging` to `dest`, replacing a previous image of the same name.
fn swap_into_place(staging: &Path, dest: &Path) -> Result<(), BuildError> {
    if !dest.exists() {
        fs::rename(staging, dest)?;
        return Ok(());
    }

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let old = parent.join(format!(".replaced-{}", generate_uuid()));
    fs::rename(dest, &old)?;

    if let Err(e) = fs::rename(staging, dest) {
        // Put the previous image back.
        if let Err(restore) = fs::rename(&old, dest) {
            warn!(dir = %old.display(), error = %restore, "Failed to restore previous image");
        }
        return Err(e.into());
    }

    if let Err(e) = remove_tree(&old) {
        warn!(dir = %old.display(), error = %e, "Failed to remove replaced image");
    }
    Ok(())
}
