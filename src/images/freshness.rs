//! Detects project images built from an older build context.
//!
//! Every L2 image carries a label holding the hash of the inputs it was
//! built from. Comparing that label with the hash of the current inputs
//! tells whether a rebuild is due, without touching the registry.

use std::fs;

use sha2::{Digest, Sha256};

use crate::engine::ContainerEngine;
use crate::error::{ConfigError, EngineError};
use crate::project::Project;

use super::DOCKERFILES;

pub const CONTEXT_HASH_LABEL: &str = "gatebox.build_context_hash";

/// SHA-256 over the base image and every Dockerfile, in name order.
pub fn build_context_hash(project: &Project) -> Result<String, ConfigError> {
    let mut hasher = Sha256::new();
    hasher.update(format!("base_image={}", project.base_image).as_bytes());
    hasher.update([0u8]);

    let mut names: Vec<&str> = DOCKERFILES.to_vec();
    names.sort_unstable();
    for name in names {
        let path = project.build_dir.join(name);
        let content = fs::read(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(&content);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// `Some(true)` when the image label differs from `current_hash`.
///
/// `None` when the image is missing or was built without the label.
pub fn is_image_stale(
    engine: &dyn ContainerEngine,
    image: &str,
    current_hash: &str,
) -> Result<Option<bool>, EngineError> {
    Ok(engine
        .image_label(image, CONTEXT_HASH_LABEL)?
        .map(|label| label != current_hash))
}
