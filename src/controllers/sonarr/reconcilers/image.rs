use tracing::*;

use crate::registry::{ImageReference, RegistryClient, RegistryError};

/// Work out which image reference to deploy.
///
/// `current` is the reference previously resolved from this same spec image, if any.
/// With updates disabled an existing resolution is kept as is, so new builds pushed
/// under the same tag are not picked up. Otherwise the tag is looked up and pinned
/// to the digest the registry reports for it.
pub async fn resolve_image(
    registry: &dyn RegistryClient,
    image: &ImageReference,
    current: Option<&str>,
    disable_updates: bool,
) -> Result<String, RegistryError> {
    if image.digest.is_some() {
        // already immutable
        return Ok(image.to_string());
    }

    if disable_updates {
        if let Some(current) = current.filter(|c| !c.is_empty()) {
            debug!("Updates disabled, keeping image {current}");
            return Ok(current.to_owned());
        }
    }

    let manifest = registry
        .manifest_for_tag(&image.registry, &image.repository, &image.tag)
        .await?;

    Ok(image.pinned(&manifest.config_digest))
}
