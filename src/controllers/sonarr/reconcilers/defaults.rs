use std::fmt;

use crate::resources::sonarrs::SonarrSpec;

pub const DEFAULT_IMAGE: &str = "quay.io/parflesh/sonarr:latest";
pub const DEFAULT_WATCH_FREQUENCY: &str = "1m";

/// A spec field that was empty and has been given its default
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultedField {
    Image,
    WatchFrequency,
}

impl fmt::Display for DefaultedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultedField::Image => f.write_str("image not set"),
            DefaultedField::WatchFrequency => f.write_str("watch frequency not set"),
        }
    }
}

/// Fill the first unset defaultable field of `spec`.
///
/// Returns the field that was filled, in which case the spec has to be persisted
/// before anything else happens. `None` means the spec is complete.
pub fn apply_defaults(spec: &mut SonarrSpec) -> Option<DefaultedField> {
    if spec.image().is_none() {
        spec.image = Some(DEFAULT_IMAGE.into());
        return Some(DefaultedField::Image);
    }
    if spec.watch_frequency().is_none() {
        spec.watch_frequency = Some(DEFAULT_WATCH_FREQUENCY.into());
        return Some(DefaultedField::WatchFrequency);
    }
    None
}
