//! Upgrade and downgrade admission

use crate::error::{Error, Result};
use semver::Version;
use std::cmp::Ordering;

fn parse(version: &str) -> Option<Version> {
    Version::parse(version.strip_prefix('v').unwrap_or(version)).ok()
}

/// Decide whether moving from `observed` to `target` is an upgrade.
///
/// An empty `observed` is a fresh install, not an upgrade. Versions that do
/// not parse as semver never block progress; only a verifiably older target
/// is refused.
pub fn can_upgrade(observed: &str, target: &str) -> Result<bool> {
    if observed.is_empty() || observed == target {
        return Ok(false);
    }

    match (parse(observed), parse(target)) {
        (Some(observed_v), Some(target_v)) => match target_v.cmp(&observed_v) {
            Ordering::Less => Err(Error::Downgrade {
                observed: observed_v.to_string(),
                target: target_v.to_string(),
            }),
            Ordering::Equal => Ok(false),
            Ordering::Greater => Ok(true),
        },
        _ => Ok(true),
    }
}
