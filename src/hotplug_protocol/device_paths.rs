//! Resolving `/dev/bus/usb` style paths to the bus they live on.
//!
//! The attach protocol is keyed on (bus, port); the port comes from the
//! caller, the bus is extracted from the device file path here. The
//! device number in the path only names the open-able file and carries no
//! meaning for the controller's port table.

use std::{
    fs::canonicalize,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Resolve a path of (or a symlink to) a USB device file to its bus
/// number plus the canonical path to open.
pub fn resolve_path<P: AsRef<Path>>(path: P) -> Result<(u8, PathBuf), ResolveError> {
    let canonical_path = canonicalize(path)?;
    let components = canonical_path.iter().collect::<Vec<_>>();
    if components.len() != 6
        || components[0] != "/"
        || components[1] != "dev"
        || components[2] != "bus"
        || components[3] != "usb"
        || components[5]
            .to_str()
            .is_none_or(|dev| dev.parse::<u8>().is_err())
    {
        return Err(ResolveError::UnexpectedPath(canonical_path));
    }

    match components[4].to_str().and_then(|bus| bus.parse::<u8>().ok()) {
        Some(bus) => Ok((bus, canonical_path)),
        None => Err(ResolveError::UnexpectedPath(canonical_path)),
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("Expected a path of (or symlink to) a USB device file (/dev/bus/usb/xxx/yyy), but received (symlink to) path {0}")]
    UnexpectedPath(PathBuf),
}
