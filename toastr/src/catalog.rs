//! The image catalog: the set of images this installation offers for
//! toasting.
//!
//! The catalog is read once at startup. Any problem with it (missing
//! file, malformed JSON) is fatal before a write engine ever runs, so a
//! bad catalog can never interrupt a toast in progress.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// One toastable image.
#[derive(Clone, Debug, Deserialize)]
pub struct CatalogEntry {
    /// Display name shown in the picker (e.g. "Ubuntu 24.04 64 bit").
    pub name: String,
    /// Path to the image file; may be `.gz`/`.xz`/`.zst` compressed.
    pub image: PathBuf,
    /// Logo shown by graphical front-ends; unused by the CLI.
    pub logo: PathBuf,
    /// One-line description shown next to the name.
    pub description: String,
}

/// Loads the catalog from a JSON file.
///
/// # Errors
///
/// Fails if the file cannot be read or does not hold a JSON array of
/// catalog entries; serde's message carries the offending line and
/// column.
pub fn load(path: &Path) -> Result<Vec<CatalogEntry>> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read image catalog {}", path.display()))?;
    let entries: Vec<CatalogEntry> = serde_json::from_slice(&bytes)
        .with_context(|| format!("malformed image catalog {}", path.display()))?;
    Ok(entries)
}
