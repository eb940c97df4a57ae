use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// SHA-256 of a raw input file, hex-encoded for the provenance record.
pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
