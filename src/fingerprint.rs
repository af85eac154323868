// mlsaflow: Incremental multi-locus sequence analysis from marker genes to a phylogeny.
//
// Copyright 2025 The mlsaflow authors.
//
// Copyrights in this project are retained by contributors. No copyright assignment
// is required to contribute to this project.
//
// Except as otherwise noted (below and/or in individual files), this
// project is licensed under the Apache License, Version 2.0
// <LICENSE-APACHE> or <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license, <LICENSE-MIT> or <http://opensource.org/licenses/MIT>,
// at your option.
//

//! Content fingerprints for files and canonical snapshots of parameters.
//!
//! A [Fingerprint] identifies the bytes of a file. The file size and
//! modification time are recorded alongside the SHA-256 digest, but only the
//! size is trusted as a shortcut: a size change proves the content changed,
//! an equal size always falls through to hashing. Touched-but-unchanged files
//! and clock skew therefore never change the verdict.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// Fingerprints keyed by the path they were computed from.
pub type FingerprintSet = BTreeMap<String, Fingerprint>;

/// Canonical parameter values keyed by parameter name.
pub type ParameterSnapshot = BTreeMap<String, String>;

/// Identity of a file's content at the time it was fingerprinted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Length of the file in bytes.
    #[serde(default)]
    pub size: u64,
    /// Seconds since the epoch of the last modification, if the filesystem reports it.
    #[serde(default)]
    pub modified: Option<u64>,
    /// Hex encoded SHA-256 of the content.
    #[serde(default)]
    pub digest: String,
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.digest == other.digest
    }
}

impl Eq for Fingerprint {}

impl Fingerprint {
    /// Fingerprint the file at `path`.
    ///
    /// Fails with [InputUnreadable](PipelineError::InputUnreadable) if the
    /// file is missing or cannot be read.
    pub fn of_file(path: &Path) -> Result<Self, PipelineError> {
        let meta = std::fs::metadata(path).map_err(|e| PipelineError::unreadable(path, e))?;
        if !meta.is_file() {
            return Err(PipelineError::unreadable(path, "not a regular file"));
        }
        let modified = meta.modified().ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_secs());
        let digest = digest_file(path)?;
        Ok(Fingerprint { size: meta.len(), modified, digest })
    }

    /// Fingerprint of an in-memory buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = format!("{:x}", Sha256::digest(bytes));
        Fingerprint { size: bytes.len() as u64, modified: None, digest }
    }

    /// Checks whether the file at `path` still has this content.
    ///
    /// A size mismatch answers without reading the file.
    pub fn matches_file(&self, path: &Path) -> Result<bool, PipelineError> {
        let meta = std::fs::metadata(path).map_err(|e| PipelineError::unreadable(path, e))?;
        if meta.len() != self.size {
            return Ok(false)
        }
        Ok(digest_file(path)? == self.digest)
    }
}

fn digest_file(path: &Path) -> Result<String, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::unreadable(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher).map_err(|e| PipelineError::unreadable(path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint every `(key, path)` pair.
pub fn fingerprint_all(files: &[(String, std::path::PathBuf)]) -> Result<FingerprintSet, PipelineError> {
    files.iter().map(|(key, path)| {
        Fingerprint::of_file(path).map(|fp| (key.clone(), fp))
    }).collect()
}

/// Canonical form of a floating point parameter.
///
/// Uses the shortest exponent notation so that `1e-5`, `0.00001` and
/// `1.0e-5` all compare equal.
pub fn canonical_f64(value: f64) -> String {
    format!("{:e}", value)
}

/// Builds a snapshot from name/value pairs.
pub fn snapshot<I, K, V>(params: I) -> ParameterSnapshot
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    params.into_iter().map(|(name, value)| (name.into(), value.to_string())).collect()
}

/// Names of parameters that differ between two snapshots.
pub fn changed_parameters(recorded: &ParameterSnapshot, current: &ParameterSnapshot) -> Vec<String> {
    let mut changed: Vec<String> = current.iter()
        .filter(|(name, value)| recorded.get(*name) != Some(*value))
        .map(|(name, _)| name.clone())
        .collect();
    recorded.keys()
        .filter(|name| !current.contains_key(*name))
        .for_each(|name| changed.push(name.clone()));
    changed.sort();
    changed
}
