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

//! Persisted record of what every stage consumed when it last succeeded.
//!
//! The manifest lives at `<rundir>/.mlsaflow/manifest.json`. It is read once
//! at the start of a run and rewritten atomically after every completed
//! stage, so an interrupted run leaves it describing exactly the stages that
//! finished.
//!
//! Stage records are keyed by stage name rather than by [Stage] so that a
//! manifest written by a newer version with extra stages or fields still
//! loads; unknown entries are carried along untouched.

use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::fingerprint::FingerprintSet;
use crate::fingerprint::ParameterSnapshot;
use crate::stage::Stage;

/// Format version written by this build.
pub const MANIFEST_VERSION: u32 = 1;

fn default_version() -> u32 {
    MANIFEST_VERSION
}

/// What one stage consumed and produced on its last successful execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Fingerprints of the files the stage read.
    #[serde(default)]
    pub inputs: FingerprintSet,
    /// Fingerprints of the files the stage wrote, relative to the run directory.
    #[serde(default)]
    pub outputs: FingerprintSet,
    /// Parameters that influence the stage's outputs.
    #[serde(default)]
    pub parameters: ParameterSnapshot,
    /// Completion marker.
    #[serde(default)]
    pub completed: bool,
    /// Seconds since the epoch when the stage completed.
    #[serde(default)]
    pub completed_at: u64,
}

impl StageRecord {
    pub fn completed_now(
        inputs: FingerprintSet,
        outputs: FingerprintSet,
        parameters: ParameterSnapshot,
    ) -> Self {
        let completed_at = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        StageRecord { inputs, outputs, parameters, completed: true, completed_at }
    }
}

/// Per-run manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub stages: IndexMap<String, StageRecord>,
}

impl RunManifest {
    pub fn new(run_id: &str) -> Self {
        RunManifest { version: MANIFEST_VERSION, run_id: run_id.to_string(), stages: IndexMap::new() }
    }

    /// Reads the manifest for `run_id` from `path`.
    ///
    /// A missing file starts a fresh manifest. A file that cannot be parsed,
    /// or that belongs to another run, is ignored with a warning; every stage
    /// is then stale, which is always safe.
    pub fn load(path: &Path, run_id: &str) -> Result<Self, PipelineError> {
        if !path.exists() {
            debug!("No manifest at {}, starting a new one", path.display());
            return Ok(RunManifest::new(run_id))
        }
        let contents = std::fs::read_to_string(path)?;
        let manifest: RunManifest = match serde_json::from_str(&contents) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring unreadable manifest {}: {}", path.display(), e);
                return Ok(RunManifest::new(run_id))
            },
        };
        if manifest.run_id != run_id {
            warn!("Manifest {} belongs to run '{}', not '{}'; ignoring it", path.display(), manifest.run_id, run_id);
            return Ok(RunManifest::new(run_id))
        }
        if manifest.version > MANIFEST_VERSION {
            debug!("Manifest version {} is newer than {}; unknown fields are ignored", manifest.version, MANIFEST_VERSION);
        }
        Ok(manifest)
    }

    /// Writes the manifest to `path` through a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let to_err = |reason: String| PipelineError::Manifest { path: path.to_path_buf(), reason };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| to_err(e.to_string()))?;
        {
            let mut conn_out = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut conn_out, self).map_err(|e| to_err(e.to_string()))?;
            conn_out.write_all(b"\n").map_err(|e| to_err(e.to_string()))?;
            conn_out.flush().map_err(|e| to_err(e.to_string()))?;
        }
        tmp.as_file().sync_all().map_err(|e| to_err(e.to_string()))?;
        tmp.persist(path).map_err(|e| to_err(e.error.to_string()))?;
        Ok(())
    }

    /// The record of `stage`, if it has completed.
    pub fn completed(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(stage.name()).filter(|record| record.completed)
    }

    pub fn record(&mut self, stage: Stage, record: StageRecord) {
        self.stages.insert(stage.name().to_string(), record);
    }

    /// Drops the records of `from` and every later stage.
    pub fn invalidate_from(&mut self, from: Stage) {
        Stage::range(from, Stage::Tree).for_each(|stage| {
            self.stages.shift_remove(stage.name());
        });
    }
}
