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

//! On-disk layout of one run.
//!
//! Everything a run produces lives under `<parent>/<run_id>/`. The layout is
//! fixed so that a rerun finds the artifacts of the previous one.

use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::{debug, info};

use crate::error::PipelineError;
use crate::stage::Stage;

/// Directory for state that belongs to the run but not to any one stage.
pub const STATE_DIR: &str = ".mlsaflow";

/// What to do with the artifacts of a stage that reruns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverwritePolicy {
    #[default]
    Overwrite,
    /// Move into `backup/<stamp>/` instead of deleting.
    Protect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    root: PathBuf,
    run_id: String,
}

impl RunDir {
    /// Opens `<parent>/<run_id>`, creating it on first use.
    pub fn create(parent: &Path, run_id: &str) -> Result<Self, PipelineError> {
        if run_id.is_empty() || run_id == "." || run_id == ".." || run_id.contains(['/', '\\']) {
            return Err(PipelineError::ConfigurationError(format!("'{}' is not a valid run id", run_id)))
        }
        let rundir = RunDir { root: parent.join(run_id), run_id: run_id.to_string() };
        if !rundir.root.exists() {
            info!("Creating run directory {}", rundir.root.display());
        }
        std::fs::create_dir_all(rundir.state_dir())?;
        std::fs::create_dir_all(rundir.backup_dir())?;
        Ok(rundir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state_dir(&self) -> PathBuf { self.root.join(STATE_DIR) }
    pub fn backup_dir(&self) -> PathBuf { self.root.join("backup") }
    pub fn config(&self) -> PathBuf { self.root.join("config.json") }
    pub fn manifest(&self) -> PathBuf { self.state_dir().join("manifest.json") }
    pub fn labels(&self) -> PathBuf { self.state_dir().join("labels.json") }
    pub fn genomes(&self) -> PathBuf { self.state_dir().join("genomes.json") }
    pub fn inclusion(&self) -> PathBuf { self.state_dir().join("inclusion.json") }
    /// Filtering results left for review when genomes would be excluded for
    /// missing genes. Not a stage artifact.
    pub fn review_dir(&self) -> PathBuf { self.state_dir().join("missing_review") }

    pub fn queries_dir(&self) -> PathBuf { self.root.join("queries") }
    pub fn fasta_dir(&self) -> PathBuf { self.root.join("fasta") }
    pub fn blastdb_dir(&self) -> PathBuf { self.root.join("blastdb") }
    pub fn blast_dir(&self) -> PathBuf { self.root.join("blast") }
    pub fn filtered_hits(&self) -> PathBuf { self.root.join("filtered_hits.tsv") }
    pub fn presence_matrix(&self) -> PathBuf { self.root.join("presence_matrix.tsv") }
    pub fn search_summary(&self) -> PathBuf { self.root.join("blast_summary.json") }
    pub fn unaligned_dir(&self) -> PathBuf { self.root.join("unaligned") }
    pub fn aligned_dir(&self) -> PathBuf { self.root.join("aligned") }

    pub fn nexus(&self) -> PathBuf {
        self.root.join(format!("{}.nex", self.run_id))
    }

    pub fn treefile(&self) -> PathBuf {
        self.root.join(format!("{}.nex.treefile", self.run_id))
    }

    /// Files and directories `stage` writes. Tree outputs are named by the
    /// tree builder, so those are whatever `<run_id>.nex.*` currently exists.
    ///
    /// The genome labels are not listed: they are append-only run state that
    /// survives reruns.
    pub fn artifacts(&self, stage: Stage) -> Result<Vec<PathBuf>, PipelineError> {
        let paths = match stage {
            Stage::Validate => vec![self.queries_dir(), self.fasta_dir(), self.genomes()],
            Stage::Preblast => vec![self.blastdb_dir(), self.blast_dir()],
            Stage::Filtering => vec![self.filtered_hits(), self.presence_matrix(), self.search_summary(), self.inclusion()],
            Stage::Prealign => vec![self.unaligned_dir()],
            Stage::Postalign => vec![self.aligned_dir()],
            Stage::Nexus => vec![self.nexus()],
            Stage::Tree => {
                let prefix = format!("{}.nex.", self.run_id);
                let mut outputs: Vec<PathBuf> = std::fs::read_dir(&self.root)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.file_name().is_some_and(|n| n.to_string_lossy().starts_with(&prefix)))
                    .collect();
                outputs.sort();
                outputs
            },
        };
        Ok(paths)
    }

    /// Key a path is recorded under in the manifest.
    ///
    /// Paths inside the run directory are stored relative to it so that the
    /// run directory can be moved; anything else keeps its absolute path.
    pub fn key(&self, path: &Path) -> String {
        path.strip_prefix(&self.root).unwrap_or(path).to_string_lossy().to_string()
    }

    /// Inverse of [RunDir::key].
    pub fn locate(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Regular files directly inside `dir`, sorted; empty if `dir` is missing.
    pub fn files_in(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        if !dir.is_dir() {
            return Ok(Vec::new())
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Every file `stage` produced, keyed for the manifest.
    pub fn outputs(&self, stage: Stage) -> Result<Vec<(String, PathBuf)>, PipelineError> {
        let mut outputs: Vec<(String, PathBuf)> = Vec::new();
        for artifact in self.artifacts(stage)? {
            if artifact.is_dir() {
                for file in RunDir::files_in(&artifact)? {
                    outputs.push((self.key(&file), file));
                }
            } else if artifact.is_file() {
                outputs.push((self.key(&artifact), artifact));
            }
        }
        Ok(outputs)
    }

    fn new_backup(&self) -> Result<PathBuf, PipelineError> {
        let stamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
        let mut dir = self.backup_dir().join(stamp.to_string());
        let mut attempt = 1;
        while dir.exists() {
            dir = self.backup_dir().join(format!("{}-{}", stamp, attempt));
            attempt += 1;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Removes or backs up the artifacts of every stage in `stages`.
    ///
    /// All stages of one call share a single backup directory.
    pub fn clear_stages(&self, stages: &[Stage], policy: OverwritePolicy) -> Result<(), PipelineError> {
        let mut artifacts: Vec<PathBuf> = Vec::new();
        for stage in stages {
            artifacts.extend(self.artifacts(*stage)?.into_iter().filter(|path| path.exists()));
        }
        if artifacts.is_empty() {
            return Ok(())
        }

        let backup = match policy {
            OverwritePolicy::Protect => Some(self.new_backup()?),
            OverwritePolicy::Overwrite => None,
        };
        for artifact in artifacts {
            match &backup {
                Some(dir) => {
                    let dest = dir.join(self.key(&artifact));
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    debug!("Backing up {} to {}", artifact.display(), dest.display());
                    std::fs::rename(&artifact, &dest)?;
                },
                None if artifact.is_dir() => {
                    debug!("Removing {}", artifact.display());
                    std::fs::remove_dir_all(&artifact)?;
                },
                None => {
                    debug!("Removing {}", artifact.display());
                    std::fs::remove_file(&artifact)?;
                },
            }
        }
        if let Some(dir) = backup {
            info!("Previous results saved in {}", dir.display());
        }
        Ok(())
    }
}
