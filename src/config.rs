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

//! Reconciled run settings.
//!
//! Settings come from, highest precedence first: the command line, the run
//! directory's `config.json`, a config file given with `--config`, and the
//! built-in defaults. The reconciled result is written back to the run
//! directory so that a rerun with only the run id repeats the same analysis.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::fingerprint::canonical_f64;
use crate::fingerprint::snapshot;
use crate::fingerprint::ParameterSnapshot;
use crate::sequences::genome_name;
use crate::sequences::looks_like_fasta;
use crate::stage::Stage;
use crate::Program;

pub const DEFAULT_EVALUE: f64 = 1e-5;
pub const DEFAULT_COVERAGE: f64 = 50.0;
pub const DEFAULT_IDENTITY: f64 = 30.0;
pub const DEFAULT_ALIGNER_OPTIONS: &str = "--localpair --maxiterate 1000";
pub const DEFAULT_TREE_OPTIONS: &str = "-m MFP -B 1000";

/// Every setting that shapes a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Query FASTA files with one or more marker genes each.
    pub query: Vec<PathBuf>,
    /// Genome FASTA files.
    pub files: Vec<PathBuf>,
    /// Directories scanned for genome FASTA files.
    pub dir: Vec<PathBuf>,
    pub evalue: f64,
    pub coverage: f64,
    pub identity: f64,
    pub program: Program,
    pub threads: usize,
    /// Allow several query sequences per gene label.
    pub dups: bool,
    pub allow_missing: usize,
    /// Acknowledges that genomes missing genes may be dropped.
    pub missing_check: bool,
    pub outgroup: Option<String>,
    /// Back up stale artifacts instead of deleting them.
    pub protect: bool,
    /// Extra aligner options.
    pub mafft: String,
    /// Extra tree builder options.
    pub iqtree: String,
    /// Directory holding the external executables.
    pub external: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            query: Vec::new(),
            files: Vec::new(),
            dir: Vec::new(),
            evalue: DEFAULT_EVALUE,
            coverage: DEFAULT_COVERAGE,
            identity: DEFAULT_IDENTITY,
            program: Program::default(),
            threads: 1,
            dups: false,
            allow_missing: 0,
            missing_check: false,
            outgroup: None,
            protect: false,
            mafft: DEFAULT_ALIGNER_OPTIONS.to_string(),
            iqtree: DEFAULT_TREE_OPTIONS.to_string(),
            external: None,
        }
    }
}

/// Settings given on the command line; `None` and `false` defer to stored values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub query: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
    pub dir: Vec<PathBuf>,
    pub evalue: Option<f64>,
    pub coverage: Option<f64>,
    pub identity: Option<f64>,
    pub program: Option<Program>,
    pub threads: Option<usize>,
    pub dups: bool,
    pub allow_missing: Option<usize>,
    pub missing_check: bool,
    pub outgroup: Option<String>,
    pub protect: bool,
    pub mafft: Option<String>,
    pub iqtree: Option<String>,
    pub external: Option<PathBuf>,
}

fn merge_paths(first: Vec<PathBuf>, second: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    first.into_iter().chain(second)
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Makes `path` absolute against the current directory.
pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    }
}

impl Config {
    /// Reads a JSON config file. Unknown keys are ignored, missing keys defaulted.
    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        info!("Reading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|e| PipelineError::unreadable(path, e))?;
        serde_json::from_str(&contents).map_err(|e| {
            PipelineError::ConfigurationError(format!("{} is not a valid config file: {}", path.display(), e))
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        debug!("Writing configuration to {}", path.display());
        let mut contents = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::ConfigurationError(e.to_string()))?;
        contents.push('\n');
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Finds the stored config for a run.
    ///
    /// The run directory's own config wins over `copy_from`, which is only
    /// used to seed a new run.
    pub fn stored(run_config: &Path, copy_from: Option<&Path>) -> Result<Option<Self>, PipelineError> {
        if run_config.exists() {
            if let Some(other) = copy_from {
                warn!("Ignoring {} as the run already has {}", other.display(), run_config.display());
            }
            return Config::read(run_config).map(Some)
        }
        copy_from.map(Config::read).transpose()
    }

    /// Layers command line settings over a stored config.
    ///
    /// Path lists are merged. Stored genome files that no longer exist are
    /// dropped so that a genome deleted between runs simply leaves the
    /// analysis.
    pub fn reconcile(cli: Overrides, stored: Option<Config>) -> Self {
        let stored = stored.unwrap_or_default();

        let kept_files: Vec<PathBuf> = stored.files.into_iter().filter(|file| {
            let exists = file.exists();
            if !exists {
                warn!("Genome {} from the stored config no longer exists; dropping it", file.display());
            }
            exists
        }).collect();

        Config {
            query: merge_paths(cli.query, stored.query),
            files: merge_paths(cli.files, kept_files),
            dir: merge_paths(cli.dir, stored.dir),
            evalue: cli.evalue.unwrap_or(stored.evalue),
            coverage: cli.coverage.unwrap_or(stored.coverage),
            identity: cli.identity.unwrap_or(stored.identity),
            program: cli.program.unwrap_or(stored.program),
            threads: cli.threads.unwrap_or(stored.threads),
            dups: cli.dups || stored.dups,
            allow_missing: cli.allow_missing.unwrap_or(stored.allow_missing),
            missing_check: cli.missing_check || stored.missing_check,
            outgroup: cli.outgroup.or(stored.outgroup).filter(|name| !name.is_empty()),
            protect: cli.protect || stored.protect,
            mafft: cli.mafft.unwrap_or(stored.mafft),
            iqtree: cli.iqtree.unwrap_or(stored.iqtree),
            external: cli.external.or(stored.external),
        }
    }

    /// Rejects out of range or contradictory settings.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::ConfigurationError(msg));
        if !(self.evalue > 0.0 && self.evalue <= 10.0) {
            return fail(format!("evalue {} must be above 0 and at most 10", self.evalue))
        }
        if !(0.0..=100.0).contains(&self.coverage) {
            return fail(format!("coverage {} must be between 0 and 100", self.coverage))
        }
        if !(0.0..=100.0).contains(&self.identity) {
            return fail(format!("identity {} must be between 0 and 100", self.identity))
        }
        if self.threads == 0 {
            return fail("threads must be at least 1".to_string())
        }
        if self.query.is_empty() {
            return fail("no query files given; use --query".to_string())
        }
        if self.files.is_empty() && self.dir.is_empty() {
            return fail("no genomes given; use --files or --dir".to_string())
        }
        if shlex::split(&self.mafft).is_none() {
            return fail(format!("cannot parse aligner options '{}'", self.mafft))
        }
        if shlex::split(&self.iqtree).is_none() {
            return fail(format!("cannot parse tree options '{}'", self.iqtree))
        }
        Ok(())
    }

    /// Every genome file of the run, directories scanned in sorted order.
    ///
    /// Two different paths with the same genome name are ambiguous and
    /// rejected, since the name labels the genome everywhere downstream.
    pub fn genome_files(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let mut found: Vec<PathBuf> = Vec::new();
        for dir in self.dir.iter() {
            let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::unreadable(dir, e))?;
            let mut fastas: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file())
                .filter(|path| {
                    let is_fasta = looks_like_fasta(path);
                    if !is_fasta {
                        debug!("{} does not look like FASTA, skipping", path.display());
                    }
                    is_fasta
                })
                .collect();
            fastas.sort();
            found.append(&mut fastas);
        }
        for file in self.files.iter() {
            if !file.is_file() {
                return Err(PipelineError::unreadable(file, "no such file"))
            }
            found.push(file.clone());
        }
        let found = merge_paths(found, Vec::new());

        let mut names: std::collections::HashMap<String, &PathBuf> = std::collections::HashMap::new();
        for path in found.iter() {
            let name = genome_name(path);
            if let Some(other) = names.insert(name.clone(), path) {
                return Err(PipelineError::ConfigurationError(format!(
                    "genome name {} found in two locations: {} and {}; remove or rename one",
                    name, other.display(), path.display())))
            }
        }
        Ok(found)
    }

    pub fn aligner_options(&self) -> Vec<String> {
        shlex::split(&self.mafft).unwrap_or_default()
    }

    pub fn tree_options(&self) -> Vec<String> {
        shlex::split(&self.iqtree).unwrap_or_default()
    }

    /// Parameters that shape the outputs of `stage`.
    pub fn stage_parameters(&self, stage: Stage) -> ParameterSnapshot {
        match stage {
            Stage::Validate => snapshot([("dups", self.dups.to_string())]),
            Stage::Preblast => snapshot([
                ("program", self.program.to_string()),
                ("evalue", canonical_f64(self.evalue)),
            ]),
            Stage::Filtering => snapshot([
                ("evalue", canonical_f64(self.evalue)),
                ("coverage", canonical_f64(self.coverage)),
                ("identity", canonical_f64(self.identity)),
                ("dups", self.dups.to_string()),
                ("allow_missing", self.allow_missing.to_string()),
            ]),
            Stage::Prealign => ParameterSnapshot::new(),
            Stage::Postalign => snapshot([("aligner_options", self.aligner_options().join(" "))]),
            Stage::Nexus => ParameterSnapshot::new(),
            Stage::Tree => snapshot([
                ("outgroup", self.outgroup.clone().unwrap_or_default()),
                ("tree_options", self.tree_options().join(" ")),
            ]),
        }
    }
}
