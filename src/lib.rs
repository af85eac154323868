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
//! mlsaflow is a library and a command-line client for incremental
//! multi-locus sequence analysis (MLSA):
//!
//!   - Extracting marker gene queries and relabelling genome assemblies.
//!   - Searching every query against every genome.
//!   - Filtering the hits and deciding which genomes enter the analysis.
//!   - Aligning each gene and building a partitioned maximum likelihood tree.
//!
//! The external work is done by:
//!   - [BLAST+](https://blast.ncbi.nlm.nih.gov/) (`makeblastdb`, `blastn` or `tblastn`)
//!   - [MAFFT](https://mafft.cbrc.jp/alignment/software/)
//!   - [IQ-TREE 2](http://www.iqtree.org/)
//!
//! ## Incremental runs
//!
//! A run lives in its own directory named by the run id. Every stage records
//! the content fingerprints of the files it read and the parameters it used
//! in a manifest. On the next invocation with the same run id, the first
//! stage whose inputs or parameters differ and every stage after it are
//! rerun; everything before it is reused. Rerunning with nothing changed
//! does no work at all.
//!
//! The stages, in order:
//!
//!   1. `validate` extract queries and relabel genomes.
//!   2. `preblast` build search indexes and run the searches.
//!   3. `filtering` apply the cutoffs and the missing gene policy.
//!   4. `prealign` collect one FASTA per gene.
//!   5. `postalign` align each gene.
//!   6. `nexus` write the partition file.
//!   7. `tree` build the tree.
//!
//! A checkpoint stops the run after a given stage.
//!
//! ## Usage
//!
//! ### Command line
//!
//! ```text
//! mlsaflow run1 --query markers.fasta --dir genomes/ --threads 8
//! ```
//!
//! Settings are stored in `run1/config.json`, so later invocations only need
//! the options that change.
//!
//! ### Rust API
//!
//! Drive a run through [Pipeline](pipeline::Pipeline). The search, alignment
//! and tree tools are traits in [tools] and can be replaced.
//!
//! The [filter] module is usable on its own for turning search hits into
//! per genome inclusion decisions.

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod manifest;
pub mod pipeline;
pub mod rundir;
pub mod sequences;
pub mod stage;
pub mod staleness;
pub mod tools;

pub use error::PipelineError;
pub use pipeline::Pipeline;
pub use pipeline::RunReport;
pub use stage::Checkpoint;
pub use stage::Stage;

/// Search program for the queries.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Program {
    /// Nucleotide queries.
    Blastn,
    /// Protein queries against translated genomes.
    #[default]
    Tblastn,
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Program::Blastn => write!(f, "blastn"),
            Program::Tblastn => write!(f, "tblastn"),
        }
    }
}

impl std::str::FromStr for Program {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blastn" => Ok(Program::Blastn),
            "tblastn" => Ok(Program::Tblastn),
            _ => Err(format!("'{}' is not a valid Program", s)),
        }
    }
}
