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
use std::path::PathBuf;

use clap::Parser;

use mlsaflow::config::Overrides;
use mlsaflow::stage::Checkpoint;
use mlsaflow::Program;

#[derive(Parser)]
#[command(version)]
#[command(about = "Incremental multi-locus sequence analysis from marker genes to a phylogeny.")]
#[command(after_help = "Quick usage: mlsaflow --dir genomes/ --query queries.fas -t 8 -- run1")]
pub struct Cli {
    // Name of the run directory
    #[arg(help = "Name of the run directory")]
    pub runid: String,

    // Query sequences
    #[arg(long = "query", num_args = 1.., help = "FASTA file(s) with the marker gene queries")]
    pub query: Vec<PathBuf>,

    // Genome files
    #[arg(long = "files", num_args = 1.., help = "Genome FASTA file(s)")]
    pub files: Vec<PathBuf>,

    // Genome directories
    #[arg(long = "dir", num_args = 1.., help = "Directory(ies) of genome FASTA files")]
    pub dir: Vec<PathBuf>,

    // Cutoffs
    #[arg(short = 'e', long = "evalue", help = "E-value cutoff for the searches [1e-5]")]
    pub evalue: Option<f64>,
    #[arg(short = 'c', long = "coverage", help = "Minimum percent query coverage [50]")]
    pub coverage: Option<f64>,
    #[arg(short = 'i', long = "identity", help = "Minimum percent identity [30]")]
    pub identity: Option<f64>,

    // Search program
    #[arg(short = 'p', long = "program", help = "blastn or tblastn [tblastn]")]
    pub program: Option<Program>,

    // Config to copy into a new run
    #[arg(long = "config", help = "Configuration JSON to seed a new run with")]
    pub config: Option<PathBuf>,

    // Acknowledge genomes dropped for missing genes
    #[arg(long = "missing_check", default_value_t = false, help = "Confirm that genomes missing genes may be excluded")]
    pub missing_check: bool,

    // Resources
    #[arg(short = 't', long = "threads", help = "Number of worker threads [1]")]
    pub threads: Option<usize>,

    // Query policy
    #[arg(long = "dups", default_value_t = false, help = "Allow several queries with the same gene name")]
    pub dups: bool,
    #[arg(long = "allow_missing", help = "Genes a genome may miss and still be kept [0]")]
    pub allow_missing: Option<usize>,

    // Rooting
    #[arg(long = "outgroup", help = "Genome name or file to root the tree on")]
    pub outgroup: Option<String>,

    // Keep stale results in backup/
    #[arg(long = "protect", default_value_t = false, help = "Back up stale results instead of deleting them")]
    pub protect: bool,

    // Stop after this stage
    #[arg(long = "checkpoint", default_value = "none", help = "Stage to stop after, or none")]
    pub checkpoint: Checkpoint,

    // External tools
    #[arg(long = "external", help = "Directory with the external programs")]
    pub external: Option<PathBuf>,
    #[arg(long = "mafft", allow_hyphen_values = true, help = "MAFFT options [--localpair --maxiterate 1000]")]
    pub mafft: Option<String>,
    #[arg(long = "iqtree", allow_hyphen_values = true, help = "IQ-TREE options [-m MFP -B 1000]")]
    pub iqtree: Option<String>,

    // Verbosity
    #[arg(long = "debug", default_value_t = false)]
    pub debug: bool,
    #[arg(long = "quiet", default_value_t = false)]
    pub quiet: bool,
}

impl Cli {
    /// Settings given on the command line, paths made absolute.
    pub fn overrides(&self) -> Overrides {
        let absolute = |paths: &[PathBuf]| -> Vec<PathBuf> { paths.iter().map(|p| mlsaflow::config::absolute(p)).collect() };
        Overrides {
            query: absolute(&self.query),
            files: absolute(&self.files),
            dir: absolute(&self.dir),
            evalue: self.evalue,
            coverage: self.coverage,
            identity: self.identity,
            program: self.program,
            threads: self.threads,
            dups: self.dups,
            allow_missing: self.allow_missing,
            missing_check: self.missing_check,
            outgroup: self.outgroup.clone(),
            protect: self.protect,
            mafft: self.mafft.clone(),
            iqtree: self.iqtree.clone(),
            external: self.external.as_deref().map(mlsaflow::config::absolute),
        }
    }

    /// stderrlog verbosity: 1 warnings, 2 info, 3 debug.
    pub fn verbosity(&self) -> usize {
        if self.debug {
            3
        } else if self.quiet {
            1
        } else {
            2
        }
    }
}
