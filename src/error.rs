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

//! Errors that stop a run.
//!
//! Recoverable conditions (genomes filtered out for missing genes or
//! duplicated content) are not errors; they are collected as
//! [Exclusion](crate::filter::Exclusion) records in the
//! [RunReport](crate::pipeline::RunReport).

use std::path::PathBuf;

use crate::filter::Exclusion;

/// Fatal pipeline error.
#[non_exhaustive]
#[derive(Debug)]
pub enum PipelineError {
    /// A declared input file is missing or unreadable.
    InputUnreadable { path: PathBuf, reason: String },
    /// Invalid or contradictory settings, unresolvable outgroup etc.
    ConfigurationError(String),
    /// Search index building or searching failed, or produced malformed output.
    SearchToolFailure(String),
    /// The alignment tool exited with an error.
    AlignmentToolFailure(String),
    /// The tree building tool exited with an error or produced no tree.
    TreeToolFailure(String),
    /// Genomes would be dropped for missing genes but `--missing_check` was not given.
    ///
    /// `exclusions` lists every genome the filter would drop and why;
    /// `review` holds the presence matrix and summaries to look at first.
    MissingGenesWithoutAck { genomes: Vec<String>, exclusions: Vec<Exclusion>, review: PathBuf },
    /// The run manifest could not be written.
    Manifest { path: PathBuf, reason: String },
    /// Other I/O on the run directory.
    Io(std::io::Error),
}

impl PipelineError {
    pub fn unreadable(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        PipelineError::InputUnreadable { path: path.to_path_buf(), reason: reason.to_string() }
    }

    /// Process exit code for the error, following sysexits.h.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::InputUnreadable { .. } => 66,
            PipelineError::ConfigurationError(_) => 78,
            PipelineError::MissingGenesWithoutAck { .. } => 78,
            PipelineError::SearchToolFailure(_) => 70,
            PipelineError::AlignmentToolFailure(_) => 70,
            PipelineError::TreeToolFailure(_) => 70,
            PipelineError::Manifest { .. } => 74,
            PipelineError::Io(_) => 74,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PipelineError::InputUnreadable { path, reason } => {
                write!(f, "Input {} is unreadable: {}", path.display(), reason)
            },
            PipelineError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::SearchToolFailure(msg) => write!(f, "Search tool failed: {}", msg),
            PipelineError::AlignmentToolFailure(msg) => write!(f, "Alignment tool failed: {}", msg),
            PipelineError::TreeToolFailure(msg) => write!(f, "Tree tool failed: {}", msg),
            PipelineError::MissingGenesWithoutAck { genomes, review, .. } => {
                write!(f, "{} genome(s) are missing genes ({}); review {} and rerun with --missing_check to continue without them",
                       genomes.len(), genomes.join(", "), review.display())
            },
            PipelineError::Manifest { path, reason } => {
                write!(f, "Run manifest {} could not be written: {}", path.display(), reason)
            },
            PipelineError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}
