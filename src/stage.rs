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

//! The seven pipeline stages and the checkpoint a run stops at.

use serde::{Deserialize, Serialize};

/// One step of the pipeline.
///
/// Stages form a strict total order given by their declaration order. Each
/// stage depends only on the stage immediately before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Reconcile inputs, extract query sequences and relabel genomes.
    Validate,
    /// Build search indexes and run every genome × query search.
    Preblast,
    /// Apply cutoffs and the missing-gene policy to the search hits.
    Filtering,
    /// Write one unaligned FASTA per gene.
    Prealign,
    /// Align every gene.
    Postalign,
    /// Write the partition file pointing at the alignments.
    Nexus,
    /// Build the tree.
    Tree,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Validate,
        Stage::Preblast,
        Stage::Filtering,
        Stage::Prealign,
        Stage::Postalign,
        Stage::Nexus,
        Stage::Tree,
    ];

    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Preblast => "preblast",
            Stage::Filtering => "filtering",
            Stage::Prealign => "prealign",
            Stage::Postalign => "postalign",
            Stage::Nexus => "nexus",
            Stage::Tree => "tree",
        }
    }

    /// Stages from `from` through `to`, both inclusive.
    pub fn range(from: Stage, to: Stage) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |stage| *stage >= from && *stage <= to)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validate" => Ok(Stage::Validate),
            "preblast" => Ok(Stage::Preblast),
            "filtering" => Ok(Stage::Filtering),
            "prealign" => Ok(Stage::Prealign),
            "postalign" => Ok(Stage::Postalign),
            "nexus" => Ok(Stage::Nexus),
            "tree" => Ok(Stage::Tree),
            _ => Err(format!("'{}' is not a valid Stage", s)),
        }
    }
}

/// Where a run halts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Checkpoint {
    /// Stop successfully after this stage completes.
    At(Stage),
    /// Run to completion.
    #[default]
    None,
}

impl Checkpoint {
    /// Last stage this run is allowed to execute.
    pub fn last_stage(&self) -> Stage {
        match self {
            Checkpoint::At(stage) => *stage,
            Checkpoint::None => Stage::Tree,
        }
    }

    /// True if the run halts before building the tree.
    pub fn stops_early(&self) -> bool {
        self.last_stage() != Stage::Tree
    }
}

impl std::str::FromStr for Checkpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Checkpoint::None),
            _ => s.parse::<Stage>().map(Checkpoint::At),
        }
    }
}

// Tests
#[cfg(test)]
mod tests {

    #[test]
    fn stages_are_totally_ordered() {
        use super::Stage;

        let names: Vec<&str> = Stage::ALL.iter().map(|stage| stage.name()).collect();
        assert_eq!(names, vec!["validate", "preblast", "filtering", "prealign", "postalign", "nexus", "tree"]);

        Stage::ALL.windows(2).for_each(|pair| {
            assert!(pair[0] < pair[1]);
        });
    }

    #[test]
    fn range_is_inclusive() {
        use super::Stage;

        let got: Vec<Stage> = Stage::range(Stage::Filtering, Stage::Postalign).collect();
        assert_eq!(got, vec![Stage::Filtering, Stage::Prealign, Stage::Postalign]);
    }

    #[test]
    fn parse_checkpoint() {
        use super::{Checkpoint, Stage};

        assert_eq!("none".parse::<Checkpoint>(), Ok(Checkpoint::None));
        assert_eq!("prealign".parse::<Checkpoint>(), Ok(Checkpoint::At(Stage::Prealign)));
        assert!("align".parse::<Checkpoint>().is_err());

        assert_eq!(Checkpoint::None.last_stage(), Stage::Tree);
        assert!(Checkpoint::At(Stage::Nexus).stops_early());
        assert!(!Checkpoint::None.stops_early());
    }

    #[test]
    fn stage_names_roundtrip_through_serde() {
        use super::Stage;

        let json = serde_json::to_string(&Stage::Postalign).unwrap();
        assert_eq!(json, "\"postalign\"");
        let back: Stage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Stage::Postalign);
    }
}
