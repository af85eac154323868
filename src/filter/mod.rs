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

//! Cutoff filter: turns raw search hits into per genome inclusion decisions.
//!
//! The filter is a pure function of the hits and the policy parameters. It
//! runs in three steps:
//!
//!   1. Drop hits that fail the evalue, coverage or identity cutoffs.
//!   2. Keep the best remaining hit per (genome, gene) pair.
//!   3. Count the genes each genome has no hit for and compare against
//!      `allow_missing`.
//!
//! Query sequences that share a gene label are alternative probes for the
//! same gene, so step 2 keys on the gene label and not on the query sequence.
//!
//! ## Tie-breaking
//!
//! Among qualifying hits for the same pair, the lowest evalue wins. Equal
//! evalues are broken by the highest percent identity, then the highest
//! coverage, then by whichever hit came first in the search output.
//!
//! ## Usage
//!
//! ```rust
//! use mlsaflow::filter::{filter_hits, Cutoffs, HitRecord, Inclusion, Policy};
//!
//! let hit = |genome: &str, gene: &str, evalue: f64| HitRecord {
//!     genome: genome.to_string(), gene: gene.to_string(), query: gene.to_string(),
//!     evalue, identity: 90.0, coverage: 95.0, start: 1, end: 300, sequence: "ACGT".to_string(),
//! };
//! let hits = vec![hit("G", "A", 1e-10), hit("G", "B", 1e-3)];
//! let genomes = vec!["G".to_string()];
//! let genes = vec!["A".to_string(), "B".to_string()];
//!
//! let cutoffs = Cutoffs { evalue: 1e-5, coverage: 50.0, identity: 30.0 };
//! let outcome = filter_hits(&hits, &genomes, &genes, &cutoffs, &Policy { allow_missing: 0 });
//!
//! assert_eq!(outcome.decisions["G"], Inclusion::ExcludedMissingGenes { missing: vec!["B".to_string()] });
//! ```

pub mod presence;
pub mod summary;

use std::cmp::Ordering;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use presence::PresenceMatrix;

/// Share of genomes a gene may be missing from before it is flagged as a
/// removal candidate.
pub const MISSING_GENE_WARN_PERCENT: f64 = 50.0;

/// One hit from the search stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitRecord {
    /// Genome the hit is on.
    pub genome: String,
    /// Gene label of the query.
    pub gene: String,
    /// The query sequence that produced the hit.
    pub query: String,
    pub evalue: f64,
    /// Percent identity.
    pub identity: f64,
    /// Percent query coverage.
    pub coverage: f64,
    /// Subject start coordinate.
    pub start: u64,
    /// Subject end coordinate.
    pub end: u64,
    /// Aligned subject sequence, may contain gaps.
    pub sequence: String,
}

/// Thresholds a hit must meet.
#[derive(Debug, Clone, PartialEq)]
pub struct Cutoffs {
    /// Maximum evalue.
    pub evalue: f64,
    /// Minimum percent coverage.
    pub coverage: f64,
    /// Minimum percent identity.
    pub identity: f64,
}

impl Cutoffs {
    pub fn passes(&self, hit: &HitRecord) -> bool {
        hit.evalue <= self.evalue && hit.coverage >= self.coverage && hit.identity >= self.identity
    }
}

/// Missing-gene policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Number of genes a genome may lack and still be kept.
    pub allow_missing: usize,
}

/// Decision for one genome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Inclusion {
    /// Kept; `missing` lists genes tolerated through `allow_missing`.
    Included { missing: Vec<String> },
    /// Dropped for lacking more genes than allowed.
    ExcludedMissingGenes { missing: Vec<String> },
    /// Dropped because its content duplicates genome `of`.
    ExcludedDuplicate { of: String },
}

impl Inclusion {
    pub fn is_included(&self) -> bool {
        matches!(self, Inclusion::Included { .. })
    }
}

/// A genome that did not make it into the tree, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub genome: String,
    pub reason: String,
}

impl Exclusion {
    /// Exclusion for `genome`, or None if `decision` keeps it.
    pub fn from_decision(genome: &str, decision: &Inclusion) -> Option<Self> {
        let reason = match decision {
            Inclusion::Included { .. } => return None,
            Inclusion::ExcludedMissingGenes { missing } if missing.len() == 1 => {
                format!("missing gene {}", missing[0])
            },
            Inclusion::ExcludedMissingGenes { missing } => {
                format!("missing {} genes: {}", missing.len(), missing.join(", "))
            },
            Inclusion::ExcludedDuplicate { of } => format!("duplicate of {}", of),
        };
        Some(Exclusion { genome: genome.to_string(), reason })
    }
}

/// Everything the filtering stage derives from the hits.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Best qualifying hit per (genome, gene), in first-seen order.
    pub best: IndexMap<(String, String), HitRecord>,
    /// Decision per genome, in the order the genomes were given.
    pub decisions: IndexMap<String, Inclusion>,
    /// Qualifying hit presence, genes × genomes.
    pub presence: PresenceMatrix,
    /// Genes missing from more than [MISSING_GENE_WARN_PERCENT] of genomes.
    pub removal_candidates: Vec<(String, f64)>,
}

impl FilterOutcome {
    pub fn exclusions(&self) -> Vec<Exclusion> {
        self.decisions.iter()
            .filter_map(|(genome, decision)| Exclusion::from_decision(genome, decision))
            .collect()
    }

    pub fn included(&self) -> Vec<String> {
        self.decisions.iter()
            .filter(|(_, decision)| decision.is_included())
            .map(|(genome, _)| genome.clone())
            .collect()
    }
}

/// Orders `a` before `b` if `a` is the better hit.
///
/// Equal hits compare as [Ordering::Equal] so that a stable selection keeps
/// the first one seen.
pub fn compare_hits(a: &HitRecord, b: &HitRecord) -> Ordering {
    a.evalue.total_cmp(&b.evalue)
        .then_with(|| b.identity.total_cmp(&a.identity))
        .then_with(|| b.coverage.total_cmp(&a.coverage))
}

/// Best qualifying hit per (genome, gene) pair.
pub fn select_best_hits(
    hits: &[HitRecord],
    cutoffs: &Cutoffs,
) -> IndexMap<(String, String), HitRecord> {
    let mut best: IndexMap<(String, String), HitRecord> = IndexMap::new();
    hits.iter().filter(|hit| cutoffs.passes(hit)).for_each(|hit| {
        let key = (hit.genome.clone(), hit.gene.clone());
        match best.get_mut(&key) {
            Some(current) => {
                if compare_hits(hit, current) == Ordering::Less {
                    *current = hit.clone();
                }
            },
            None => {
                best.insert(key, hit.clone());
            },
        }
    });
    best
}

/// Applies the missing-gene policy to every genome.
///
/// A genome lacking exactly `allow_missing` genes is kept; one more and it is
/// excluded.
pub fn decide_inclusion(
    genomes: &[String],
    genes: &[String],
    presence: &PresenceMatrix,
    policy: &Policy,
) -> IndexMap<String, Inclusion> {
    genomes.iter().map(|genome| {
        let missing: Vec<String> = genes.iter()
            .filter(|gene| !presence.has(genome, gene))
            .cloned()
            .collect();
        let decision = if missing.len() > policy.allow_missing {
            Inclusion::ExcludedMissingGenes { missing }
        } else {
            Inclusion::Included { missing }
        };
        (genome.clone(), decision)
    }).collect()
}

/// Runs the whole filter.
///
/// `genomes` and `genes` fix the output order; hits on genomes or genes not
/// listed are ignored.
pub fn filter_hits(
    hits: &[HitRecord],
    genomes: &[String],
    genes: &[String],
    cutoffs: &Cutoffs,
    policy: &Policy,
) -> FilterOutcome {
    let qualifying: Vec<&HitRecord> = hits.iter().filter(|hit| cutoffs.passes(hit)).collect();
    let presence = PresenceMatrix::from_hits(genomes, genes, qualifying.iter().copied());

    let best = select_best_hits(hits, cutoffs).into_iter()
        .filter(|((genome, gene), _)| presence.has(genome, gene))
        .collect();

    let decisions = decide_inclusion(genomes, genes, &presence, policy);

    let removal_candidates = genes.iter().filter_map(|gene| {
        let percent = presence.missing_percent(gene);
        (percent > MISSING_GENE_WARN_PERCENT).then(|| (gene.clone(), percent))
    }).collect();

    FilterOutcome { best, decisions, presence, removal_candidates }
}
