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

//! Files written by the filtering stage and read back by later stages.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::io::Write;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::filter::FilterOutcome;
use crate::filter::HitRecord;
use crate::filter::Inclusion;

type E = Box<dyn std::error::Error>;

const FILTERED_HEADER: &str = "genome\tgene\tquery\tevalue\tidentity\tcoverage\tstart\tend\tsequence";

#[derive(Debug, Clone)]
pub struct MalformedFilteredHits {
    line: usize,
}

impl std::fmt::Display for MalformedFilteredHits {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Malformed filtered hit on line {}", self.line)
    }
}

impl std::error::Error for MalformedFilteredHits {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneSummary {
    pub genomes: Vec<String>,
    pub count: usize,
    pub percent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenomeSummary {
    pub genes: Vec<String>,
    pub count: usize,
    pub percent: String,
}

/// Human readable overview of what is missing where.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub genes: Vec<String>,
    pub genomes: Vec<String>,
    pub missing_by_gene: BTreeMap<String, GeneSummary>,
    pub missing_by_genome: BTreeMap<String, GenomeSummary>,
    pub included: Vec<String>,
}

impl SearchSummary {
    pub fn from_outcome(outcome: &FilterOutcome) -> Self {
        let genes: Vec<String> = outcome.presence.genes().cloned().collect();
        let genomes: Vec<String> = outcome.presence.genomes().cloned().collect();

        let missing_by_gene = genes.iter().filter_map(|gene| {
            let missing = outcome.presence.genomes_missing(gene);
            (!missing.is_empty()).then(|| {
                let summary = GeneSummary {
                    count: missing.len(),
                    percent: format!("{:.2}", outcome.presence.missing_percent(gene)),
                    genomes: missing,
                };
                (gene.clone(), summary)
            })
        }).collect();

        let missing_by_genome = genomes.iter().filter_map(|genome| {
            let missing = outcome.presence.genes_missing(genome);
            (!missing.is_empty()).then(|| {
                let summary = GenomeSummary {
                    count: missing.len(),
                    percent: format!("{:.2}", missing.len() as f64 / genes.len().max(1) as f64 * 100.0),
                    genes: missing,
                };
                (genome.clone(), summary)
            })
        }).collect();

        SearchSummary { genes, genomes, missing_by_gene, missing_by_genome, included: outcome.included() }
    }
}

/// Writes the best hit per included genome and gene.
pub fn write_filtered_hits<W: Write>(
    outcome: &FilterOutcome,
    conn_out: &mut W,
) -> Result<(), E> {
    conn_out.write_all(FILTERED_HEADER.as_bytes())?;
    conn_out.write_all(b"\n")?;
    for ((genome, _), hit) in outcome.best.iter() {
        if !outcome.decisions.get(genome).is_some_and(|d| d.is_included()) {
            continue
        }
        let line = format!("{}\t{}\t{}\t{:e}\t{}\t{}\t{}\t{}\t{}\n",
                           hit.genome, hit.gene, hit.query, hit.evalue, hit.identity,
                           hit.coverage, hit.start, hit.end, hit.sequence);
        conn_out.write_all(line.as_bytes())?;
    }
    conn_out.flush()?;
    Ok(())
}

/// Reads hits written by [write_filtered_hits].
pub fn read_filtered_hits<R: BufRead>(
    conn_in: R,
) -> Result<Vec<HitRecord>, E> {
    let mut hits: Vec<HitRecord> = Vec::new();
    for (idx, line) in conn_in.lines().enumerate() {
        let line = line?;
        if idx == 0 || line.is_empty() {
            continue
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 9 {
            return Err(Box::new(MalformedFilteredHits { line: idx + 1 }))
        }
        hits.push(HitRecord {
            genome: fields[0].to_string(),
            gene: fields[1].to_string(),
            query: fields[2].to_string(),
            evalue: fields[3].parse()?,
            identity: fields[4].parse()?,
            coverage: fields[5].parse()?,
            start: fields[6].parse()?,
            end: fields[7].parse()?,
            sequence: fields[8].to_string(),
        });
    }
    Ok(hits)
}

/// Writes the per genome decisions.
pub fn write_decisions<W: Write>(
    decisions: &IndexMap<String, Inclusion>,
    conn_out: &mut W,
) -> Result<(), E> {
    serde_json::to_writer_pretty(&mut *conn_out, decisions)?;
    conn_out.write_all(b"\n")?;
    conn_out.flush()?;
    Ok(())
}

pub fn read_decisions<R: std::io::Read>(
    conn_in: R,
) -> Result<IndexMap<String, Inclusion>, E> {
    Ok(serde_json::from_reader(conn_in)?)
}
