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

//! Gene × genome presence of qualifying hits.
//!
//! Each gene holds a [RoaringBitmap] of the genome indexes it was found in,
//! so "which genomes lack gene X" is a bitmap difference against the set of
//! all genomes.

use std::collections::HashMap;
use std::io::Write;

use indexmap::IndexMap;
use roaring::RoaringBitmap;

use crate::filter::HitRecord;

type E = Box<dyn std::error::Error>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceMatrix {
    genomes: IndexMap<String, u32>,
    genes: IndexMap<String, RoaringBitmap>,
    counts: HashMap<(String, u32), u32>,
}

impl PresenceMatrix {
    /// Builds the matrix from qualifying hits.
    ///
    /// Hits on genomes or genes not listed are ignored.
    pub fn from_hits<'a, I>(genomes: &[String], genes: &[String], hits: I) -> Self
    where
        I: IntoIterator<Item = &'a HitRecord>,
    {
        let genomes: IndexMap<String, u32> = genomes.iter().enumerate()
            .map(|(idx, genome)| (genome.clone(), idx as u32))
            .collect();
        let mut genes: IndexMap<String, RoaringBitmap> = genes.iter()
            .map(|gene| (gene.clone(), RoaringBitmap::new()))
            .collect();
        let mut counts: HashMap<(String, u32), u32> = HashMap::new();

        hits.into_iter().for_each(|hit| {
            if let (Some(idx), Some(bitmap)) = (genomes.get(&hit.genome), genes.get_mut(&hit.gene)) {
                bitmap.insert(*idx);
                *counts.entry((hit.gene.clone(), *idx)).or_insert(0) += 1;
            }
        });

        PresenceMatrix { genomes, genes, counts }
    }

    /// True if `genome` has at least one qualifying hit for `gene`.
    pub fn has(&self, genome: &str, gene: &str) -> bool {
        match (self.genomes.get(genome), self.genes.get(gene)) {
            (Some(idx), Some(bitmap)) => bitmap.contains(*idx),
            _ => false,
        }
    }

    /// Number of qualifying hits for the pair.
    pub fn count(&self, genome: &str, gene: &str) -> u32 {
        self.genomes.get(genome)
            .and_then(|idx| self.counts.get(&(gene.to_string(), *idx)))
            .copied()
            .unwrap_or(0)
    }

    fn all_genomes(&self) -> RoaringBitmap {
        (0..self.genomes.len() as u32).collect()
    }

    /// Genomes without a qualifying hit for `gene`, in genome order.
    pub fn genomes_missing(&self, gene: &str) -> Vec<String> {
        let missing = match self.genes.get(gene) {
            Some(bitmap) => self.all_genomes() - bitmap,
            None => self.all_genomes(),
        };
        missing.iter()
            .filter_map(|idx| self.genomes.get_index(idx as usize).map(|(name, _)| name.clone()))
            .collect()
    }

    /// Genes without a qualifying hit in `genome`, in gene order.
    pub fn genes_missing(&self, genome: &str) -> Vec<String> {
        self.genes.keys().filter(|gene| !self.has(genome, gene)).cloned().collect()
    }

    /// Percentage of genomes lacking `gene`.
    pub fn missing_percent(&self, gene: &str) -> f64 {
        if self.genomes.is_empty() {
            return 0.0
        }
        self.genomes_missing(gene).len() as f64 / self.genomes.len() as f64 * 100.0
    }

    pub fn genomes(&self) -> impl Iterator<Item = &String> {
        self.genomes.keys()
    }

    pub fn genes(&self) -> impl Iterator<Item = &String> {
        self.genes.keys()
    }

    /// Writes the matrix as a tab separated table of hit counts, genomes as rows.
    pub fn write_tsv<W: Write>(&self, conn_out: &mut W) -> Result<(), E> {
        let mut header = String::from("genome");
        self.genes.keys().for_each(|gene| {
            header += "\t";
            header += gene;
        });
        header += "\n";
        conn_out.write_all(header.as_bytes())?;

        for genome in self.genomes.keys() {
            let mut line = genome.clone();
            self.genes.keys().for_each(|gene| {
                line += "\t";
                line += &self.count(genome, gene).to_string();
            });
            line += "\n";
            conn_out.write_all(line.as_bytes())?;
        }
        conn_out.flush()?;
        Ok(())
    }
}
