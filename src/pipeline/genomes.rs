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

//! Genome labels and the genome table.
//!
//! Every genome gets an integer label the first time a run sees it. Labels
//! are append-only across reruns so that adding or removing a genome never
//! shifts the labels, and with them the search indexes, of the others.
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Genome name to label, in label order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    names: IndexMap<String, usize>,
}

impl Labels {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Ok(Labels::default())
        }
        let conn_in = File::open(path).map_err(|e| PipelineError::unreadable(path, e))?;
        let names: Vec<String> = serde_json::from_reader(BufReader::new(conn_in))
            .map_err(|e| PipelineError::Manifest { path: path.to_path_buf(), reason: e.to_string() })?;
        Ok(Labels { names: names.into_iter().enumerate().map(|(idx, name)| (name, idx)).collect() })
    }

    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let names: Vec<&String> = self.names.keys().collect();
        let mut conn_out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut conn_out, &names).map_err(std::io::Error::from)?;
        conn_out.write_all(b"\n")?;
        conn_out.flush()?;
        Ok(())
    }

    /// Label of `name`, assigning the next free one if it is new.
    pub fn assign(&mut self, name: &str) -> usize {
        let next = self.names.len();
        *self.names.entry(name.to_string()).or_insert(next)
    }
}

/// One genome of the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenomeEntry {
    pub name: String,
    pub label: usize,
    /// The genome file as given.
    pub source: PathBuf,
    /// Hash of the sequences, headers excluded.
    pub hash: String,
    /// Name of the earlier genome with identical sequences.
    #[serde(default)]
    pub duplicate_of: Option<String>,
}

/// The genomes of the current run in label order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenomeTable {
    pub genomes: Vec<GenomeEntry>,
}

impl GenomeTable {
    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        let conn_in = File::open(path).map_err(|e| PipelineError::unreadable(path, e))?;
        serde_json::from_reader(BufReader::new(conn_in))
            .map_err(|e| PipelineError::unreadable(path, e))
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        let mut conn_out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut conn_out, self).map_err(std::io::Error::from)?;
        conn_out.write_all(b"\n")?;
        conn_out.flush()?;
        Ok(())
    }

    /// Genomes that are searched: everything except duplicates.
    pub fn searchable(&self) -> impl Iterator<Item = &GenomeEntry> {
        self.genomes.iter().filter(|genome| genome.duplicate_of.is_none())
    }

    pub fn duplicates(&self) -> impl Iterator<Item = &GenomeEntry> {
        self.genomes.iter().filter(|genome| genome.duplicate_of.is_some())
    }

    pub fn by_label(&self, label: usize) -> Option<&GenomeEntry> {
        self.genomes.iter().find(|genome| genome.label == label)
    }
}

// Tests
#[cfg(test)]
mod tests {

    #[test]
    fn labels_are_append_only() {
        use super::Labels;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("labels.json");

        let mut labels = Labels::load(&path).unwrap();
        assert_eq!(labels.assign("a"), 0);
        assert_eq!(labels.assign("b"), 1);
        assert_eq!(labels.assign("a"), 0);
        labels.save(&path).unwrap();

        let mut again = Labels::load(&path).unwrap();
        assert_eq!(again.assign("c"), 2);
        assert_eq!(again.assign("b"), 1);
        assert_eq!(again.assign("a"), 0);
    }

    #[test]
    fn duplicates_are_not_searchable() {
        use super::{GenomeEntry, GenomeTable};
        use std::path::PathBuf;

        let entry = |name: &str, label: usize, duplicate_of: Option<&str>| GenomeEntry {
            name: name.to_string(), label, source: PathBuf::from(format!("{}.fna", name)),
            hash: "h".to_string(), duplicate_of: duplicate_of.map(|s| s.to_string()),
        };
        let table = GenomeTable { genomes: vec![entry("a", 0, None), entry("b", 1, Some("a")), entry("c", 2, None)] };

        let searchable: Vec<&str> = table.searchable().map(|g| g.name.as_str()).collect();
        assert_eq!(searchable, vec!["a", "c"]);
        assert_eq!(table.by_label(1).map(|g| g.name.as_str()), Some("b"));
    }
}
