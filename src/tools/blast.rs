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

//! BLAST+ search tool and its tabular output.
use std::io::BufRead;
use std::path::Path;

use bstr::io::BufReadExt;
use bstr::ByteSlice;

use crate::error::PipelineError;
use crate::filter::HitRecord;
use crate::tools::run_command;
use crate::tools::Executable;
use crate::tools::SearchTool;
use crate::Program;

/// Columns requested from the search, in order.
pub const OUTFMT: &str = "6 qseqid sseqid pident evalue bitscore qcovhsp sstart send sseq";

/// `makeblastdb` plus `blastn` or `tblastn`.
pub struct BlastTool {
    makeblastdb: Executable,
    search: Executable,
}

impl BlastTool {
    pub fn new(program: Program, external: Option<&Path>) -> Self {
        BlastTool {
            makeblastdb: Executable::new("makeblastdb", external),
            search: Executable::new(&program.to_string(), external),
        }
    }
}

impl SearchTool for BlastTool {
    fn build_index(&self, genome: &Path, index_prefix: &Path) -> Result<(), PipelineError> {
        let mut cmd = self.makeblastdb.command()?;
        cmd.arg("-dbtype").arg("nucl")
            .arg("-in").arg(genome)
            .arg("-out").arg(index_prefix);
        run_command(&mut cmd, self.makeblastdb.name(), PipelineError::SearchToolFailure)?;
        Ok(())
    }

    fn search(&self, query: &Path, index_prefix: &Path, evalue: f64, out: &Path) -> Result<(), PipelineError> {
        let mut cmd = self.search.command()?;
        cmd.arg("-query").arg(query)
            .arg("-db").arg(index_prefix)
            .arg("-evalue").arg(evalue.to_string())
            .arg("-outfmt").arg(OUTFMT)
            .arg("-out").arg(out);
        run_command(&mut cmd, self.search.name(), PipelineError::SearchToolFailure)?;
        Ok(())
    }
}

fn field<T: std::str::FromStr>(fields: &[&[u8]], idx: usize, line: usize) -> Result<T, PipelineError> {
    fields[idx].to_str().ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .ok_or_else(|| PipelineError::SearchToolFailure(format!(
            "cannot parse column {} on line {} of the search output", idx + 1, line)))
}

/// Parses search output for one query file searched against one genome.
///
/// The genome is the one that was searched; the gene is the query's
/// `qseqid`. Lines starting with `#` are comments.
pub fn read_search_results<R: BufRead>(
    mut conn_in: R,
    genome: &str,
    query: &str,
) -> Result<Vec<HitRecord>, PipelineError> {
    let mut hits: Vec<HitRecord> = Vec::new();
    let mut line_no = 0;
    let mut failure: Option<PipelineError> = None;

    conn_in.for_byte_line(|line| {
        line_no += 1;
        if line.trim().is_empty() || line.starts_with(b"#") {
            return Ok(true)
        }
        let fields: Vec<&[u8]> = line.split_str("\t").collect();
        if fields.len() < 9 {
            failure = Some(PipelineError::SearchToolFailure(format!(
                "line {} of the search output has {} columns, expected 9", line_no, fields.len())));
            return Ok(false)
        }
        let parsed = (|| {
            Ok::<HitRecord, PipelineError>(HitRecord {
                genome: genome.to_string(),
                gene: fields[0].to_str_lossy().to_string(),
                query: query.to_string(),
                identity: field(&fields, 2, line_no)?,
                evalue: field(&fields, 3, line_no)?,
                coverage: field(&fields, 5, line_no)?,
                start: field(&fields, 6, line_no)?,
                end: field(&fields, 7, line_no)?,
                sequence: fields[8].to_str_lossy().to_string(),
            })
        })();
        match parsed {
            Ok(hit) => {
                hits.push(hit);
                Ok(true)
            },
            Err(e) => {
                failure = Some(e);
                Ok(false)
            },
        }
    }).map_err(|e| PipelineError::SearchToolFailure(format!("cannot read search output: {}", e)))?;

    match failure {
        Some(e) => Err(e),
        None => Ok(hits),
    }
}
