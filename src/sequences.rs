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

//! FASTA handling for query extraction and genome relabelling.
//!
//! Reading goes through needletail, which also takes care of gzipped input.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use flate2::read::MultiGzDecoder;
use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// Files next to a FASTA that belong to a search index and must not be
/// mistaken for genomes when scanning a directory.
const INDEX_SUFFIXES: [&str; 10] = [".nsq", ".nin", ".nhr", ".nto", ".not", ".ndb", ".ntf", ".njs", ".nog", ".nos"];

/// Checks whether `path` starts like a FASTA file.
///
/// Looks at the first non-whitespace byte, decompressing gzip on the fly.
pub fn looks_like_fasta(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    if INDEX_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        return false
    }
    let Ok(mut file) = File::open(path) else {
        return false
    };
    let mut magic = [0_u8; 2];
    let is_gz = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    let Ok(file) = File::open(path) else {
        return false
    };
    let reader: Box<dyn Read> = if is_gz { Box::new(MultiGzDecoder::new(file)) } else { Box::new(file) };

    reader.bytes()
        .map_while(|byte| byte.ok())
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| byte == b'>')
}

/// Turns a sequence id into something safe to use in a file name.
///
/// Spaces become underscores; anything outside `[A-Za-z0-9._-]` is dropped.
pub fn sanitize_id(id: &str) -> String {
    id.replace(' ', "_").chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// Short content hash of a sequence: the first 16 bytes of SHA-256, hex encoded.
pub fn sequence_hash(seq: &[u8]) -> String {
    let digest = Sha256::digest(seq);
    digest[..16].iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// The record id: the header up to the first whitespace.
pub fn record_id(header: &[u8]) -> String {
    let header = String::from_utf8_lossy(header);
    header.split_whitespace().next().unwrap_or_default().to_string()
}

/// Gene label of an extracted query file named `<gene>_<hash>.fas`.
pub fn gene_of_query_file(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit_once('_').map(|(gene, _)| gene.to_string())
}

const FASTA_EXTENSIONS: [&str; 7] = ["fasta", "fas", "fa", "fna", "ffn", "fsa", "seq"];

/// Name a genome goes by in hits, alignments and the tree: the file name
/// without a `.gz` and FASTA extension.
pub fn genome_name(path: &Path) -> String {
    let mut name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    if let Some(stripped) = name.strip_suffix(".gz") {
        name = stripped.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && FASTA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => stem.to_string(),
        _ => name,
    }
}

/// Writes one record with the sequence on a single line.
pub fn write_record<W: Write>(conn_out: &mut W, header: &str, seq: &[u8]) -> std::io::Result<()> {
    conn_out.write_all(b">")?;
    conn_out.write_all(header.as_bytes())?;
    conn_out.write_all(b"\n")?;
    conn_out.write_all(seq)?;
    conn_out.write_all(b"\n")
}

/// One query sequence to search for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySequence {
    /// Gene label, the sanitized record id.
    pub gene: String,
    /// Hash of the sequence.
    pub hash: String,
    pub sequence: Vec<u8>,
    /// File the record came from.
    pub source: PathBuf,
}

impl QuerySequence {
    /// File name the query is extracted to.
    pub fn file_name(&self) -> String {
        format!("{}_{}.fas", self.gene, self.hash)
    }
}

fn each_record<F>(path: &Path, mut f: F) -> Result<(), PipelineError>
where
    F: FnMut(&[u8], &[u8]) -> Result<(), PipelineError>,
{
    let mut reader = needletail::parse_fastx_file(path).map_err(|e| PipelineError::unreadable(path, e))?;
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| PipelineError::unreadable(path, e))?;
        let seq = record.seq();
        f(record.id(), &seq[..])?;
    }
    Ok(())
}

/// Reads every record of every query file.
///
/// Identical id and sequence seen twice is skipped. The same sequence under
/// two ids is an error. The same id with two different sequences is an
/// error unless `dups` allows alternative probes for one gene.
pub fn collect_queries(
    files: &[PathBuf],
    dups: bool,
) -> Result<Vec<QuerySequence>, PipelineError> {
    let mut queries: Vec<QuerySequence> = Vec::new();
    let mut by_hash: HashMap<String, String> = HashMap::new();
    let mut by_gene: HashMap<String, PathBuf> = HashMap::new();

    for file in files {
        debug!("Reading query file {}", file.display());
        each_record(file, |header, seq| {
            let gene = sanitize_id(&record_id(header));
            let hash = sequence_hash(seq);

            match by_hash.get(&hash) {
                Some(seen) if *seen == gene => return Ok(()),
                Some(seen) => {
                    return Err(PipelineError::ConfigurationError(format!(
                        "the same sequence appears as both '{}' and '{}' in the queries; rename or remove one", seen, gene)))
                },
                None => (),
            }

            if let Some(first) = by_gene.get(&gene) {
                if !dups {
                    return Err(PipelineError::ConfigurationError(format!(
                        "query name '{}' appears twice ({} and {}); use --dups to keep both", gene, first.display(), file.display())))
                }
                info!("Keeping additional query {} from {}", gene, file.display());
            }

            by_hash.insert(hash.clone(), gene.clone());
            by_gene.entry(gene.clone()).or_insert_with(|| file.clone());
            queries.push(QuerySequence { gene, hash, sequence: seq.to_vec(), source: file.clone() });
            Ok(())
        })?;
    }

    if queries.is_empty() {
        return Err(PipelineError::ConfigurationError("no query sequences found".to_string()))
    }
    Ok(queries)
}

/// Writes each query to its own FASTA file in `dir`.
pub fn write_queries(
    queries: &[QuerySequence],
    dir: &Path,
) -> Result<Vec<PathBuf>, PipelineError> {
    std::fs::create_dir_all(dir)?;
    queries.iter().map(|query| {
        let path = dir.join(query.file_name());
        let mut conn_out = BufWriter::new(File::create(&path)?);
        write_record(&mut conn_out, &query.gene, &query.sequence)?;
        conn_out.flush()?;
        Ok(path)
    }).collect()
}

/// Copies a genome to `dest`, renaming every record to `<label> <id>`.
///
/// Returns a hash of the concatenated sequences, headers excluded.
pub fn relabel_genome(
    src: &Path,
    label: usize,
    dest: &Path,
) -> Result<String, PipelineError> {
    let mut conn_out = BufWriter::new(File::create(dest)?);
    let mut hasher = Sha256::new();
    each_record(src, |header, seq| {
        let header = format!("{} {}", label, record_id(header));
        write_record(&mut conn_out, &header, seq)?;
        hasher.update(seq);
        Ok(())
    })?;
    conn_out.flush()?;
    Ok(format!("{:x}", hasher.finalize()))
}
