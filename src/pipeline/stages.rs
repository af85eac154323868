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

//! What each stage does once the controller decides it must run.
//!
//! Stage bodies read the artifacts of earlier stages from the run directory
//! and write their own artifacts there. They never touch the manifest.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::filter::filter_hits;
use crate::filter::summary::read_decisions;
use crate::filter::summary::read_filtered_hits;
use crate::filter::summary::write_decisions;
use crate::filter::summary::write_filtered_hits;
use crate::filter::summary::SearchSummary;
use crate::filter::Cutoffs;
use crate::filter::FilterOutcome;
use crate::filter::Exclusion;
use crate::filter::HitRecord;
use crate::filter::Inclusion;
use crate::filter::Policy;
use crate::pipeline::genomes::GenomeEntry;
use crate::pipeline::genomes::GenomeTable;
use crate::pipeline::genomes::Labels;
use crate::rundir::RunDir;
use crate::sequences::collect_queries;
use crate::sequences::gene_of_query_file;
use crate::sequences::genome_name;
use crate::sequences::relabel_genome;
use crate::sequences::write_queries;
use crate::sequences::write_record;
use crate::stage::Stage;
use crate::tools::blast::read_search_results;
use crate::tools::run_bounded;
use crate::tools::Toolbox;

type E = Box<dyn std::error::Error>;

/// Everything a stage body may use.
pub struct StageContext<'a> {
    pub rundir: &'a RunDir,
    pub config: &'a Config,
    pub tools: &'a Toolbox,
}

/// Turns a helper's boxed error into an I/O error on `path`.
fn written(path: &Path, res: Result<(), E>) -> Result<(), PipelineError> {
    res.map_err(|e| PipelineError::Io(std::io::Error::other(format!("{}: {}", path.display(), e))))
}

/// Runs the body of `stage`.
pub fn execute(stage: Stage, ctx: &StageContext) -> Result<(), PipelineError> {
    match stage {
        Stage::Validate => validate(ctx),
        Stage::Preblast => preblast(ctx),
        Stage::Filtering => filtering(ctx),
        Stage::Prealign => prealign(ctx),
        Stage::Postalign => postalign(ctx),
        Stage::Nexus => nexus(ctx),
        Stage::Tree => tree(ctx),
    }
}

/// Genome name `outgroup` refers to, given as a name, file name or path.
pub fn outgroup_name(outgroup: &str) -> String {
    genome_name(Path::new(outgroup))
}

/// Extracts the queries and relabels the genomes.
pub fn validate(ctx: &StageContext) -> Result<(), PipelineError> {
    let rundir = ctx.rundir;

    let queries = collect_queries(&ctx.config.query, ctx.config.dups)?;
    write_queries(&queries, &rundir.queries_dir())?;
    info!("Extracted {} query sequences", queries.len());

    let files = ctx.config.genome_files()?;
    if files.is_empty() {
        return Err(PipelineError::ConfigurationError("no genome FASTA files found".to_string()))
    }

    let mut labels = Labels::load(&rundir.labels())?;
    let mut genomes: Vec<(usize, String, PathBuf)> = files.into_iter().map(|file| {
        let name = genome_name(&file);
        (labels.assign(&name), name, file)
    }).collect();
    labels.save(&rundir.labels())?;
    genomes.sort();

    std::fs::create_dir_all(rundir.fasta_dir())?;
    let mut first_with_hash: HashMap<String, String> = HashMap::new();
    let mut table = GenomeTable::default();
    for (label, name, source) in genomes {
        let dest = rundir.fasta_dir().join(format!("{}.fasta", name));
        let hash = relabel_genome(&source, label, &dest)?;
        if std::fs::metadata(&dest)?.len() == 0 {
            if let Err(e) = std::fs::remove_file(&dest) {
                warn!("Cannot remove {}: {}", dest.display(), e);
            }
            return Err(PipelineError::unreadable(&source, "contains no sequences"))
        }

        let duplicate_of = first_with_hash.get(&hash).cloned();
        match &duplicate_of {
            Some(first) => {
                warn!("Genome {} has the same sequences as {}; excluding it", name, first);
                std::fs::remove_file(&dest)?;
            },
            None => {
                first_with_hash.insert(hash.clone(), name.clone());
            },
        }
        debug!("Genome {} has label {}", name, label);
        table.genomes.push(GenomeEntry { name, label, source, hash, duplicate_of });
    }
    table.write(&rundir.genomes())?;
    info!("Prepared {} genomes", table.genomes.len());
    Ok(())
}

fn index_prefix(rundir: &RunDir, genome: &GenomeEntry) -> PathBuf {
    rundir.blastdb_dir().join(genome.label.to_string())
}

/// Name of the search output of `query` against the genome labelled `label`.
fn search_output(rundir: &RunDir, query: &Path, label: usize) -> PathBuf {
    let stem = query.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    rundir.blast_dir().join(format!("{}.{}.tab", stem, label))
}

/// Inverse of [search_output]: the query stem and genome label.
fn parse_search_output(path: &Path) -> Option<(String, usize)> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".tab")?;
    let (query, label) = stem.rsplit_once('.')?;
    Some((query.to_string(), label.parse().ok()?))
}

/// Indexes every genome and searches every query against it.
pub fn preblast(ctx: &StageContext) -> Result<(), PipelineError> {
    let rundir = ctx.rundir;
    let table = GenomeTable::read(&rundir.genomes())?;
    let genomes: Vec<&GenomeEntry> = table.searchable().collect();
    let queries = RunDir::files_in(&rundir.queries_dir())?;

    std::fs::create_dir_all(rundir.blastdb_dir())?;
    std::fs::create_dir_all(rundir.blast_dir())?;

    info!("Building {} search indexes on {} threads", genomes.len(), ctx.config.threads);
    run_bounded(ctx.config.threads, &genomes, |genome| {
        let fasta = rundir.fasta_dir().join(format!("{}.fasta", genome.name));
        ctx.tools.search.build_index(&fasta, &index_prefix(rundir, genome))
    })?;

    let tasks: Vec<(&GenomeEntry, &PathBuf)> = genomes.iter()
        .flat_map(|genome| queries.iter().map(move |query| (*genome, query)))
        .collect();
    info!("Running {} searches on {} threads", tasks.len(), ctx.config.threads);
    run_bounded(ctx.config.threads, &tasks, |(genome, query)| {
        let out = search_output(rundir, query, genome.label);
        ctx.tools.search.search(query, &index_prefix(rundir, genome), ctx.config.evalue, &out)
    })
}

/// Applies the cutoffs and the missing gene policy to the search results.
pub fn filtering(ctx: &StageContext) -> Result<(), PipelineError> {
    let rundir = ctx.rundir;
    let config = ctx.config;
    let table = GenomeTable::read(&rundir.genomes())?;

    let genomes: Vec<String> = table.searchable().map(|genome| genome.name.clone()).collect();
    let genes: Vec<String> = RunDir::files_in(&rundir.queries_dir())?.iter()
        .filter_map(|query| gene_of_query_file(query))
        .collect::<BTreeSet<String>>()
        .into_iter().collect();

    let mut hits: Vec<HitRecord> = Vec::new();
    for path in RunDir::files_in(&rundir.blast_dir())? {
        let Some((query, label)) = parse_search_output(&path) else {
            debug!("Ignoring {}", path.display());
            continue
        };
        let Some(genome) = table.by_label(label) else {
            warn!("Search output {} is for an unknown genome; ignoring it", path.display());
            continue
        };
        let conn_in = BufReader::new(File::open(&path).map_err(|e| PipelineError::unreadable(&path, e))?);
        hits.extend(read_search_results(conn_in, &genome.name, &query)?);
    }
    info!("Read {} hits for {} genes in {} genomes", hits.len(), genes.len(), genomes.len());

    let cutoffs = Cutoffs { evalue: config.evalue, coverage: config.coverage, identity: config.identity };
    let policy = Policy { allow_missing: config.allow_missing };
    let mut outcome = filter_hits(&hits, &genomes, &genes, &cutoffs, &policy);
    table.duplicates().for_each(|genome| {
        let of = genome.duplicate_of.clone().unwrap_or_default();
        outcome.decisions.insert(genome.name.clone(), Inclusion::ExcludedDuplicate { of });
    });

    outcome.removal_candidates.iter().for_each(|(gene, percent)| {
        warn!("Gene {} is missing from {:.1}% of genomes; consider removing it", gene, percent);
    });
    let exclusions = outcome.exclusions();
    exclusions.iter().for_each(|Exclusion { genome, reason }| {
        warn!("Excluding genome {}: {}", genome, reason);
    });

    let missing: Vec<String> = outcome.decisions.iter()
        .filter(|(_, decision)| matches!(decision, Inclusion::ExcludedMissingGenes { .. }))
        .map(|(genome, _)| genome.clone())
        .collect();
    discard_review(rundir);
    if !missing.is_empty() && !config.missing_check {
        let review = rundir.review_dir();
        write_review(&outcome, &review)?;
        return Err(PipelineError::MissingGenesWithoutAck { genomes: missing, exclusions, review })
    }
    if outcome.included().is_empty() {
        return Err(PipelineError::ConfigurationError(
            "no genome passed the filters; relax the cutoffs or raise --allow_missing".to_string()))
    }

    write_presence(&outcome, &rundir.presence_matrix(), &rundir.search_summary())?;

    let path = rundir.filtered_hits();
    let mut conn_out = BufWriter::new(File::create(&path)?);
    written(&path, write_filtered_hits(&outcome, &mut conn_out))?;

    let path = rundir.inclusion();
    let mut conn_out = BufWriter::new(File::create(&path)?);
    written(&path, write_decisions(&outcome.decisions, &mut conn_out))?;

    info!("{} of {} genomes included", outcome.included().len(), outcome.decisions.len());
    Ok(())
}

/// Writes the presence matrix and the search summary.
fn write_presence(outcome: &FilterOutcome, matrix: &Path, summary: &Path) -> Result<(), PipelineError> {
    let mut conn_out = BufWriter::new(File::create(matrix)?);
    written(matrix, outcome.presence.write_tsv(&mut conn_out))?;

    let mut conn_out = BufWriter::new(File::create(summary)?);
    serde_json::to_writer_pretty(&mut conn_out, &SearchSummary::from_outcome(outcome)).map_err(std::io::Error::from)?;
    conn_out.write_all(b"\n")?;
    conn_out.flush()?;
    Ok(())
}

/// Leaves the presence matrix, search summary and the missing genes of each
/// excluded genome in `dir` for the user to look at before acknowledging.
fn write_review(outcome: &FilterOutcome, dir: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(dir)?;
    write_presence(outcome, &dir.join("presence_matrix.tsv"), &dir.join("blast_summary.json"))?;

    let missing: IndexMap<&str, &[String]> = outcome.decisions.iter()
        .filter_map(|(genome, decision)| match decision {
            Inclusion::ExcludedMissingGenes { missing } => Some((genome.as_str(), missing.as_slice())),
            _ => None,
        })
        .collect();
    let path = dir.join("missing_by_genome.json");
    let mut conn_out = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut conn_out, &missing).map_err(std::io::Error::from)?;
    conn_out.write_all(b"\n")?;
    conn_out.flush()?;
    warn!("Review the filtering results in {}", dir.display());
    Ok(())
}

/// Removes the review left by an earlier unacknowledged run.
fn discard_review(rundir: &RunDir) {
    let dir = rundir.review_dir();
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!("Cannot remove {}: {}", dir.display(), e);
        }
    }
}

/// Decisions written by the filtering stage.
pub fn read_inclusion(rundir: &RunDir) -> Result<IndexMap<String, Inclusion>, PipelineError> {
    let path = rundir.inclusion();
    let conn_in = File::open(&path).map_err(|e| PipelineError::unreadable(&path, e))?;
    read_decisions(BufReader::new(conn_in)).map_err(|e| PipelineError::unreadable(&path, e))
}

/// Collects the best hit sequences into one FASTA per gene.
pub fn prealign(ctx: &StageContext) -> Result<(), PipelineError> {
    let rundir = ctx.rundir;
    let decisions = read_inclusion(rundir)?;
    let path = rundir.filtered_hits();
    let conn_in = BufReader::new(File::open(&path).map_err(|e| PipelineError::unreadable(&path, e))?);
    let hits = read_filtered_hits(conn_in).map_err(|e| PipelineError::unreadable(&path, e))?;

    let order: HashMap<&String, usize> = decisions.keys().enumerate().map(|(idx, genome)| (genome, idx)).collect();
    let mut by_gene: BTreeMap<&str, Vec<&HitRecord>> = BTreeMap::new();
    hits.iter()
        .filter(|hit| decisions.get(&hit.genome).is_some_and(|d| d.is_included()))
        .for_each(|hit| by_gene.entry(hit.gene.as_str()).or_default().push(hit));

    std::fs::create_dir_all(rundir.unaligned_dir())?;
    for (gene, mut hits) in by_gene {
        hits.sort_by_key(|hit| order.get(&hit.genome).copied().unwrap_or(usize::MAX));
        let path = rundir.unaligned_dir().join(format!("{}.fasta", gene));
        let mut conn_out = BufWriter::new(File::create(&path)?);
        for hit in hits {
            let seq: Vec<u8> = hit.sequence.bytes().filter(|b| *b != b'-').collect();
            write_record(&mut conn_out, &hit.genome, &seq)?;
        }
        conn_out.flush()?;
    }
    Ok(())
}

/// Aligns every gene.
pub fn postalign(ctx: &StageContext) -> Result<(), PipelineError> {
    let rundir = ctx.rundir;
    let unaligned = RunDir::files_in(&rundir.unaligned_dir())?;
    let options = ctx.config.aligner_options();
    std::fs::create_dir_all(rundir.aligned_dir())?;

    info!("Aligning {} genes on {} threads", unaligned.len(), ctx.config.threads);
    run_bounded(ctx.config.threads, &unaligned, |file| {
        let gene = file.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        let out = rundir.aligned_dir().join(format!("{}.aln", gene));
        ctx.tools.aligner.align(file, &out, &options)
    })
}

/// Writes the partition file pointing at every alignment.
pub fn nexus(ctx: &StageContext) -> Result<(), PipelineError> {
    let rundir = ctx.rundir;
    let mut genes: Vec<String> = RunDir::files_in(&rundir.aligned_dir())?.iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == "aln"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .collect();
    if genes.is_empty() {
        return Err(PipelineError::AlignmentToolFailure("no alignments to combine".to_string()))
    }
    genes.sort();

    let path = rundir.nexus();
    let mut conn_out = BufWriter::new(File::create(&path)?);
    written(&path, write_nexus(&genes, &mut conn_out))
}

/// Writes a `sets` block with one charset per gene.
pub fn write_nexus<W: Write>(
    genes: &[String],
    conn_out: &mut W,
) -> Result<(), E> {
    conn_out.write_all(b"#nexus\nbegin sets;\n")?;
    for gene in genes {
        conn_out.write_all(format!("  charset {} = aligned/{}.aln: *;\n", gene, gene).as_bytes())?;
    }
    conn_out.write_all(b"end;\n")?;
    conn_out.flush()?;
    Ok(())
}

/// Builds the tree, rooted at the outgroup if one is given.
pub fn tree(ctx: &StageContext) -> Result<(), PipelineError> {
    let rundir = ctx.rundir;
    let outgroup = match &ctx.config.outgroup {
        Some(outgroup) => {
            let name = outgroup_name(outgroup);
            let decisions = read_inclusion(rundir)?;
            if !decisions.get(&name).is_some_and(|d| d.is_included()) {
                return Err(PipelineError::ConfigurationError(format!(
                    "outgroup {} is not among the included genomes", outgroup)))
            }
            Some(name)
        },
        None => None,
    };

    let nexus = rundir.nexus();
    let nexus_name = nexus.file_name().map(PathBuf::from).unwrap_or_else(|| nexus.clone());
    let treefile = ctx.tools.tree.build(
        &nexus_name, rundir.root(), ctx.config.threads, &ctx.config.tree_options(), outgroup.as_deref())?;
    info!("Tree written to {}", treefile.display());
    Ok(())
}

// Tests
#[cfg(test)]
mod tests {

    #[test]
    fn nexus_lists_genes_in_order() {
        use super::write_nexus;

        let mut out: Vec<u8> = Vec::new();
        write_nexus(&["gyrB".to_string(), "recA".to_string()], &mut out).unwrap();

        let expected = "#nexus\nbegin sets;\n  charset gyrB = aligned/gyrB.aln: *;\n  charset recA = aligned/recA.aln: *;\nend;\n";
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn search_output_names_roundtrip() {
        use super::{parse_search_output, search_output};
        use crate::rundir::RunDir;
        use std::path::Path;

        let parent = tempfile::TempDir::new().unwrap();
        let rundir = RunDir::create(parent.path(), "run").unwrap();

        let out = search_output(&rundir, Path::new("queries/rec.A_00ff.fas"), 12);

        assert_eq!(out, rundir.blast_dir().join("rec.A_00ff.12.tab"));
        assert_eq!(parse_search_output(&out), Some(("rec.A_00ff".to_string(), 12)));
        assert_eq!(parse_search_output(Path::new("blast/notes.txt")), None);
    }

    #[test]
    fn outgroup_accepts_names_and_paths() {
        use super::outgroup_name;

        assert_eq!(outgroup_name("ecoli"), "ecoli");
        assert_eq!(outgroup_name("ecoli.fna"), "ecoli");
        assert_eq!(outgroup_name("/data/genomes/ecoli.fna.gz"), "ecoli");
    }
}
