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

//! Checkpoint controller.
//!
//! A run goes through three steps:
//!
//!   1. Find the earliest stage whose recorded inputs or parameters no longer
//!      match the current ones, see [resolve](crate::staleness::resolve).
//!   2. Remove, or back up under `protect`, the artifacts of that stage and
//!      every later one, and drop their manifest records.
//!   3. Run the stale stages up to the checkpoint, saving the manifest after
//!      each stage completes.
//!
//! A failing stage halts the run. Its partial outputs are discarded and its
//! manifest record is left unwritten, so the next invocation resumes at the
//! failed stage.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mlsaflow::config::Config;
//! use mlsaflow::pipeline::Pipeline;
//! use mlsaflow::rundir::RunDir;
//! use mlsaflow::stage::Checkpoint;
//! use mlsaflow::tools::Toolbox;
//!
//! let config = Config {
//!     query: vec!["markers.fasta".into()],
//!     dir: vec!["genomes".into()],
//!     ..Default::default()
//! };
//! let rundir = RunDir::create(std::path::Path::new("."), "run1").unwrap();
//! let tools = Toolbox::external(&config);
//!
//! let mut pipeline = Pipeline::open(rundir, config, tools).unwrap();
//! let report = pipeline.run(Checkpoint::None).unwrap();
//! report.log();
//! ```

pub mod genomes;
pub mod stages;

use std::path::PathBuf;

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::filter::Exclusion;
use crate::fingerprint::fingerprint_all;
use crate::fingerprint::ParameterSnapshot;
use crate::manifest::RunManifest;
use crate::manifest::StageRecord;
use crate::rundir::OverwritePolicy;
use crate::rundir::RunDir;
use crate::sequences::genome_name;
use crate::stage::Checkpoint;
use crate::stage::Stage;
use crate::staleness::resolve;
use crate::staleness::InputProbe;
use crate::staleness::Verdict;
use crate::tools::Toolbox;

use stages::StageContext;

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Completed,
    /// Up to date from an earlier run.
    Reused,
    Failed,
    /// After the checkpoint; not considered in this run.
    Skipped,
}

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    Finished { tree: PathBuf },
    /// Stopped after the requested stage.
    Checkpoint(Stage),
    Failed { stage: Stage, error: PipelineError },
}

/// Summary of one invocation.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub executed: Vec<Stage>,
    pub reused: Vec<Stage>,
    pub states: Vec<(Stage, StageState)>,
    pub exclusions: Vec<Exclusion>,
    pub outcome: Outcome,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            Outcome::Failed { error, .. } => error.exit_code(),
            _ => 0,
        }
    }

    pub fn log(&self) {
        let names = |stages: &[Stage]| stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ");
        if !self.reused.is_empty() {
            info!("Reused: {}", names(&self.reused));
        }
        if !self.executed.is_empty() {
            info!("Executed: {}", names(&self.executed));
        }
        self.exclusions.iter().for_each(|exclusion| {
            warn!("Excluded {}: {}", exclusion.genome, exclusion.reason);
        });
        match &self.outcome {
            Outcome::Finished { tree } => info!("Run {} finished, tree in {}", self.run_id, tree.display()),
            Outcome::Checkpoint(stage) => info!("Run {} stopped at checkpoint {}", self.run_id, stage),
            Outcome::Failed { stage, error } => error!("Run {} failed in stage {}: {}", self.run_id, stage, error),
        }
    }
}

/// Current inputs of each stage, read from the config and the run directory.
struct PipelineProbe<'a> {
    rundir: &'a RunDir,
    config: &'a Config,
}

impl PipelineProbe<'_> {
    fn keyed(&self, paths: Vec<PathBuf>) -> Vec<(String, PathBuf)> {
        paths.into_iter()
            .map(|path| (self.rundir.key(&path), path))
            .collect()
    }

    fn existing(&self, paths: Vec<PathBuf>) -> Vec<(String, PathBuf)> {
        self.keyed(paths.into_iter().filter(|path| path.is_file()).collect())
    }
}

impl InputProbe for PipelineProbe<'_> {
    fn consumed(&self, stage: Stage) -> Result<Vec<(String, PathBuf)>, PipelineError> {
        let rundir = self.rundir;
        let consumed = match stage {
            Stage::Validate => {
                let mut files = self.config.query.clone();
                files.extend(self.config.genome_files()?);
                self.keyed(files)
            },
            Stage::Preblast => {
                let mut files = RunDir::files_in(&rundir.queries_dir())?;
                files.extend(RunDir::files_in(&rundir.fasta_dir())?);
                self.keyed(files)
            },
            Stage::Filtering => {
                let mut files = RunDir::files_in(&rundir.blast_dir())?;
                files.push(rundir.genomes());
                self.existing(files)
            },
            Stage::Prealign => self.existing(vec![rundir.filtered_hits(), rundir.inclusion()]),
            Stage::Postalign => self.keyed(RunDir::files_in(&rundir.unaligned_dir())?),
            Stage::Nexus => self.keyed(RunDir::files_in(&rundir.aligned_dir())?),
            Stage::Tree => self.existing(vec![rundir.nexus()]),
        };
        Ok(consumed)
    }

    fn parameters(&self, stage: Stage) -> ParameterSnapshot {
        self.config.stage_parameters(stage)
    }

    fn locate(&self, key: &str) -> PathBuf {
        self.rundir.locate(key)
    }
}

/// One run of the pipeline.
pub struct Pipeline {
    rundir: RunDir,
    config: Config,
    tools: Toolbox,
    manifest: RunManifest,
}

impl Pipeline {
    /// Validates `config`, stores it in the run directory and loads the
    /// run's manifest.
    pub fn open(rundir: RunDir, config: Config, tools: Toolbox) -> Result<Self, PipelineError> {
        config.validate()?;
        config.write(&rundir.config())?;
        let manifest = RunManifest::load(&rundir.manifest(), rundir.run_id())?;
        Ok(Pipeline { rundir, config, tools, manifest })
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    fn policy(&self) -> OverwritePolicy {
        if self.config.protect { OverwritePolicy::Protect } else { OverwritePolicy::Overwrite }
    }

    /// Fails early if the outgroup names none of the input genomes.
    fn check_outgroup(&self) -> Result<(), PipelineError> {
        let Some(outgroup) = &self.config.outgroup else {
            return Ok(())
        };
        let name = stages::outgroup_name(outgroup);
        let found = self.config.genome_files()?.iter().any(|file| genome_name(file) == name);
        if !found {
            return Err(PipelineError::ConfigurationError(format!(
                "outgroup {} is not one of the input genomes", outgroup)))
        }
        Ok(())
    }

    fn exclusions(&self) -> Vec<Exclusion> {
        if !self.rundir.inclusion().is_file() {
            return Vec::new()
        }
        match stages::read_inclusion(&self.rundir) {
            Ok(decisions) => decisions.iter()
                .filter_map(|(genome, decision)| Exclusion::from_decision(genome, decision))
                .collect(),
            Err(e) => {
                warn!("Cannot read genome decisions: {}", e);
                Vec::new()
            },
        }
    }

    /// Runs every stale stage up to and including the checkpoint.
    ///
    /// Errors found before any stage starts, such as an unreadable input or
    /// an unknown outgroup, are returned as `Err`. A stage that fails is
    /// reported in the [Outcome] of an `Ok` report.
    pub fn run(&mut self, checkpoint: Checkpoint) -> Result<RunReport, PipelineError> {
        let through = checkpoint.last_stage();
        self.check_outgroup()?;

        let verdict = {
            let probe = PipelineProbe { rundir: &self.rundir, config: &self.config };
            resolve(&self.manifest, &probe, through)?
        };

        let mut states: Vec<(Stage, StageState)> = Stage::ALL.iter()
            .map(|stage| (*stage, if *stage > through { StageState::Skipped } else { StageState::Pending }))
            .collect();
        let mut reused: Vec<Stage> = Vec::new();
        let mut executed: Vec<Stage> = Vec::new();

        let first_stale = match &verdict {
            Verdict::Stale { stage, reason } => {
                info!("Resuming at stage {}: {}", stage, reason);
                Some(*stage)
            },
            Verdict::UpToDate => {
                info!("Every stage through {} is up to date", through);
                None
            },
        };

        Stage::range(Stage::Validate, through)
            .filter(|stage| first_stale.map_or(true, |first| *stage < first))
            .for_each(|stage| {
                debug!("Reusing stage {}", stage);
                reused.push(stage);
                states[stage.ordinal()].1 = StageState::Reused;
            });

        let mut outcome = None;
        if let Some(first_stale) = first_stale {
            let stale: Vec<Stage> = Stage::range(first_stale, Stage::Tree).collect();
            self.rundir.clear_stages(&stale, self.policy())?;
            self.manifest.invalidate_from(first_stale);
            self.manifest.save(&self.rundir.manifest())?;

            for stage in Stage::range(first_stale, through) {
                states[stage.ordinal()].1 = StageState::Running;
                info!("Running stage {}", stage);
                match self.run_stage(stage) {
                    Ok(()) => {
                        states[stage.ordinal()].1 = StageState::Completed;
                        executed.push(stage);
                        info!("Stage {} completed", stage);
                    },
                    Err(error) => {
                        states[stage.ordinal()].1 = StageState::Failed;
                        error!("Stage {} failed: {}", stage, error);
                        if let Err(e) = self.rundir.clear_stages(&[stage], OverwritePolicy::Overwrite) {
                            warn!("Cannot remove partial outputs of stage {}: {}", stage, e);
                        }
                        outcome = Some(Outcome::Failed { stage, error });
                        break
                    },
                }
            }
        }

        let outcome = outcome.unwrap_or_else(|| if checkpoint.stops_early() {
            Outcome::Checkpoint(through)
        } else {
            Outcome::Finished { tree: self.rundir.treefile() }
        });

        let exclusions = match &outcome {
            Outcome::Failed { error: PipelineError::MissingGenesWithoutAck { exclusions, .. }, .. } => exclusions.clone(),
            _ => self.exclusions(),
        };
        Ok(RunReport {
            run_id: self.rundir.run_id().to_string(),
            executed,
            reused,
            states,
            exclusions,
            outcome,
        })
    }

    /// Runs one stage and records it in the manifest.
    fn run_stage(&mut self, stage: Stage) -> Result<(), PipelineError> {
        let probe = PipelineProbe { rundir: &self.rundir, config: &self.config };
        let inputs = fingerprint_all(&probe.consumed(stage)?)?;
        let parameters = probe.parameters(stage);

        let ctx = StageContext { rundir: &self.rundir, config: &self.config, tools: &self.tools };
        stages::execute(stage, &ctx)?;

        let outputs = fingerprint_all(&self.rundir.outputs(stage)?)?;
        self.manifest.record(stage, StageRecord::completed_now(inputs, outputs, parameters));
        self.manifest.save(&self.rundir.manifest())
    }
}

// Tests
#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::config::Config;
    use crate::error::PipelineError;
    use crate::stage::Checkpoint;
    use crate::tools::{Aligner, SearchTool, Toolbox, TreeBuilder};

    use super::{Pipeline, RunReport};

    const RECA: &str = "ATGGCTATCGACGAAAACAAACAGAAAGCGTTGGCGGCAGCACTG";
    const GYRB: &str = "ATGTCGAATTCTTATGACTCCTCCAGTATCAAAGTCCTGAAAGGG";

    #[derive(Default)]
    struct Calls {
        indexes: AtomicUsize,
        searches: AtomicUsize,
        alignments: AtomicUsize,
        trees: AtomicUsize,
        outgroup: Mutex<Option<String>>,
    }

    fn read_fasta(path: &Path) -> Vec<(String, String)> {
        let contents = std::fs::read_to_string(path).unwrap();
        let mut records: Vec<(String, String)> = Vec::new();
        for line in contents.lines() {
            if let Some(header) = line.strip_prefix('>') {
                records.push((header.split_whitespace().next().unwrap_or_default().to_string(), String::new()));
            } else if let Some(last) = records.last_mut() {
                last.1.push_str(line.trim());
            }
        }
        records
    }

    // Reports a perfect hit wherever a query occurs verbatim in the genome.
    struct FakeSearch {
        calls: Arc<Calls>,
        fail: bool,
    }

    impl SearchTool for FakeSearch {
        fn build_index(&self, genome: &Path, index_prefix: &Path) -> Result<(), PipelineError> {
            self.calls.indexes.fetch_add(1, Ordering::SeqCst);
            std::fs::copy(genome, index_prefix.with_extension("idx"))?;
            Ok(())
        }

        fn search(&self, query: &Path, index_prefix: &Path, _evalue: f64, out: &Path) -> Result<(), PipelineError> {
            self.calls.searches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                std::fs::write(out, "partial")?;
                return Err(PipelineError::SearchToolFailure("search crashed".to_string()))
            }
            let genome = read_fasta(&index_prefix.with_extension("idx"));
            let mut lines = String::from("# fake search\n");
            for (gene, seq) in read_fasta(query) {
                for (contig, target) in genome.iter() {
                    if let Some(pos) = target.find(&seq) {
                        lines += &format!("{}\t{}\t100.0\t1e-50\t500\t100\t{}\t{}\t{}\n", gene, contig, pos + 1, pos + seq.len(), seq);
                    }
                }
            }
            std::fs::write(out, lines)?;
            Ok(())
        }
    }

    struct FakeAligner {
        calls: Arc<Calls>,
    }

    impl Aligner for FakeAligner {
        fn align(&self, unaligned: &Path, out: &Path, _options: &[String]) -> Result<(), PipelineError> {
            self.calls.alignments.fetch_add(1, Ordering::SeqCst);
            std::fs::copy(unaligned, out)?;
            Ok(())
        }
    }

    struct FakeTree {
        calls: Arc<Calls>,
    }

    impl TreeBuilder for FakeTree {
        fn build(&self, nexus: &Path, workdir: &Path, _threads: usize, _options: &[String], outgroup: Option<&str>) -> Result<PathBuf, PipelineError> {
            self.calls.trees.fetch_add(1, Ordering::SeqCst);
            *self.calls.outgroup.lock().unwrap() = outgroup.map(|s| s.to_string());
            let treefile = workdir.join(format!("{}.treefile", nexus.display()));
            std::fs::write(&treefile, "(a,b,c);\n")?;
            std::fs::write(workdir.join(format!("{}.log", nexus.display())), "done\n")?;
            Ok(treefile)
        }
    }

    fn write_genome(dir: &Path, file: &str, genes: &[&str], filler: &str) {
        let body: String = genes.iter().map(|gene| format!("{}{}", filler, gene)).collect();
        std::fs::write(dir.join(file), format!(">contig1 {}\n{}{}\n", file, body, filler)).unwrap();
    }

    // Three genomes with both genes and a query file with both genes.
    fn fixture() -> (tempfile::TempDir, Config) {
        let dir = tempfile::TempDir::new().unwrap();
        let genomes = dir.path().join("genomes");
        std::fs::create_dir(&genomes).unwrap();
        write_genome(&genomes, "a.fna", &[RECA, GYRB], "AAAA");
        write_genome(&genomes, "b.fna", &[RECA, GYRB], "CCCC");
        write_genome(&genomes, "c.fna", &[GYRB, RECA], "GGGG");
        let query = dir.path().join("markers.fasta");
        std::fs::write(&query, format!(">recA\n{}\n>gyrB\n{}\n", RECA, GYRB)).unwrap();

        let config = Config { query: vec![query], dir: vec![genomes], ..Default::default() };
        (dir, config)
    }

    fn toolbox(calls: &Arc<Calls>, fail_search: bool) -> Toolbox {
        Toolbox {
            search: Box::new(FakeSearch { calls: calls.clone(), fail: fail_search }),
            aligner: Box::new(FakeAligner { calls: calls.clone() }),
            tree: Box::new(FakeTree { calls: calls.clone() }),
        }
    }

    fn open(dir: &Path, config: &Config, calls: &Arc<Calls>, fail_search: bool) -> Pipeline {
        let rundir = crate::rundir::RunDir::create(dir, "run").unwrap();
        Pipeline::open(rundir, config.clone(), toolbox(calls, fail_search)).unwrap()
    }

    fn run(dir: &Path, config: &Config, checkpoint: Checkpoint, calls: &Arc<Calls>) -> RunReport {
        open(dir, config, calls, false).run(checkpoint).unwrap()
    }

    #[test]
    fn unchanged_rerun_recomputes_nothing() {
        use super::{Outcome, StageState};
        use crate::stage::Stage;

        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());

        let first = run(dir.path(), &config, Checkpoint::None, &calls);
        assert_eq!(first.executed, Stage::ALL.to_vec());
        assert!(first.reused.is_empty());
        assert!(matches!(&first.outcome, Outcome::Finished { tree } if tree.is_file()));
        assert_eq!(first.exit_code(), 0);
        assert_eq!(calls.indexes.load(Ordering::SeqCst), 3);
        assert_eq!(calls.searches.load(Ordering::SeqCst), 6);
        assert_eq!(calls.alignments.load(Ordering::SeqCst), 2);

        let second = run(dir.path(), &config, Checkpoint::None, &calls);
        assert!(second.executed.is_empty());
        assert_eq!(second.reused, Stage::ALL.to_vec());
        assert!(second.states.iter().all(|(_, state)| *state == StageState::Reused));
        assert_eq!(calls.searches.load(Ordering::SeqCst), 6);
        assert_eq!(calls.alignments.load(Ordering::SeqCst), 2);
        assert_eq!(calls.trees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn touched_but_unchanged_genome_is_reused() {
        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());
        run(dir.path(), &config, Checkpoint::None, &calls);

        let genome = dir.path().join("genomes/a.fna");
        let contents = std::fs::read(&genome).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&genome, contents).unwrap();

        let again = run(dir.path(), &config, Checkpoint::None, &calls);
        assert!(again.executed.is_empty());
    }

    #[test]
    fn coverage_change_reruns_from_filtering() {
        use crate::stage::Stage;

        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());
        run(dir.path(), &config, Checkpoint::None, &calls);

        let stricter = Config { coverage: 60.0, ..config.clone() };
        let again = run(dir.path(), &stricter, Checkpoint::None, &calls);

        assert_eq!(again.reused, vec![Stage::Validate, Stage::Preblast]);
        assert_eq!(again.executed, Stage::range(Stage::Filtering, Stage::Tree).collect::<Vec<_>>());
        assert_eq!(calls.searches.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn checkpoint_prealign_never_aligns() {
        use super::{Outcome, StageState};
        use crate::stage::Stage;

        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());

        let report = run(dir.path(), &config, Checkpoint::At(Stage::Prealign), &calls);

        assert!(matches!(report.outcome, Outcome::Checkpoint(Stage::Prealign)));
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.executed, Stage::range(Stage::Validate, Stage::Prealign).collect::<Vec<_>>());
        assert_eq!(report.states[Stage::Postalign.ordinal()].1, StageState::Skipped);
        assert_eq!(calls.alignments.load(Ordering::SeqCst), 0);
        assert!(dir.path().join("run/unaligned/recA.fasta").is_file());
        assert!(!dir.path().join("run/aligned").exists());

        let rest = run(dir.path(), &config, Checkpoint::None, &calls);
        assert_eq!(rest.executed, vec![Stage::Postalign, Stage::Nexus, Stage::Tree]);
        assert_eq!(calls.alignments.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unaligned_records_are_named_by_genome() {
        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());
        run(dir.path(), &config, Checkpoint::None, &calls);

        let got = read_fasta(&dir.path().join("run/unaligned/gyrB.fasta"));
        let expected: Vec<(String, String)> = ["a", "b", "c"].iter()
            .map(|genome| (genome.to_string(), GYRB.to_string()))
            .collect();
        assert_eq!(got, expected);

        let nexus = std::fs::read_to_string(dir.path().join("run/run.nex")).unwrap();
        assert!(nexus.contains("charset gyrB = aligned/gyrB.aln: *;"));
    }

    #[test]
    fn missing_gene_exclusion_needs_acknowledgement() {
        use super::Outcome;
        use crate::filter::Exclusion;
        use crate::stage::Stage;

        let (dir, config) = fixture();
        write_genome(&dir.path().join("genomes"), "d.fna", &[RECA], "TTTT");
        let calls = Arc::new(Calls::default());

        let report = run(dir.path(), &config, Checkpoint::None, &calls);
        let excluded_d = vec![Exclusion { genome: "d".to_string(), reason: "missing gene gyrB".to_string() }];
        let review = dir.path().join("run/.mlsaflow/missing_review");
        match &report.outcome {
            Outcome::Failed { stage: Stage::Filtering, error: PipelineError::MissingGenesWithoutAck { genomes, exclusions, review: got } } => {
                assert_eq!(genomes, &vec!["d".to_string()]);
                assert_eq!(exclusions, &excluded_d);
                assert_eq!(got, &review);
            },
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.exit_code(), 78);
        assert_eq!(report.exclusions, excluded_d);

        let matrix = std::fs::read_to_string(review.join("presence_matrix.tsv")).unwrap();
        assert!(matrix.lines().any(|line| line.starts_with("d\t")));
        assert!(review.join("blast_summary.json").is_file());
        let missing: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(review.join("missing_by_genome.json")).unwrap()).unwrap();
        assert_eq!(missing, serde_json::json!({"d": ["gyrB"]}));

        let pipeline = open(dir.path(), &config, &calls, false);
        assert!(pipeline.manifest().completed(Stage::Preblast).is_some());
        assert!(pipeline.manifest().completed(Stage::Filtering).is_none());
        assert!(!dir.path().join("run/filtered_hits.tsv").exists());

        let acknowledged = Config { missing_check: true, ..config.clone() };
        let report = run(dir.path(), &acknowledged, Checkpoint::None, &calls);

        assert_eq!(report.executed[0], Stage::Filtering);
        assert!(matches!(report.outcome, Outcome::Finished { .. }));
        assert_eq!(report.exclusions, vec![Exclusion { genome: "d".to_string(), reason: "missing gene gyrB".to_string() }]);

        assert!(!review.exists());

        let reused = run(dir.path(), &acknowledged, Checkpoint::None, &calls);
        assert!(reused.executed.is_empty());
        assert_eq!(reused.exclusions, report.exclusions);
    }

    #[test]
    fn allowed_missing_gene_keeps_genome() {
        use crate::stage::Stage;

        let (dir, config) = fixture();
        write_genome(&dir.path().join("genomes"), "d.fna", &[RECA], "TTTT");
        let calls = Arc::new(Calls::default());

        let lenient = Config { allow_missing: 1, ..config };
        let report = run(dir.path(), &lenient, Checkpoint::At(Stage::Prealign), &calls);

        assert!(report.exclusions.is_empty());
        let recs: Vec<String> = read_fasta(&dir.path().join("run/unaligned/recA.fasta")).into_iter().map(|(name, _)| name).collect();
        assert_eq!(recs, vec!["a", "b", "c", "d"]);
        let gyrs = read_fasta(&dir.path().join("run/unaligned/gyrB.fasta"));
        assert_eq!(gyrs.len(), 3);
    }

    #[test]
    fn search_failure_halts_without_recording() {
        use super::Outcome;
        use crate::stage::Stage;

        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());

        let report = open(dir.path(), &config, &calls, true).run(Checkpoint::None).unwrap();

        assert!(matches!(report.outcome, Outcome::Failed { stage: Stage::Preblast, error: PipelineError::SearchToolFailure(_) }));
        assert_eq!(report.exit_code(), 70);
        assert_eq!(report.executed, vec![Stage::Validate]);
        assert_eq!(calls.alignments.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("run/blast").exists());

        let pipeline = open(dir.path(), &config, &calls, false);
        assert!(pipeline.manifest().completed(Stage::Validate).is_some());
        assert!(pipeline.manifest().completed(Stage::Preblast).is_none());

        let retry = run(dir.path(), &config, Checkpoint::None, &calls);
        assert_eq!(retry.reused, vec![Stage::Validate]);
        assert!(matches!(retry.outcome, Outcome::Finished { .. }));
    }

    #[test]
    fn protect_backs_up_stale_artifacts() {
        use crate::stage::Stage;

        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());
        run(dir.path(), &config, Checkpoint::None, &calls);
        let backup = dir.path().join("run/backup");

        let protected = Config { mafft: "--auto".to_string(), protect: true, ..config.clone() };
        let report = run(dir.path(), &protected, Checkpoint::None, &calls);

        assert_eq!(report.executed, vec![Stage::Postalign, Stage::Nexus, Stage::Tree]);
        let stamps: Vec<PathBuf> = std::fs::read_dir(&backup).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(stamps.len(), 1);
        assert!(stamps[0].join("aligned/recA.aln").is_file());
        assert!(stamps[0].join("run.nex").is_file());
        assert!(stamps[0].join("run.nex.treefile").is_file());

        let overwritten = Config { mafft: "--globalpair".to_string(), protect: false, ..config };
        run(dir.path(), &overwritten, Checkpoint::None, &calls);

        assert_eq!(std::fs::read_dir(&backup).unwrap().count(), 1);
        assert!(dir.path().join("run/aligned/recA.aln").is_file());
    }

    #[test]
    fn deleted_genome_reruns_from_validate() {
        use crate::stage::Stage;

        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());
        run(dir.path(), &config, Checkpoint::None, &calls);

        std::fs::remove_file(dir.path().join("genomes/c.fna")).unwrap();
        let report = run(dir.path(), &config, Checkpoint::None, &calls);

        assert_eq!(report.executed, Stage::ALL.to_vec());
        assert_eq!(calls.indexes.load(Ordering::SeqCst), 5);
        assert!(!dir.path().join("run/fasta/c.fasta").exists());
        let recs = read_fasta(&dir.path().join("run/aligned/recA.aln"));
        assert_eq!(recs.len(), 2);
    }

    #[test]
    fn identical_genomes_are_excluded_as_duplicates() {
        use crate::filter::Exclusion;

        let (dir, config) = fixture();
        let genomes = dir.path().join("genomes");
        let copy = std::fs::read_to_string(genomes.join("a.fna")).unwrap().replace("contig1", "scaffold7");
        std::fs::write(genomes.join("a_copy.fna"), copy).unwrap();
        let calls = Arc::new(Calls::default());

        let report = run(dir.path(), &config, Checkpoint::None, &calls);

        assert_eq!(report.exclusions, vec![Exclusion { genome: "a_copy".to_string(), reason: "duplicate of a".to_string() }]);
        assert_eq!(calls.indexes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn outgroup_is_checked_before_any_stage() {
        use crate::stage::Stage;

        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());

        let unknown = Config { outgroup: Some("zzz".to_string()), ..config.clone() };
        let got = open(dir.path(), &unknown, &calls, false).run(Checkpoint::None);
        assert!(matches!(got, Err(PipelineError::ConfigurationError(_))));
        assert!(open(dir.path(), &config, &calls, false).manifest().completed(Stage::Validate).is_none());

        let rooted = Config { outgroup: Some("b.fna".to_string()), ..config };
        run(dir.path(), &rooted, Checkpoint::None, &calls);
        assert_eq!(*calls.outgroup.lock().unwrap(), Some("b".to_string()));
    }

    #[test]
    fn unreadable_query_fails_before_any_stage() {
        let (dir, config) = fixture();
        let calls = Arc::new(Calls::default());
        run(dir.path(), &config, Checkpoint::None, &calls);

        std::fs::remove_file(&config.query[0]).unwrap();
        let got = open(dir.path(), &config, &calls, false).run(Checkpoint::None);

        assert!(matches!(got, Err(PipelineError::InputUnreadable { .. })));
    }

    #[test]
    fn empty_genome_fails_validation_without_leftovers() {
        use super::Outcome;
        use crate::stage::Stage;

        let (dir, config) = fixture();
        let empty = dir.path().join("e.fna");
        std::fs::write(&empty, "").unwrap();
        let config = Config { files: vec![empty], ..config };
        let calls = Arc::new(Calls::default());

        let report = run(dir.path(), &config, Checkpoint::None, &calls);

        assert!(matches!(report.outcome,
            Outcome::Failed { stage: Stage::Validate, error: PipelineError::InputUnreadable { .. } }));
        assert_eq!(report.exit_code(), 66);
        assert!(!dir.path().join("run/fasta/e.fasta").exists());
        assert_eq!(calls.indexes.load(Ordering::SeqCst), 0);
    }
}
