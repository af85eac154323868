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

//! External collaborators: sequence search, alignment and tree building.
//!
//! Each tool sits behind a trait so the pipeline can be driven by in-process
//! fakes. The implementations in the submodules shell out to BLAST+, MAFFT
//! and IQ-TREE.
//!
//! Tool invocations that are independent of each other (one search per
//! genome × query, one alignment per gene) run on a local worker pool of
//! bounded size, see [run_bounded].

pub mod blast;
pub mod iqtree;
pub mod mafft;

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Output;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::debug;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;

use crate::config::Config;
use crate::error::PipelineError;

/// Builds search indexes and runs searches against them.
pub trait SearchTool: Sync {
    /// Makes `genome` searchable under `index_prefix`.
    fn build_index(&self, genome: &Path, index_prefix: &Path) -> Result<(), PipelineError>;

    /// Searches `query` against the index, writing tabular results to `out`.
    fn search(&self, query: &Path, index_prefix: &Path, evalue: f64, out: &Path) -> Result<(), PipelineError>;
}

/// Multiple sequence aligner.
pub trait Aligner: Sync {
    fn align(&self, unaligned: &Path, out: &Path, options: &[String]) -> Result<(), PipelineError>;
}

/// Partitioned maximum likelihood tree builder.
pub trait TreeBuilder: Sync {
    /// Builds a tree from `nexus`, running in `workdir`. Returns the tree file.
    fn build(
        &self,
        nexus: &Path,
        workdir: &Path,
        threads: usize,
        options: &[String],
        outgroup: Option<&str>,
    ) -> Result<PathBuf, PipelineError>;
}

/// The tools one run uses.
pub struct Toolbox {
    pub search: Box<dyn SearchTool>,
    pub aligner: Box<dyn Aligner>,
    pub tree: Box<dyn TreeBuilder>,
}

impl Toolbox {
    /// BLAST+, MAFFT and IQ-TREE, looked up in `config.external` or `PATH`.
    pub fn external(config: &Config) -> Self {
        let external = config.external.as_deref();
        Toolbox {
            search: Box::new(blast::BlastTool::new(config.program, external)),
            aligner: Box::new(mafft::Mafft::new(external)),
            tree: Box::new(iqtree::IqTree::new(external)),
        }
    }
}

/// An executable found by name.
///
/// Lookup happens when the tool is first needed so that a run that reuses
/// every stage does not require the tool to be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    name: String,
    external: Option<PathBuf>,
}

impl Executable {
    pub fn new(name: &str, external: Option<&Path>) -> Self {
        Executable { name: name.to_string(), external: external.map(|p| p.to_path_buf()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the executable: `<external>/<name>`, `<external>/bin/<name>`,
    /// then the first executable match on `PATH`.
    pub fn resolve(&self) -> Result<PathBuf, PipelineError> {
        let not_found = |e: which::Error| PipelineError::ConfigurationError(format!(
            "cannot find {} ({}); add it to PATH or give its location with --external", self.name, e));

        if let Some(dir) = &self.external {
            let dirs = std::env::join_paths([dir.clone(), dir.join("bin")])
                .map_err(|e| PipelineError::ConfigurationError(format!(
                    "cannot search {} for {}: {}", dir.display(), self.name, e)))?;
            match which::which_in(&self.name, Some(dirs), dir) {
                Ok(path) => return Ok(path),
                Err(e) => debug!("{} not in {}: {}", self.name, dir.display(), e),
            }
        }
        which::which(&self.name).map_err(not_found)
    }

    pub fn command(&self) -> Result<Command, PipelineError> {
        Ok(Command::new(self.resolve()?))
    }
}

/// Runs `cmd` to completion, turning a failed spawn or nonzero exit into the
/// error built by `fail`.
pub fn run_command<F>(cmd: &mut Command, what: &str, fail: F) -> Result<Output, PipelineError>
where
    F: Fn(String) -> PipelineError,
{
    debug!("Running {:?}", cmd);
    let output = cmd.output().map_err(|e| fail(format!("cannot run {}: {}", what, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last_lines: Vec<&str> = stderr.lines().rev().take(5).collect();
        let last_lines: Vec<&str> = last_lines.into_iter().rev().collect();
        return Err(fail(format!("{} failed ({}): {}", what, output.status, last_lines.join(" | "))))
    }
    Ok(output)
}

/// Runs `f` on every task with at most `threads` tasks in flight.
///
/// Once a task fails, tasks that have not started yet are skipped and the
/// first failure is returned. Tasks already running are left to finish.
pub fn run_bounded<T, F>(threads: usize, tasks: &[T], f: F) -> Result<(), PipelineError>
where
    T: Sync,
    F: Fn(&T) -> Result<(), PipelineError> + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| PipelineError::ConfigurationError(format!("cannot start {} worker threads: {}", threads, e)))?;

    let cancelled = AtomicBool::new(false);
    pool.install(|| {
        tasks.par_iter().try_for_each(|task| {
            if cancelled.load(Ordering::Acquire) {
                return Ok(())
            }
            f(task).inspect_err(|_| cancelled.store(true, Ordering::Release))
        })
    })
}

// Tests
#[cfg(test)]
mod tests {

    #[test]
    fn run_bounded_runs_every_task() {
        use super::run_bounded;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let done = AtomicUsize::new(0);
        let tasks: Vec<usize> = (0..20).collect();

        run_bounded(3, &tasks, |_| {
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }).unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn run_bounded_stops_after_failure() {
        use super::run_bounded;
        use crate::error::PipelineError;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let started = AtomicUsize::new(0);
        let tasks: Vec<usize> = (0..50).collect();

        let got = run_bounded(1, &tasks, |task| {
            started.fetch_add(1, Ordering::SeqCst);
            if *task == 2 {
                return Err(PipelineError::SearchToolFailure("boom".to_string()))
            }
            Ok(())
        });

        assert!(matches!(got, Err(PipelineError::SearchToolFailure(_))));
        assert!(started.load(Ordering::SeqCst) < 50);
    }

    // Writes a shell script at `path` with the given mode.
    #[cfg(unix)]
    fn write_tool(path: &std::path::Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;

        std::fs::write(path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn external_dir_wins_over_path() {
        use super::Executable;

        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        write_tool(&dir.path().join("bin/mafft"), 0o755);

        let got = Executable::new("mafft", Some(dir.path())).resolve().unwrap();

        assert_eq!(got, dir.path().join("bin/mafft"));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_file_does_not_shadow_tool() {
        use super::Executable;

        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        write_tool(&dir.path().join("iqtree2"), 0o644);
        write_tool(&dir.path().join("bin/iqtree2"), 0o755);

        let got = Executable::new("iqtree2", Some(dir.path())).resolve().unwrap();

        assert_eq!(got, dir.path().join("bin/iqtree2"));
    }

    #[test]
    fn missing_executable_is_a_configuration_error() {
        use super::Executable;
        use crate::error::PipelineError;

        let dir = tempfile::TempDir::new().unwrap();
        let got = Executable::new("surely-not-an-installed-tool-4821", Some(dir.path())).resolve();

        assert!(matches!(got, Err(PipelineError::ConfigurationError(_))));
    }

    #[test]
    fn nonzero_exit_is_mapped_to_tool_failure() {
        use super::run_command;
        use crate::error::PipelineError;
        use std::process::Command;

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo nope >&2; exit 3"]);

        let got = run_command(&mut cmd, "sh", PipelineError::AlignmentToolFailure);

        match got {
            Err(PipelineError::AlignmentToolFailure(msg)) => assert!(msg.contains("nope")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
