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

//! Decides the earliest stage that has to be recomputed.
//!
//! Stages are walked in order. The first stage whose recorded inputs,
//! parameters or outputs disagree with the current state is stale, and so is
//! everything after it; the walk stops there because later stages consume
//! artifacts that are about to be regenerated anyway.

use std::path::PathBuf;

use log::debug;

use crate::error::PipelineError;
use crate::fingerprint::changed_parameters;
use crate::fingerprint::ParameterSnapshot;
use crate::manifest::RunManifest;
use crate::manifest::StageRecord;
use crate::stage::Stage;

/// Current view of what each stage would consume.
pub trait InputProbe {
    /// Files the stage reads, as `(manifest key, path)` pairs.
    ///
    /// Must fail with [InputUnreadable](PipelineError::InputUnreadable) only
    /// for declared user inputs; artifacts that are simply absent are left
    /// out of the list.
    fn consumed(&self, stage: Stage) -> Result<Vec<(String, PathBuf)>, PipelineError>;

    /// Parameters that influence the stage's outputs.
    fn parameters(&self, stage: Stage) -> ParameterSnapshot;

    /// Path of a recorded output key.
    fn locate(&self, key: &str) -> PathBuf;
}

/// Why a stage is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// No completed record for the stage.
    NeverCompleted,
    /// Files consumed now that were not consumed last time.
    InputsAdded(Vec<String>),
    /// Files consumed last time that are gone now.
    InputsRemoved(Vec<String>),
    /// A consumed file has different content.
    InputChanged(String),
    /// One or more parameters differ.
    ParametersChanged(Vec<String>),
    /// A file the stage produced no longer exists.
    OutputMissing(String),
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StaleReason::NeverCompleted => write!(f, "no completed run recorded"),
            StaleReason::InputsAdded(keys) => write!(f, "new inputs: {}", keys.join(", ")),
            StaleReason::InputsRemoved(keys) => write!(f, "removed inputs: {}", keys.join(", ")),
            StaleReason::InputChanged(key) => write!(f, "input changed: {}", key),
            StaleReason::ParametersChanged(names) => write!(f, "parameters changed: {}", names.join(", ")),
            StaleReason::OutputMissing(key) => write!(f, "output missing: {}", key),
        }
    }
}

/// Outcome of [resolve].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// `stage` and everything after it must be recomputed.
    Stale { stage: Stage, reason: StaleReason },
    /// Every stage through the requested one completed with matching inputs.
    UpToDate,
}

impl Verdict {
    pub fn first_stale(&self) -> Option<Stage> {
        match self {
            Verdict::Stale { stage, .. } => Some(*stage),
            Verdict::UpToDate => None,
        }
    }
}

/// Finds the earliest stale stage among `Validate..=through`.
pub fn resolve<P: InputProbe>(
    manifest: &RunManifest,
    probe: &P,
    through: Stage,
) -> Result<Verdict, PipelineError> {
    for stage in Stage::range(Stage::Validate, through) {
        if let Some(reason) = check_stage(manifest.completed(stage), stage, probe)? {
            debug!("Stage {} is stale: {}", stage, reason);
            return Ok(Verdict::Stale { stage, reason })
        }
        debug!("Stage {} is up to date", stage);
    }
    Ok(Verdict::UpToDate)
}

fn check_stage<P: InputProbe>(
    record: Option<&StageRecord>,
    stage: Stage,
    probe: &P,
) -> Result<Option<StaleReason>, PipelineError> {
    let Some(record) = record else {
        return Ok(Some(StaleReason::NeverCompleted))
    };

    let current = probe.consumed(stage)?;

    let added: Vec<String> = current.iter()
        .filter(|(key, _)| !record.inputs.contains_key(key))
        .map(|(key, _)| key.clone())
        .collect();
    if !added.is_empty() {
        return Ok(Some(StaleReason::InputsAdded(added)))
    }

    if current.len() != record.inputs.len() {
        let removed: Vec<String> = record.inputs.keys()
            .filter(|key| !current.iter().any(|(k, _)| k == *key))
            .cloned()
            .collect();
        return Ok(Some(StaleReason::InputsRemoved(removed)))
    }

    let changed = changed_parameters(&record.parameters, &probe.parameters(stage));
    if !changed.is_empty() {
        return Ok(Some(StaleReason::ParametersChanged(changed)))
    }

    for (key, path) in current.iter() {
        let matches = match record.inputs.get(key) {
            Some(fingerprint) => fingerprint.matches_file(path)?,
            None => false,
        };
        if !matches {
            return Ok(Some(StaleReason::InputChanged(key.clone())))
        }
    }

    if let Some(key) = record.outputs.keys().find(|key| !probe.locate(key).is_file()) {
        return Ok(Some(StaleReason::OutputMissing(key.clone())))
    }

    Ok(None)
}

// Tests
#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    use crate::error::PipelineError;
    use crate::fingerprint::{fingerprint_all, ParameterSnapshot};
    use crate::manifest::{RunManifest, StageRecord};
    use crate::stage::Stage;

    use super::InputProbe;

    // One file per stage plus a parameter snapshot per stage.
    struct MapProbe {
        root: PathBuf,
        files: HashMap<Stage, Vec<(String, PathBuf)>>,
        params: HashMap<Stage, ParameterSnapshot>,
    }

    impl MapProbe {
        fn new(root: &Path) -> Self {
            let mut files = HashMap::new();
            let mut params = HashMap::new();
            Stage::ALL.iter().for_each(|stage| {
                let path = root.join(format!("{}.in", stage));
                std::fs::write(&path, stage.name()).unwrap();
                files.insert(*stage, vec![(stage.name().to_string(), path)]);
                params.insert(*stage, crate::fingerprint::snapshot([("p", stage.ordinal())]));
            });
            MapProbe { root: root.to_path_buf(), files, params }
        }

        fn complete_all(&self) -> RunManifest {
            let mut manifest = RunManifest::new("run");
            Stage::ALL.iter().for_each(|stage| {
                let inputs = fingerprint_all(&self.files[stage]).unwrap();
                manifest.record(*stage, StageRecord::completed_now(inputs, Default::default(), self.params[stage].clone()));
            });
            manifest
        }
    }

    impl InputProbe for MapProbe {
        fn consumed(&self, stage: Stage) -> Result<Vec<(String, PathBuf)>, PipelineError> {
            Ok(self.files[&stage].clone())
        }
        fn parameters(&self, stage: Stage) -> ParameterSnapshot {
            self.params[&stage].clone()
        }
        fn locate(&self, key: &str) -> PathBuf {
            self.root.join(key)
        }
    }

    #[test]
    fn unchanged_run_is_up_to_date() {
        use super::{resolve, Verdict};

        let dir = tempfile::TempDir::new().unwrap();
        let probe = MapProbe::new(dir.path());
        let manifest = probe.complete_all();

        assert_eq!(resolve(&manifest, &probe, Stage::Tree).unwrap(), Verdict::UpToDate);
    }

    #[test]
    fn empty_manifest_starts_at_validate() {
        use super::{resolve, StaleReason, Verdict};

        let dir = tempfile::TempDir::new().unwrap();
        let probe = MapProbe::new(dir.path());

        let got = resolve(&RunManifest::new("run"), &probe, Stage::Tree).unwrap();
        assert_eq!(got, Verdict::Stale { stage: Stage::Validate, reason: StaleReason::NeverCompleted });
    }

    #[test]
    fn changed_input_stales_exactly_its_stage() {
        use super::resolve;

        // Monotonic invalidation: a change at any stage reports that stage, never an earlier one.
        Stage::ALL.iter().for_each(|changed| {
            let dir = tempfile::TempDir::new().unwrap();
            let probe = MapProbe::new(dir.path());
            let manifest = probe.complete_all();

            std::fs::write(&probe.files[changed][0].1, "edited").unwrap();

            let got = resolve(&manifest, &probe, Stage::Tree).unwrap();
            assert_eq!(got.first_stale(), Some(*changed));
        });
    }

    #[test]
    fn parameter_change_stales_consuming_stage_only() {
        use super::{resolve, StaleReason, Verdict};

        let dir = tempfile::TempDir::new().unwrap();
        let mut probe = MapProbe::new(dir.path());
        let manifest = probe.complete_all();

        probe.params.insert(Stage::Filtering, crate::fingerprint::snapshot([("p", 99)]));

        let got = resolve(&manifest, &probe, Stage::Tree).unwrap();
        assert_eq!(got, Verdict::Stale { stage: Stage::Filtering, reason: StaleReason::ParametersChanged(vec!["p".to_string()]) });
    }

    #[test]
    fn added_and_removed_inputs_are_mismatches() {
        use super::{resolve, StaleReason, Verdict};

        let dir = tempfile::TempDir::new().unwrap();
        let mut probe = MapProbe::new(dir.path());
        let manifest = probe.complete_all();

        let extra = dir.path().join("g2.fasta");
        std::fs::write(&extra, ">1\nAC\n").unwrap();
        probe.files.get_mut(&Stage::Validate).unwrap().push(("g2.fasta".to_string(), extra));
        let got = resolve(&manifest, &probe, Stage::Tree).unwrap();
        assert_eq!(got, Verdict::Stale { stage: Stage::Validate, reason: StaleReason::InputsAdded(vec!["g2.fasta".to_string()]) });

        probe.files.insert(Stage::Preblast, Vec::new());
        probe.files.get_mut(&Stage::Validate).unwrap().pop();
        let got = resolve(&manifest, &probe, Stage::Tree).unwrap();
        assert_eq!(got, Verdict::Stale { stage: Stage::Preblast, reason: StaleReason::InputsRemoved(vec!["preblast".to_string()]) });
    }

    #[test]
    fn stages_after_checkpoint_are_not_inspected() {
        use super::{resolve, Verdict};

        let dir = tempfile::TempDir::new().unwrap();
        let probe = MapProbe::new(dir.path());
        let mut manifest = probe.complete_all();
        manifest.invalidate_from(Stage::Postalign);

        assert_eq!(resolve(&manifest, &probe, Stage::Prealign).unwrap(), Verdict::UpToDate);
        assert_eq!(resolve(&manifest, &probe, Stage::Tree).unwrap().first_stale(), Some(Stage::Postalign));
    }

    #[test]
    fn deleted_output_stales_producer() {
        use super::{resolve, StaleReason, Verdict};
        use crate::fingerprint::FingerprintSet;

        let dir = tempfile::TempDir::new().unwrap();
        let probe = MapProbe::new(dir.path());
        let mut manifest = probe.complete_all();

        let mut outputs = FingerprintSet::new();
        outputs.insert("blast/recA_vs_g1.tab".to_string(), crate::fingerprint::Fingerprint::of_bytes(b""));
        let mut record = manifest.completed(Stage::Preblast).unwrap().clone();
        record.outputs = outputs;
        manifest.record(Stage::Preblast, record);

        let got = resolve(&manifest, &probe, Stage::Tree).unwrap();
        assert_eq!(got, Verdict::Stale { stage: Stage::Preblast, reason: StaleReason::OutputMissing("blast/recA_vs_g1.tab".to_string()) });
    }
}
