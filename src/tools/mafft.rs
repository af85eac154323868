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

//! MAFFT aligner.
use std::fs::File;
use std::path::Path;
use std::process::Stdio;

use log::warn;

use crate::error::PipelineError;
use crate::tools::run_command;
use crate::tools::Aligner;
use crate::tools::Executable;

pub struct Mafft {
    exe: Executable,
}

impl Mafft {
    pub fn new(external: Option<&Path>) -> Self {
        Mafft { exe: Executable::new("mafft", external) }
    }
}

fn remove_partial(out: &Path) {
    if let Err(e) = std::fs::remove_file(out) {
        warn!("Cannot remove partial alignment {}: {}", out.display(), e);
    }
}

impl Aligner for Mafft {
    /// Writes the alignment MAFFT prints on stdout to `out`. A partial
    /// alignment is removed if MAFFT fails.
    fn align(&self, unaligned: &Path, out: &Path, options: &[String]) -> Result<(), PipelineError> {
        let mut cmd = self.exe.command()?;
        let conn_out = File::create(out)?;
        cmd.args(options).arg(unaligned)
            .stdout(Stdio::from(conn_out))
            .stderr(Stdio::piped());

        let what = format!("mafft on {}", unaligned.display());
        run_command(&mut cmd, &what, PipelineError::AlignmentToolFailure).inspect_err(|_| remove_partial(out))?;

        if std::fs::metadata(out).map(|m| m.len()).unwrap_or(0) == 0 {
            remove_partial(out);
            return Err(PipelineError::AlignmentToolFailure(format!("{} produced an empty alignment", what)))
        }
        Ok(())
    }
}
