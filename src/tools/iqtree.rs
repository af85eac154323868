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

//! IQ-TREE tree builder.
use std::path::Path;
use std::path::PathBuf;

use crate::error::PipelineError;
use crate::tools::run_command;
use crate::tools::Executable;
use crate::tools::TreeBuilder;

pub struct IqTree {
    exe: Executable,
}

impl IqTree {
    pub fn new(external: Option<&Path>) -> Self {
        IqTree { exe: Executable::new("iqtree2", external) }
    }
}

/// Tree file IQ-TREE writes for a partition file.
pub fn treefile_of(nexus: &Path) -> PathBuf {
    let mut name = nexus.as_os_str().to_os_string();
    name.push(".treefile");
    PathBuf::from(name)
}

impl TreeBuilder for IqTree {
    fn build(
        &self,
        nexus: &Path,
        workdir: &Path,
        threads: usize,
        options: &[String],
        outgroup: Option<&str>,
    ) -> Result<PathBuf, PipelineError> {
        let mut cmd = self.exe.command()?;
        cmd.current_dir(workdir)
            .arg("-p").arg(nexus)
            .arg("-nt").arg(threads.to_string())
            .args(options);
        if let Some(outgroup) = outgroup {
            cmd.arg("-o").arg(outgroup);
        }
        run_command(&mut cmd, "iqtree2", PipelineError::TreeToolFailure)?;

        let treefile = treefile_of(&workdir.join(nexus));
        if !treefile.is_file() {
            return Err(PipelineError::TreeToolFailure(format!(
                "iqtree2 finished but wrote no tree to {}", treefile.display())))
        }
        Ok(treefile)
    }
}
