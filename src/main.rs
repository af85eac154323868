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
use clap::Parser;
use log::{error, info};

use mlsaflow::config::Config;
use mlsaflow::pipeline::Pipeline;
use mlsaflow::rundir::RunDir;
use mlsaflow::tools::Toolbox;
use mlsaflow::PipelineError;
use mlsaflow::RunReport;

mod cli;

/// Initializes the logger with verbosity given in `log_max_level`.
fn init_log(log_max_level: usize) {
    let res = stderrlog::new()
    .module(module_path!())
    .quiet(false)
    .verbosity(log_max_level)
    .timestamp(stderrlog::Timestamp::Off)
    .init();
    if let Err(e) = res {
        eprintln!("Cannot initialize logging: {}", e);
    }
}

fn run(cli: &cli::Cli) -> Result<RunReport, PipelineError> {
    let cwd = std::env::current_dir()?;
    let rundir = RunDir::create(&cwd, &cli.runid)?;

    let copy_from = cli.config.as_deref().map(mlsaflow::config::absolute);
    let stored = Config::stored(&rundir.config(), copy_from.as_deref())?;
    let config = Config::reconcile(cli.overrides(), stored);

    info!("Run {} in {}", cli.runid, rundir.root().display());
    let tools = Toolbox::external(&config);
    let mut pipeline = Pipeline::open(rundir, config, tools)?;
    pipeline.run(cli.checkpoint)
}

fn main() {
    let cli = cli::Cli::parse();
    init_log(cli.verbosity());

    let code = match run(&cli) {
        Ok(report) => {
            report.log();
            report.exit_code()
        },
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        },
    };
    std::process::exit(code);
}
