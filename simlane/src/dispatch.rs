// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ExpectedError, Result},
    output::{OutputContext, OutputOpts, clap_styles},
    reporter::RunReporter,
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use simlane_runner::{
    config::{FailureTolerance, LaneCount, SimlaneConfig, SimlaneProfile},
    partition::{Assignment, pack},
    runner::OrchestratorBuilder,
    sandbox::ProcessSandbox,
    signal::SignalHandlerKind,
    universe::{TestDurations, TestFilter, TestSelector, TestUniverse, read_test_list},
};
use std::{
    fs::File,
    io::{self, BufReader, Write},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, warn};

/// Run a test bundle across parallel sandboxed lanes.
#[derive(Debug, Parser)]
#[command(version, name = "simlane", styles = clap_styles::style())]
pub struct SimlaneApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl SimlaneApp {
    /// Initializes logging and returns the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        match self.command {
            Command::Plan(opts) => opts.exec(),
            Command::Run(opts) => opts.exec(output),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print how tests would be distributed across lanes, without running
    /// anything
    Plan(PlanOpts),

    /// Run tests across lanes, retrying as configured
    ///
    /// The runner command after `--` is started once per lane, in a scratch
    /// directory, with the lane's tests in `SIMLANE_TESTS`.
    Run(RunOpts),
}

#[derive(Debug, Args)]
struct UniverseOpts {
    /// Config file [default: .config/simlane.toml if present]
    #[arg(long, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// Profile to use
    #[arg(
        long,
        short = 'P',
        env = "SIMLANE_PROFILE",
        default_value = SimlaneConfig::DEFAULT_PROFILE,
    )]
    profile: String,

    /// File listing the tests, one `Suite/case` per line
    #[arg(long, value_name = "PATH")]
    test_list: Utf8PathBuf,

    /// JSON file mapping `Suite/case` to historical durations in seconds
    #[arg(long, value_name = "PATH")]
    durations: Option<Utf8PathBuf>,

    /// Number of lanes ("num-cpus" for one per CPU)
    #[arg(long, short = 'j', value_name = "LANES")]
    lanes: Option<LaneCount>,

    /// Only run these tests or suites (replaces the profile's include list)
    #[arg(long, value_name = "SELECTOR")]
    include: Vec<TestSelector>,

    /// Skip these tests or suites (added to the profile's exclude list)
    #[arg(long, value_name = "SELECTOR")]
    exclude: Vec<TestSelector>,
}

impl UniverseOpts {
    fn make_config(&self) -> Result<SimlaneConfig> {
        Ok(SimlaneConfig::from_sources(
            Utf8Path::new("."),
            self.config_file.as_deref(),
        )?)
    }

    fn make_universe(&self, profile: &SimlaneProfile<'_>) -> Result<TestUniverse> {
        let file = open_argument_file("test-list", &self.test_list)?;
        let tests = read_test_list(BufReader::new(file)).map_err(|err| {
            ExpectedError::TestListReadError {
                file_name: self.test_list.clone(),
                err,
            }
        })?;
        let mut universe = TestUniverse::new(tests)?;

        if let Some(path) = &self.durations {
            let file = open_argument_file("durations", path)?;
            let durations = TestDurations::from_json(BufReader::new(file)).map_err(|err| {
                ExpectedError::TestDurationsReadError {
                    file_name: path.clone(),
                    err,
                }
            })?;
            debug!(count = durations.len(), "loaded historical durations");
            universe = universe.with_durations(durations);
        }

        let profile_filter = profile.test_filter();
        let include = if self.include.is_empty() {
            profile_filter.include().to_vec()
        } else {
            self.include.clone()
        };
        let exclude = profile_filter
            .exclude()
            .iter()
            .chain(&self.exclude)
            .cloned()
            .collect();

        Ok(universe
            .with_no_split_groups(profile.no_split_groups())
            .with_filter(TestFilter::new(include, exclude)))
    }
}

fn open_argument_file(arg_name: &'static str, path: &Utf8Path) -> Result<File> {
    File::open(path).map_err(|err| ExpectedError::ArgumentFileReadError {
        arg_name,
        file_name: path.to_owned(),
        err,
    })
}

#[derive(Debug, Args)]
struct PlanOpts {
    #[command(flatten)]
    universe: UniverseOpts,
}

impl PlanOpts {
    fn exec(self) -> Result<i32> {
        let config = self.universe.make_config()?;
        let profile = config.profile(&self.universe.profile)?;
        let universe = self.universe.make_universe(&profile)?;
        let lanes = self.universe.lanes.unwrap_or_else(|| profile.lanes());

        let assignment = pack(&universe, lanes.compute())?;
        if let Err(error) = write_plan(&assignment, io::stdout().lock()) {
            warn!(%error, "error writing plan");
        }

        Ok(0)
    }
}

fn write_plan(assignment: &Assignment, mut writer: impl Write) -> io::Result<()> {
    for lane in assignment.populated() {
        writeln!(
            writer,
            "lane {} ({:.3}s, {} tests):",
            lane.index(),
            lane.weight(),
            lane.tests().len(),
        )?;
        for test in lane.tests() {
            writeln!(writer, "    {test}")?;
        }
    }
    writeln!(
        writer,
        "{} tests in {} lanes, estimated {:.3}s",
        assignment.test_count(),
        assignment.populated_count(),
        assignment.makespan(),
    )?;
    writer.flush()
}

#[derive(Debug, Args)]
struct RunOpts {
    #[command(flatten)]
    universe: UniverseOpts,

    /// Artifact installed into each instance before launching
    #[arg(long, value_name = "PATH")]
    artifact: Option<Utf8PathBuf>,

    /// Number of attempts to make beyond the first
    #[arg(long, value_name = "COUNT")]
    retries: Option<u32>,

    /// Failing tests an attempt may have and still be retried: a count, or a
    /// percentage such as "10%"
    #[arg(long, value_name = "TOLERANCE")]
    failure_tolerance: Option<FailureTolerance>,

    /// Only re-run the tests that did not pass in the previous attempt
    #[arg(long)]
    only_retry_failed: bool,

    /// The test runner command and its arguments
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl RunOpts {
    fn exec(self, output: OutputContext) -> Result<i32> {
        let config = self.universe.make_config()?;
        let profile = config.profile(&self.universe.profile)?;
        let universe = self.universe.make_universe(&profile)?;
        if universe.filtered_count() == 0 {
            return Err(ExpectedError::NoTestsRun);
        }
        let Some((program, args)) = self.command.split_first() else {
            return Err(ExpectedError::MissingRunnerCommand);
        };

        let mut builder = OrchestratorBuilder::default();
        if let Some(lanes) = self.universe.lanes {
            builder.set_lanes(lanes);
        }
        if let Some(retries) = self.retries {
            builder.set_retries(profile.error_retries().with_count(retries));
        }
        if let Some(tolerance) = self.failure_tolerance {
            builder.set_failure_tolerance(tolerance);
        }
        if self.only_retry_failed {
            builder.set_only_retry_failed(true);
        }
        if let Some(artifact) = &self.artifact {
            builder.set_artifact(artifact.clone());
        }

        let mut sandbox = ProcessSandbox::new(program.clone(), args.iter().cloned());
        sandbox.set_termination_grace(profile.termination_grace());
        let sandbox = Arc::new(sandbox);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("simlane-runner")
            .build()
            .map_err(|err| ExpectedError::TokioRuntimeError { err })?;

        let styles = output.stderr_styles();
        let mut reporter = RunReporter::new(io::stderr(), styles, output.verbose);
        let start = Instant::now();
        let summary = runtime.block_on(async {
            let orchestrator = builder.build(&profile, SignalHandlerKind::Standard)?;
            debug!(
                lanes = orchestrator.lane_count().get(),
                tests = universe.filtered_count(),
                "starting run"
            );
            let summary = orchestrator
                .run(sandbox, &universe, |event| {
                    if let Err(error) = reporter.report_event(event) {
                        warn!(%error, "error writing progress");
                    }
                })
                .await;
            Ok::<_, ExpectedError>(summary)
        })?;

        if let Err(error) = reporter.report_summary(&summary, start.elapsed()) {
            warn!(%error, "error writing summary");
        }
        if let Some(error) = summary
            .last_attempt()
            .and_then(|attempt| attempt.configuration_error.as_ref())
        {
            tracing::error!("invalid no-split configuration: {error}");
        }
        let delete_failures = summary.statistics.infrastructure.delete_failures;
        if delete_failures > 0 {
            warn!("{delete_failures} instance(s) could not be deleted");
        }
        debug!(
            failing = %summary
                .last_attempt()
                .map(|attempt| attempt.failing.iter().join(", "))
                .unwrap_or_default(),
            "run finished"
        );

        Ok(summary.final_status.exit_code())
    }
}
