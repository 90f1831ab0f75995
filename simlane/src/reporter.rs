// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-readable progress and summary output for `simlane run`.

use crate::output::StderrStyles;
use owo_colors::OwoColorize;
use simlane_runner::{
    runner::{ExitStatus, LaneReport, OrchestratorEvent, RunSummary},
    statistics::Statistics,
};
use std::{io, time::Duration};

pub(crate) struct RunReporter<W> {
    writer: W,
    styles: StderrStyles,
    verbose: bool,
}

impl<W: io::Write> RunReporter<W> {
    pub(crate) fn new(writer: W, styles: StderrStyles, verbose: bool) -> Self {
        Self {
            writer,
            styles,
            verbose,
        }
    }

    pub(crate) fn report_event(&mut self, event: OrchestratorEvent<'_>) -> io::Result<()> {
        match event {
            OrchestratorEvent::AttemptStarted {
                attempt,
                assignment,
            } => {
                writeln!(
                    self.writer,
                    "{:>12} attempt {attempt}: {} across {} (estimated {:.1}s)",
                    "Starting".style(self.styles.pass),
                    plural(assignment.test_count(), "test", "tests").style(self.styles.count),
                    plural(assignment.populated_count(), "lane", "lanes").style(self.styles.count),
                    assignment.makespan(),
                )?;
            }
            OrchestratorEvent::ConfigurationError { attempt, error } => {
                writeln!(
                    self.writer,
                    "{:>12} attempt {attempt}: {error}",
                    "CONFIG".style(self.styles.fail),
                )?;
            }
            OrchestratorEvent::LaneStateChanged(change) => {
                if self.verbose {
                    writeln!(
                        self.writer,
                        "{:>12} [lane {}] {}",
                        "", change.lane, change.state
                    )?;
                }
            }
            OrchestratorEvent::LaneFinished(report) => self.write_lane(report)?,
            OrchestratorEvent::AttemptFinished {
                attempt,
                status,
                failing,
            } => {
                writeln!(
                    self.writer,
                    "{:>12} attempt {attempt}: {} ({} not passed)",
                    "Finished".style(self.styles.bold),
                    status.style(self.status_style(status)),
                    plural(failing, "test", "tests"),
                )?;
            }
            OrchestratorEvent::RetryScheduled {
                next_attempt,
                delay,
            } => {
                writeln!(
                    self.writer,
                    "{:>12} attempt {next_attempt} in {}",
                    "Retrying".style(self.styles.warning_text),
                    humantime::format_duration(truncate_to_millis(delay)),
                )?;
            }
            OrchestratorEvent::Interrupted { signal } => {
                let cause = signal.map_or_else(|| "request".to_owned(), |signal| signal.to_string());
                writeln!(
                    self.writer,
                    "{:>12} by {cause}, stopping lanes",
                    "Interrupted".style(self.styles.fail),
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn write_lane(&mut self, report: &LaneReport) -> io::Result<()> {
        let total = report.tests.len();
        let passed = total - report.failing.len();
        writeln!(
            self.writer,
            "{:>12} [lane {}] {passed}/{total} passed",
            status_word(report.status).style(self.status_style(report.status)),
            report.lane,
        )?;
        if let Some(crash) = &report.crash {
            writeln!(self.writer, "{:>12} {crash}", "")?;
        }
        if let Some(kind) = report.timed_out_by {
            writeln!(self.writer, "{:>12} {kind} watchdog fired", "")?;
        }
        for test in &report.failing {
            writeln!(self.writer, "{:>12} {test}", "FAIL".style(self.styles.fail))?;
        }
        if let Some(error) = &report.delete_error {
            writeln!(
                self.writer,
                "{:>12} {error}",
                "warning".style(self.styles.warning_text)
            )?;
        }
        Ok(())
    }

    pub(crate) fn report_summary(&mut self, summary: &RunSummary, elapsed: Duration) -> io::Result<()> {
        let stats = &summary.statistics;
        writeln!(self.writer, "------------")?;
        writeln!(
            self.writer,
            "{:>12} [{:>9.3}s] {}, {}: {}",
            "Summary".style(self.styles.bold),
            elapsed.as_secs_f64(),
            plural(stats.attempts, "attempt", "attempts"),
            plural(stats.retries, "retry", "retries"),
            summary
                .final_status
                .style(self.status_style(summary.final_status)),
        )?;
        self.write_statistics(stats)?;

        if let Some(last) = summary.last_attempt()
            && !last.failing.is_empty()
        {
            writeln!(self.writer, "{:>12} in the last attempt:", "Not passed")?;
            for test in &last.failing {
                writeln!(self.writer, "{:>12} {test}", "FAIL".style(self.styles.fail))?;
            }
        }
        Ok(())
    }

    fn write_statistics(&mut self, stats: &Statistics) -> io::Result<()> {
        writeln!(
            self.writer,
            "{:>12} {} run: {} passed, {} failed, {} errored",
            "tests",
            stats.tests_run.style(self.styles.count),
            stats.passed,
            stats.failures,
            stats.errors,
        )?;

        let infra = &stats.infrastructure;
        if infra.total() > 0 || infra.delete_failures > 0 {
            writeln!(
                self.writer,
                "{:>12} {} create, {} boot, {} install, {} launch, {} simulator crashed, {} app crashed, {} delete",
                "infra",
                infra.create_failures,
                infra.boot_failures,
                infra.install_failures,
                infra.launch_failures,
                infra.simulator_crashes,
                infra.app_crashes,
                infra.delete_failures,
            )?;
        }
        if stats.timeouts.total() > 0 {
            writeln!(
                self.writer,
                "{:>12} {} no output, {} max execution",
                "timeouts", stats.timeouts.no_output, stats.timeouts.max_execution,
            )?;
        }
        if stats.parse_anomalies > 0 || stats.count_mismatches > 0 {
            writeln!(
                self.writer,
                "{:>12} {} anomalies, {} count mismatches",
                "output", stats.parse_anomalies, stats.count_mismatches,
            )?;
        }
        if stats.interrupted_lanes > 0 {
            writeln!(
                self.writer,
                "{:>12} {}",
                "interrupted",
                plural(stats.interrupted_lanes, "lane", "lanes"),
            )?;
        }
        Ok(())
    }

    fn status_style(&self, status: ExitStatus) -> owo_colors::Style {
        match status {
            ExitStatus::AllPassed => self.styles.pass,
            ExitStatus::TestsFailed | ExitStatus::TestTimeout => self.styles.fail,
            _ => self.styles.warning_text,
        }
    }
}

fn status_word(status: ExitStatus) -> &'static str {
    match status {
        ExitStatus::AllPassed => "PASS",
        ExitStatus::TestsFailed => "FAIL",
        ExitStatus::TestTimeout => "TIMEOUT",
        ExitStatus::Interrupted => "CANCEL",
        ExitStatus::ConfigurationError => "CONFIG",
        _ => "CRASH",
    }
}

fn plural(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}

fn truncate_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis().try_into().unwrap_or(u64::MAX))
}
