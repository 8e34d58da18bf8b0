use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, RunReport, UnitState};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Console,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr, final summary on stdout.
pub struct ConsoleOutput;

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({}s)", event.message, elapsed.as_secs()),
            None => eprintln!("{}", event.message),
        }
    }
}

impl ConsoleOutput {
    pub fn print_summary(report: &RunReport) {
        let green = "\x1b[32m";
        let yellow = "\x1b[33m";
        let cyan = "\x1b[36m";
        let red = "\x1b[31m";
        let reset = "\x1b[0m";
        let summary = &report.summary;

        let mode = if report.dry_run { " (dry run)" } else { "" };
        println!("{cyan}{} batch summary{mode}{reset}", report.algorithm);
        if let Some(collection) = &report.collection_id {
            println!("{cyan}playlist: {collection}{reset}");
        }
        if report.dry_run {
            println!("{yellow}would submit: {}{reset}", summary.planned);
        }
        println!("{green}submitted: {}{reset}", summary.submitted);
        println!("{yellow}skipped (already done): {}{reset}", summary.skipped);
        println!("{green}succeeded: {}{reset}", summary.succeeded);
        if summary.downloaded > 0 {
            println!("{green}downloaded: {}{reset}", summary.downloaded);
        }
        println!(
            "{red}failed: {} (submission: {}){reset}",
            summary.failed + summary.failed_to_submit,
            summary.failed_to_submit
        );
        if summary.timed_out > 0 {
            println!("{yellow}still running at deadline: {}{reset}", summary.timed_out);
        }

        for unit in &report.units {
            match &unit.state {
                UnitState::FailedToSubmit { error } => {
                    println!("{red}  {} not submitted: {error}{reset}", unit.name);
                }
                UnitState::Failed { job_id, error } => {
                    println!(
                        "{red}  {} failed ({job_id}): {}{reset}",
                        unit.name,
                        error.as_deref().unwrap_or("no detail")
                    );
                }
                UnitState::TimedOut { job_id } => {
                    println!("{yellow}  {} timed out ({job_id}){reset}", unit.name);
                }
                _ => {}
            }
        }

        for warning in &report.warnings {
            println!("{yellow}warning: {warning}{reset}");
        }
    }
}
