use std::io::{self, Write};

use dbprobe_db::{OutcomeSink, ProbeOutcome, ProbeReport};

/// Writes one line per probed target.
pub struct TerminalReporter<W> {
    out: W,
    reachable: usize,
    unreachable: usize,
}

impl TerminalReporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            reachable: 0,
            unreachable: 0,
        }
    }

    pub fn reachable(&self) -> usize {
        self.reachable
    }

    pub fn unreachable(&self) -> usize {
        self.unreachable
    }
}

impl<W: Write> OutcomeSink for TerminalReporter<W> {
    fn report(&mut self, report: &ProbeReport) {
        if report.outcome.is_reachable() {
            self.reachable += 1;
        } else {
            self.unreachable += 1;
        }
        let line = render(report);
        if let Err(err) = writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            tracing::warn!("Failed to write report line: {err}");
        }
    }
}

fn render(report: &ProbeReport) -> String {
    match &report.outcome {
        ProbeOutcome::Reachable => format!("✓ {}", report.target),
        ProbeOutcome::ConnectFailed(err) => {
            format!("✗ Could not open DB {}: {err}", report.target)
        }
        ProbeOutcome::PingFailed(err) => {
            format!("✗ Could not ping DB {}: {err}", report.target)
        }
    }
}
