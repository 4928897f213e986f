//! Repeated sampling of one tool.
//!
//! Each tool moves `Pending -> Running -> {Ok, Partial, Unavailable}`, or
//! straight from `Pending` to `Unavailable` when it is disabled or its binary
//! is missing. Runs are strictly sequential and never retried; a failed run
//! is recorded and the next one starts.

use crate::adapters::{MeasurementRecord, ToolAdapter};
use crate::invoker::{CommandSpec, Invoke, InvokeError, Outcome};
use chrono::SecondsFormat;
use serde::Serialize;
use std::time::Duration;

/// Longest output excerpt kept from a failed run.
const MAX_FAILURE_OUTPUT: usize = 4096;

/// Lifecycle state of one tool within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Running,
    Ok,
    Partial,
    Unavailable,
}

/// Why a single run produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The binary could not be started for this and later runs.
    ToolMissing,
    Timeout,
    ToolError,
    ParseFailure,
}

/// Diagnostic for one failed run. Output is retained but never parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub run: u32,
    pub kind: FailureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub detail: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// What a runner hands to aggregation: records, failures, final state.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub tool: &'static str,
    pub target: Option<String>,
    pub state: ToolState,
    pub attempted: u32,
    pub records: Vec<MeasurementRecord>,
    pub failures: Vec<RunFailure>,
    /// Set when the tool never ran (disabled, missing binary, spawn failure).
    pub reason: Option<String>,
    /// Raw text of successful runs, for `--print-raw`.
    pub raw_outputs: Vec<String>,
}

impl ToolRun {
    /// A tool skipped by configuration.
    pub fn disabled(tool: &'static str, target: Option<String>) -> Self {
        ToolRun {
            tool,
            target,
            state: ToolState::Unavailable,
            attempted: 0,
            records: Vec::new(),
            failures: Vec::new(),
            reason: Some("disabled by configuration".to_string()),
            raw_outputs: Vec::new(),
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &text[..end])
}

/// Drives N sequential invocations of one tool through its adapter.
pub struct SampleRunner<'a, I: Invoke> {
    invoker: &'a I,
    adapter: &'a dyn ToolAdapter,
    command: CommandSpec,
    target: Option<String>,
    runs: u32,
    sleep_between: Duration,
    state: ToolState,
}

impl<'a, I: Invoke> SampleRunner<'a, I> {
    pub fn new(
        invoker: &'a I,
        adapter: &'a dyn ToolAdapter,
        command: CommandSpec,
        runs: u32,
    ) -> Self {
        Self {
            invoker,
            adapter,
            command,
            target: None,
            runs: runs.max(1),
            sleep_between: Duration::ZERO,
            state: ToolState::Pending,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_sleep_between(mut self, pause: Duration) -> Self {
        self.sleep_between = pause;
        self
    }

    fn transition(&mut self, next: ToolState) {
        tracing::debug!(
            tool = self.adapter.name(),
            from = ?self.state,
            to = ?next,
            "tool state transition"
        );
        self.state = next;
    }

    /// Final state from the run tally.
    fn settle(succeeded: u32, attempted: u32) -> ToolState {
        if succeeded == 0 {
            ToolState::Unavailable
        } else if succeeded == attempted {
            ToolState::Ok
        } else {
            ToolState::Partial
        }
    }

    /// Run every sample and return the collected results.
    pub async fn run(mut self) -> ToolRun {
        let tool = self.adapter.name();
        let mut out = ToolRun {
            tool,
            target: self.target.clone(),
            state: ToolState::Pending,
            attempted: 0,
            records: Vec::new(),
            failures: Vec::new(),
            reason: None,
            raw_outputs: Vec::new(),
        };

        self.transition(ToolState::Running);

        for run in 1..=self.runs {
            if run > 1 && !self.sleep_between.is_zero() {
                tokio::time::sleep(self.sleep_between).await;
            }

            let invocation = match self.invoker.invoke(&self.command).await {
                Ok(inv) => inv,
                Err(e) => {
                    // Missing or unspawnable binaries won't recover on the next run.
                    tracing::warn!(tool, error = %e, "tool unavailable, skipping remaining runs");
                    let reason = match &e {
                        InvokeError::ToolMissing { program } => format!("not installed: {program}"),
                        other => other.to_string(),
                    };
                    if out.attempted == 0 {
                        self.transition(ToolState::Unavailable);
                        out.state = self.state;
                        out.reason = Some(reason);
                        return out;
                    }
                    // The rest of the budget is spent as failed runs.
                    for skipped in run..=self.runs {
                        out.attempted += 1;
                        out.failures.push(RunFailure {
                            run: skipped,
                            kind: FailureKind::ToolMissing,
                            exit_code: None,
                            detail: reason.clone(),
                            output: String::new(),
                        });
                    }
                    out.reason = Some(reason);
                    break;
                }
            };
            out.attempted += 1;

            match invocation.outcome {
                Outcome::Success => {
                    match self.adapter.parse(&invocation.stdout, &invocation.stderr) {
                        Ok(mut record) => {
                            record.run = run;
                            record.started_at = Some(
                                invocation
                                    .started_at
                                    .to_rfc3339_opts(SecondsFormat::Secs, true),
                            );
                            tracing::info!(
                                tool,
                                run,
                                metrics = record.metrics.len(),
                                "run parsed"
                            );
                            out.records.push(record);
                            out.raw_outputs.push(invocation.combined_output());
                        }
                        Err(e) => {
                            tracing::warn!(tool, run, error = %e, "run output not recognised");
                            out.failures.push(RunFailure {
                                run,
                                kind: FailureKind::ParseFailure,
                                exit_code: invocation.exit_code,
                                detail: e.to_string(),
                                output: truncate(&invocation.combined_output(), MAX_FAILURE_OUTPUT),
                            });
                        }
                    }
                }
                Outcome::TimedOut => {
                    out.failures.push(RunFailure {
                        run,
                        kind: FailureKind::Timeout,
                        exit_code: None,
                        detail: format!(
                            "exceeded {}s timeout",
                            invocation.command.timeout.as_secs()
                        ),
                        output: truncate(&invocation.combined_output(), MAX_FAILURE_OUTPUT),
                    });
                }
                Outcome::ToolError => {
                    tracing::warn!(tool, run, exit_code = ?invocation.exit_code, "tool reported failure");
                    out.failures.push(RunFailure {
                        run,
                        kind: FailureKind::ToolError,
                        exit_code: invocation.exit_code,
                        detail: match invocation.exit_code {
                            Some(code) => format!("exited with status {code}"),
                            None => "terminated by signal".to_string(),
                        },
                        output: truncate(&invocation.combined_output(), MAX_FAILURE_OUTPUT),
                    });
                }
            }
        }

        let next = Self::settle(out.records.len() as u32, out.attempted);
        self.transition(next);
        out.state = self.state;
        if next == ToolState::Unavailable && out.reason.is_none() {
            out.reason = Some(format!("all {} runs failed", out.attempted));
        }
        out
    }
}
