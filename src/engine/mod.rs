//! Step executor for installer documents.
//!
//! A phase run walks the document's steps in order, keeps the ones belonging
//! to the requested phase, and runs each as a plain remote command or as an
//! interactive terminal session. The first failing step aborts the phase;
//! steps already run are left as they are.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::installer::{InstallerSpec, Phase, Step};
use crate::progress::ProgressSink;
use crate::pty::{PtyAutomation, PtyError};
use crate::remote::{RemoteCommandOutput, RemoteError, RemoteShell, build_step_command};
use crate::template::TemplateContext;

/// Errors that abort a phase.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StepError {
    /// A plain command exited unsuccessfully.
    #[error("step '{step}' exited with status {status}: {stderr}")]
    CommandFailed {
        /// Step label.
        step: String,
        /// Exit status, or `unknown` when the command was killed.
        status: String,
        /// Last lines of standard error.
        stderr: String,
    },
    /// An interactive command exited unsuccessfully.
    #[error("interactive step '{step}' exited with status {status}")]
    TtyFailed {
        /// Step label.
        step: String,
        /// Exit status, or `unknown` when the command was killed.
        status: String,
    },
    /// The command could not be started.
    #[error("step '{step}' could not run: {source}")]
    Remote {
        /// Step label.
        step: String,
        /// Transport failure.
        #[source]
        source: RemoteError,
    },
    /// The terminal session broke.
    #[error("step '{step}' lost its terminal: {source}")]
    Pty {
        /// Step label.
        step: String,
        /// Session failure.
        #[source]
        source: PtyError,
    },
}

const STDERR_TAIL_LINES: usize = 5;

fn status_text(code: Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |code| code.to_string())
}

fn label(index: usize, step: &Step) -> String {
    if step.name.trim().is_empty() {
        format!("#{}", index + 1)
    } else {
        step.name.clone()
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines.get(start..).unwrap_or_default().join("\n")
}

/// Runs installer phases against one host.
pub struct StepExecutor<'a> {
    shell: &'a dyn RemoteShell,
    pty: &'a PtyAutomation,
    progress: &'a dyn ProgressSink,
}

impl std::fmt::Debug for StepExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("pty", self.pty)
            .finish_non_exhaustive()
    }
}

impl<'a> StepExecutor<'a> {
    /// Creates an executor writing progress to `progress`.
    #[must_use]
    pub const fn new(
        shell: &'a dyn RemoteShell,
        pty: &'a PtyAutomation,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            shell,
            pty,
            progress,
        }
    }

    /// Runs every step of `phase` whose guard passes and returns how many
    /// steps ran.
    ///
    /// Install steps carry no guard and always run. SSL steps run only when
    /// their guard evaluates to true against `vars`.
    ///
    /// # Errors
    ///
    /// Returns the [`StepError`] of the first failing step.
    pub async fn run_phase(
        &self,
        spec: &InstallerSpec,
        phase: Phase,
        vars: &TemplateContext,
    ) -> Result<usize, StepError> {
        let mut executed = 0;
        for (index, step) in spec.steps.iter().enumerate() {
            if step.phase() != phase {
                continue;
            }
            if phase == Phase::Ssl && !vars.evaluate(&step.condition) {
                debug!(step = %label(index, step), guard = %step.condition, "guard is false; skipping");
                continue;
            }
            self.run_step(index, step, vars).await?;
            executed += 1;
        }
        info!(app = %spec.app_name, phase = phase.as_str(), executed, "phase finished");
        Ok(executed)
    }

    async fn run_step(
        &self,
        index: usize,
        step: &Step,
        vars: &TemplateContext,
    ) -> Result<(), StepError> {
        if !step.name.trim().is_empty() {
            self.progress.line(&format!("==> {}", step.name));
        }
        if !step.log.is_empty() {
            self.progress.line(&vars.render(&step.log));
        }
        if let Some(pause) = step.sleep.filter(|pause| !pause.is_zero()) {
            self.pause(pause).await;
        }
        if step.run.trim().is_empty() {
            return Ok(());
        }

        let command = build_step_command(&vars.render(&step.run));
        if step.tty.enabled {
            let code = self
                .pty
                .run(self.shell, &command, &step.tty.auto_answers, vars)
                .await
                .map_err(|source| StepError::Pty {
                    step: label(index, step),
                    source,
                })?;
            if code != Some(0) {
                return Err(StepError::TtyFailed {
                    step: label(index, step),
                    status: status_text(code),
                });
            }
            return Ok(());
        }

        let output = self
            .shell
            .run(&command)
            .await
            .map_err(|source| StepError::Remote {
                step: label(index, step),
                source,
            })?;
        self.relay(&output);
        if output.is_success() {
            Ok(())
        } else {
            Err(StepError::CommandFailed {
                step: label(index, step),
                status: status_text(output.exit_code),
                stderr: stderr_tail(&output.stderr),
            })
        }
    }

    async fn pause(&self, pause: Duration) {
        self.progress
            .line(&format!("waiting {}s", pause.as_secs()));
        sleep(pause).await;
    }

    fn relay(&self, output: &RemoteCommandOutput) {
        for line in output.stdout.lines().chain(output.stderr.lines()) {
            if !line.trim().is_empty() {
                self.progress.line(line);
            }
        }
    }
}

#[cfg(test)]
mod tests;
