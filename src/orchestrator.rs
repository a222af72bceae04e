use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::process::Command;

use crate::config::Config;
use crate::governor::{Breach, Governor, ProcessObservation};
use crate::language::{BuildContext, CommandSpec, LanguageStrategy};
use crate::submission::Submission;
use crate::workspace::{Workspace, WorkspaceState};

/// Phase of a job in which an internal fault happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Populate,
    Compile,
    Run,
}

/// Why a build step counts as failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileFailure {
    ExitStatus,
    Breach(Breach),
    Diagnostics,
    MissingArtifact(String),
}

/// Raw material for the classifier; no verdict has been taken yet
#[derive(Debug)]
pub enum RawExecution {
    CompileFailed {
        compile: ProcessObservation,
        reason: CompileFailure,
    },
    Completed {
        compile: Option<ProcessObservation>,
        run: ProcessObservation,
    },
    Faulted {
        stage: Stage,
        error: anyhow::Error,
    },
}

/// Materializes a submission and drives its build and run steps
#[derive(Debug, Clone)]
pub struct Orchestrator {
    compile: Governor,
    run: Governor,
    path: String,
}

impl Orchestrator {
    pub fn new(compile: Governor, run: Governor, path: impl Into<String>) -> Self {
        Self {
            compile,
            run,
            path: path.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let poll_interval = Duration::from(config.governor.memory_poll_interval_ms);
        let lock_sessions = config.governor.lock_sessions;
        Self::new(
            Governor::new(config.compile_limits(), poll_interval).with_session_lock(lock_sessions),
            Governor::new(config.limits, poll_interval).with_session_lock(lock_sessions),
            config.path.clone(),
        )
    }

    /// Runs one submission inside `workspace`
    ///
    /// Never fails: infrastructure problems come back as
    /// [`RawExecution::Faulted`] so the caller can still classify and clean up.
    pub async fn execute(
        &self,
        workspace: &mut Workspace,
        submission: &Submission,
        language: &dyn LanguageStrategy,
    ) -> RawExecution {
        let entry_name = submission
            .entry_name()
            .map(str::to_owned)
            .unwrap_or_else(|| language.entry_name(submission.source_text()));
        let source_file = language.source_file_name(&entry_name);

        let mut source = submission.source_text().as_bytes().to_vec();
        if !source.ends_with(b"\n") {
            source.push(b'\n');
        }
        if let Err(e) = workspace.write_file(&source_file, &source) {
            return RawExecution::Faulted {
                stage: Stage::Populate,
                error: anyhow::Error::new(e).context(format!("Failed to write {source_file}")),
            };
        }

        let dir = workspace.root().to_path_buf();
        let ctx = BuildContext {
            source_file: &source_file,
            entry_name: &entry_name,
            workspace_dir: &dir,
        };
        workspace.advance(WorkspaceState::Executing);

        let compile = match language.compile_command(&ctx) {
            Some(spec) => {
                log::debug!("Compiling submission {} in {}", submission.id(), workspace.id());
                let observation = match self.step(&self.compile, &dir, &spec, None).await {
                    Ok(observation) => observation,
                    Err(error) => {
                        workspace.advance(WorkspaceState::Completed);
                        return RawExecution::Faulted {
                            stage: Stage::Compile,
                            error,
                        };
                    }
                };

                if let Some(reason) = compile_failure(&observation, language, &ctx) {
                    log::debug!("Submission {} failed to compile: {reason:?}", submission.id());
                    workspace.advance(WorkspaceState::Completed);
                    return RawExecution::CompileFailed {
                        compile: observation,
                        reason,
                    };
                }
                Some(observation)
            }
            None => None,
        };

        log::debug!("Running submission {} in {}", submission.id(), workspace.id());
        let spec = language.run_command(&ctx);
        let stdin = submission.stdin().map(str::as_bytes);
        let result = self.step(&self.run, &dir, &spec, stdin).await;
        workspace.advance(WorkspaceState::Completed);

        match result {
            Ok(_) if !workspace.exists() => RawExecution::Faulted {
                stage: Stage::Run,
                error: anyhow!("Workspace {} vanished during execution", workspace.id()),
            },
            Ok(run) => RawExecution::Completed { compile, run },
            Err(error) => RawExecution::Faulted {
                stage: Stage::Run,
                error,
            },
        }
    }

    async fn step(
        &self,
        governor: &Governor,
        dir: &Path,
        spec: &CommandSpec,
        stdin: Option<&[u8]>,
    ) -> Result<ProcessObservation> {
        if !dir.is_dir() {
            return Err(anyhow!("Workspace {} vanished", dir.display()));
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(dir)
            .env_clear()
            .env("PATH", &self.path)
            .env("HOME", dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        governor.run(command, stdin).await
    }
}

fn compile_failure(
    observation: &ProcessObservation,
    language: &dyn LanguageStrategy,
    ctx: &BuildContext<'_>,
) -> Option<CompileFailure> {
    if let Some(breach) = observation.breach {
        return Some(CompileFailure::Breach(breach));
    }
    if observation.exit_code != Some(0) {
        return Some(CompileFailure::ExitStatus);
    }
    if language.fail_on_diagnostics() && !observation.stderr.bytes.is_empty() {
        return Some(CompileFailure::Diagnostics);
    }
    match language.expected_artifact(ctx) {
        Some(artifact) if !ctx.workspace_dir.join(&artifact).exists() => {
            Some(CompileFailure::MissingArtifact(artifact))
        }
        _ => None,
    }
}
