use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::classify::AttemptFailure;
use crate::classify::Classification;
use crate::classify::EngineStep;
use crate::classify::FailureClassifier;
use crate::classify::apply_repair;
use crate::client::SidecarClient;
use crate::config::QmdConfig;
use crate::error::CommandError;
use crate::error::QmdError;
use crate::error::Result;
use crate::lock::AdvisoryLock;
use crate::lock::InvocationLock;
use crate::model_cache::ensure_model_cache;
use crate::runner::CommandOutput;
use crate::runner::CommandRunner;
use crate::runner::EngineCommand;
use crate::workspace::STATE_DIR;

/// Total attempts per invocation, repairs included.
pub const MAX_ATTEMPTS: u32 = 3;

const BACKOFF_STEP: Duration = Duration::from_millis(200);

pub fn cache_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(STATE_DIR).join("cache")
}

pub fn home_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(STATE_DIR).join("home")
}

/// Runs engine subcommands for a workspace under its lock, retrying and
/// repairing classified failures.
pub struct EngineInvoker {
    binary: String,
    index_name: String,
    shared_models_dir: Option<PathBuf>,
    runner: Arc<dyn CommandRunner>,
    locks: InvocationLock,
    classifier: FailureClassifier,
    sidecar: Option<SidecarClient>,
}

impl EngineInvoker {
    pub fn new(
        config: &QmdConfig,
        runner: Arc<dyn CommandRunner>,
        advisory: Arc<dyn AdvisoryLock>,
    ) -> Result<Self> {
        let sidecar = match config.sidecar_url.as_deref() {
            Some(url) => Some(SidecarClient::new(url)?),
            None => None,
        };
        Ok(Self {
            binary: config.binary.clone(),
            index_name: config.index_name.clone(),
            shared_models_dir: config.shared_models_dir.clone(),
            runner,
            locks: InvocationLock::new(advisory),
            classifier: FailureClassifier::new(&config.tolerated_embed_signatures),
            sidecar,
        })
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Returns the engine's combined output, or the terminal failure once
    /// retries are exhausted. The child is killed if `deadline` passes.
    pub async fn run(&self, workspace_dir: &Path, args: &[String], deadline: Instant) -> Result<Vec<u8>> {
        if let Some(sidecar) = &self.sidecar {
            return sidecar.run(workspace_dir, args, deadline).await;
        }

        let budget = deadline.saturating_duration_since(Instant::now());
        let cache_dir = cache_dir(workspace_dir);
        let home_dir = home_dir(workspace_dir);
        tokio::fs::create_dir_all(&cache_dir).await?;
        tokio::fs::create_dir_all(&home_dir).await?;

        let _lease = self.locks.acquire(workspace_dir, deadline).await?;
        ensure_model_cache(&home_dir, self.shared_models_dir.as_deref())?;

        let command = self.command(workspace_dir, &cache_dir, &home_dir, args);
        let step = EngineStep::from_args(args);
        let mut attempt = 1;
        let mut repaired = false;
        loop {
            debug!(command = %command.display(), attempt, "running qmd");
            let output = match tokio::time::timeout_at(deadline, self.runner.run(&command)).await {
                Err(_) => {
                    return Err(QmdError::Timeout {
                        command: command.display(),
                        timeout: budget,
                    });
                }
                Ok(Ok(output)) if output.success => return Ok(output.output),
                Ok(Ok(output)) => output,
                Ok(Err(err)) => {
                    let failure = AttemptFailure {
                        step,
                        output: "",
                        spawn_error: Some(err.kind()),
                    };
                    if self.classifier.classify(&failure) == Classification::EngineUnavailable {
                        return Err(QmdError::Unavailable(format!(
                            "{}: {err}; install qmd and ensure it is in PATH",
                            self.binary
                        )));
                    }
                    return Err(CommandError::new(
                        command.display(),
                        "",
                        err.to_string(),
                        Classification::Fatal,
                    )
                    .into());
                }
            };

            let text = output.text();
            let classification = self.classifier.classify(&AttemptFailure {
                step,
                output: &text,
                spawn_error: None,
            });
            let terminal = match classification {
                Classification::RepairThenRetry(plan) if !repaired && attempt < MAX_ATTEMPTS => {
                    repaired = true;
                    match apply_repair(&plan) {
                        Ok(true) => {
                            info!(path = %plan.missing.display(), "applied sqlite-vec compatibility repair");
                            attempt += 1;
                            continue;
                        }
                        Ok(false) => {
                            warn!(path = %plan.missing.display(), "sqlite-vec repair not applicable");
                        }
                        Err(err) => {
                            warn!(path = %plan.missing.display(), error = %err, "sqlite-vec repair failed");
                        }
                    }
                    Classification::Fatal
                }
                Classification::RepairThenRetry(_) => Classification::Fatal,
                Classification::RetryTransient if attempt < MAX_ATTEMPTS => {
                    let wait = BACKOFF_STEP * attempt;
                    if Instant::now() + wait >= deadline {
                        Classification::RetryTransient
                    } else {
                        warn!(
                            workspace = %workspace_dir.display(),
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            "qmd transient failure; retrying"
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                }
                other => other,
            };
            return Err(self.command_error(&command, &output, &text, terminal));
        }
    }

    fn command(&self, workspace_dir: &Path, cache_dir: &Path, home_dir: &Path, args: &[String]) -> EngineCommand {
        let mut full_args = Vec::with_capacity(args.len() + 2);
        full_args.push("--index".to_string());
        full_args.push(self.index_name.clone());
        full_args.extend(args.iter().cloned());
        EngineCommand {
            program: self.binary.clone(),
            args: full_args,
            cwd: workspace_dir.to_path_buf(),
            env: vec![
                ("NO_COLOR".to_string(), OsString::from("1")),
                ("XDG_CACHE_HOME".to_string(), cache_dir.as_os_str().to_owned()),
                ("HOME".to_string(), home_dir.as_os_str().to_owned()),
            ],
        }
    }

    fn command_error(
        &self,
        command: &EngineCommand,
        output: &CommandOutput,
        text: &str,
        classification: Classification,
    ) -> QmdError {
        CommandError::new(command.display(), text, output.exit_reason(), classification).into()
    }
}
