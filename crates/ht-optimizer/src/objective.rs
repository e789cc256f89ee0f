//! Turning a parameter vector into a score by running the external evaluator.

use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ht_types::{
    EvaluationResult, EvaluatorConfig, EvaluatorError, ParameterSet, SearchSpace, TrialNumber,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long output pipes may stay open once the trainer itself has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Something that scores a parameter vector.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Axes the scheduler must ask the suggester for, in order.
    fn search_space(&self) -> &SearchSpace;

    /// Evaluate `parameters` for `trial`.
    ///
    /// Must return promptly with a `Cancelled` outcome once `cancel` fires.
    async fn evaluate(
        &self,
        trial: TrialNumber,
        parameters: &ParameterSet,
        cancel: &CancellationToken,
    ) -> EvaluationResult;
}

/// Record the evaluator leaves in its metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct EvaluatorMeta {
    pub best_iteration: u64,
    #[serde(alias = "best_va_loss")]
    pub best_score: f64,
}

/// Classify the raw contents of a metadata file.
pub fn classify_meta(bytes: &[u8]) -> EvaluationResult {
    let meta: EvaluatorMeta = match serde_json::from_slice(bytes) {
        Ok(meta) => meta,
        Err(e) => return EvaluationResult::malformed(format!("failed to parse metadata: {e}")),
    };
    if meta.best_iteration == 0 && meta.best_score == 0.0 {
        return EvaluationResult::malformed("evaluator produced no result (all-zero metadata)");
    }
    if !meta.best_score.is_finite() {
        return EvaluationResult::malformed(format!("non-finite score {}", meta.best_score));
    }
    EvaluationResult::scored(meta.best_score, meta.best_iteration)
}

/// Runs the external trainer once per trial.
///
/// Each trial gets its own metadata file, so concurrent trials never read
/// each other's output. A non-zero exit status is not a failure: the trainer
/// exits with 1 when early stopping kicks in.
///
/// The trainer runs in its own process group. Anything it leaves behind is
/// killed with it, whether the trial ends normally, times out or is cancelled.
#[derive(Debug, Clone)]
pub struct ObjectiveRunner {
    config: EvaluatorConfig,
    search_space: SearchSpace,
}

impl ObjectiveRunner {
    pub fn new(config: EvaluatorConfig, search_space: SearchSpace) -> Self {
        Self {
            config,
            search_space,
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Full argument list for `trial`, excluding the binary itself.
    pub fn command_args(
        &self,
        trial: TrialNumber,
        parameters: &ParameterSet,
    ) -> Result<Vec<OsString>, EvaluatorError> {
        let cfg = &self.config;
        let mut args: Vec<OsString> = vec!["-p".into(), cfg.validation_path.clone().into()];
        if cfg.auto_stop {
            args.push("--auto-stop".into());
            args.push("--auto-stop-threshold".into());
            args.push(cfg.auto_stop_threshold.to_string().into());
        }
        for binding in &cfg.bindings {
            let value = parameters.get(&binding.parameter).ok_or_else(|| {
                EvaluatorError::MissingParameter {
                    parameter: binding.parameter.clone(),
                }
            })?;
            args.push(binding.flag.clone().into());
            args.push(value.to_arg().into());
        }
        args.push("-t".into());
        args.push(cfg.max_iterations.to_string().into());
        args.push("--json-meta".into());
        args.push(cfg.meta_path(trial).into());
        args.push(cfg.train_path.clone().into());
        Ok(args)
    }

    async fn prepare_meta_path(&self, meta_path: &Path) -> Result<(), EvaluatorError> {
        let prepare_error = |source| EvaluatorError::Prepare {
            path: meta_path.display().to_string(),
            source,
        };
        if let Some(dir) = meta_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(prepare_error)?;
        }
        match tokio::fs::remove_file(meta_path).await {
            Ok(()) => {
                debug!(path = %meta_path.display(), "removed stale metadata file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(prepare_error(e)),
        }
    }

    fn command(&self, args: &[OsString]) -> Command {
        let mut std_command = std::process::Command::new(&self.config.binary);
        std_command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);
        command
    }

    pub async fn run(
        &self,
        trial: TrialNumber,
        parameters: &ParameterSet,
        cancel: &CancellationToken,
    ) -> EvaluationResult {
        if cancel.is_cancelled() {
            return EvaluationResult::cancelled();
        }

        let args = match self.command_args(trial, parameters) {
            Ok(args) => args,
            Err(e) => return EvaluationResult::process_error(e.to_string()),
        };
        let meta_path = self.config.meta_path(trial);
        if let Err(e) = self.prepare_meta_path(&meta_path).await {
            return EvaluationResult::process_error(e.to_string());
        }

        let mut child = match self.command(&args).spawn() {
            Ok(child) => child,
            Err(source) => {
                let e = EvaluatorError::Launch {
                    binary: self.config.binary.display().to_string(),
                    source,
                };
                return EvaluationResult::process_error(e.to_string());
            }
        };
        let group = ProcessGroup::of(&child);
        debug!(trial, pid = ?child.id(), "launched evaluator");

        let mut stdout = Drain::spawn(child.stdout.take());
        let mut stderr = Drain::spawn(child.stderr.take());

        let timeout = self.config.timeout();
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let timed_out = || {
            let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
            EvaluationResult::process_error(EvaluatorError::TimedOut { secs }.to_string())
        };

        let status: ExitStatus = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child, group, trial).await;
                stdout.finish();
                stderr.finish();
                return EvaluationResult::cancelled();
            }
            _ = expire(deadline) => {
                terminate(&mut child, group, trial).await;
                stdout.finish();
                stderr.finish();
                return timed_out();
            }
            waited = child.wait() => match waited {
                Ok(status) => status,
                Err(e) => {
                    terminate(&mut child, group, trial).await;
                    stdout.finish();
                    stderr.finish();
                    return EvaluationResult::process_error(EvaluatorError::Wait(e).to_string());
                }
            },
        };

        // Whatever the trainer left running in its group goes with it.
        group.kill(trial);

        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stdout.finish();
                stderr.finish();
                return EvaluationResult::cancelled();
            }
            _ = expire(deadline) => {
                stdout.finish();
                stderr.finish();
                return timed_out();
            }
            _ = async { tokio::join!(stdout.closed(), stderr.closed()) } => true,
            _ = tokio::time::sleep(DRAIN_GRACE) => false,
        };
        if !drained {
            warn!(trial, "evaluator output still open after exit; keeping what was read");
        }
        let stdout = stdout.finish();
        let stderr = stderr.finish();

        let exit_code = status.code();
        if !status.success() {
            debug!(trial, ?exit_code, "evaluator exited non-zero");
        }

        let result = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => classify_meta(&bytes),
            Err(source) => {
                let e = EvaluatorError::MetaRead {
                    path: meta_path.display().to_string(),
                    source,
                };
                EvaluationResult::process_error(e.to_string())
            }
        };
        result.with_output(stdout, stderr, exit_code)
    }
}

#[async_trait]
impl Evaluator for ObjectiveRunner {
    fn search_space(&self) -> &SearchSpace {
        &self.search_space
    }

    async fn evaluate(
        &self,
        trial: TrialNumber,
        parameters: &ParameterSet,
        cancel: &CancellationToken,
    ) -> EvaluationResult {
        self.run(trial, parameters, cancel).await
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Reads one output pipe on its own task, keeping everything read so far.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl Drain {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        warn!(error = %e, "failed to read evaluator output stream");
                        break;
                    }
                }
            }
        });
        Self { buf, handle }
    }

    /// Resolves once the pipe reaches EOF.
    async fn closed(&mut self) {
        if let Err(e) = (&mut self.handle).await {
            if !e.is_cancelled() {
                warn!(error = %e, "evaluator output task failed");
            }
        }
    }

    /// Stop reading and return the text captured so far.
    fn finish(&self) -> String {
        self.handle.abort();
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

/// The trainer's process group, which is led by the trainer itself.
#[derive(Debug, Clone, Copy)]
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(child.id())
    }

    #[cfg(unix)]
    fn kill(self, trial: TrialNumber) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.0.and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => debug!(trial, pgid, "killed evaluator process group"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(trial, pgid, error = %e, "failed to kill evaluator process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill(self, _trial: TrialNumber) {}
}

/// Kill the trainer's whole group, then reap the trainer.
async fn terminate(child: &mut Child, group: ProcessGroup, trial: TrialNumber) {
    group.kill(trial);
    match child.kill().await {
        Ok(()) => debug!(trial, "terminated evaluator"),
        Err(e) => warn!(trial, error = %e, "failed to terminate evaluator"),
    }
}
