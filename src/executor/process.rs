use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    task::JoinHandle,
};

use crate::{
    config::ExecutorConfig,
    executor::{
        CodeExecutor, ExecError, ExecutionResult, classify,
        toolchain::{CommandTemplate, PreparedSource, Toolchain, ToolchainKind, ToolchainSet},
    },
    models::Language,
};

/// Runs untrusted source through an external toolchain inside a throwaway
/// workspace directory.
pub struct ProcessExecutor {
    toolchains: ToolchainSet,
    workspace_root: PathBuf,
    compile_timeout: Duration,
    probe_timeout: Duration,
    kill_grace: Duration,
    max_output_bytes: usize,
}

enum PhaseOutcome {
    Exited {
        success: bool,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

impl ProcessExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            toolchains: ToolchainSet::from_config(config),
            workspace_root: config.workspace_root.clone(),
            compile_timeout: config.compile_timeout,
            probe_timeout: config.probe_timeout,
            kill_grace: config.kill_grace,
            max_output_bytes: config.max_output_bytes,
        }
    }

    pub async fn run_toolchain(
        &self,
        toolchain: &Toolchain,
        code: &str,
        timeout_secs: u64,
    ) -> ExecutionResult {
        let started = Instant::now();

        if !self.probe(toolchain).await {
            tracing::warn!(toolchain = %toolchain.name, "toolchain unavailable");
            return Err(ExecError::ToolchainUnavailable(
                toolchain.missing_message.clone(),
            ));
        }

        let workspace = tempfile::Builder::new()
            .prefix(&format!("{}_exec_", toolchain.name))
            .tempdir_in(&self.workspace_root)
            .map_err(|e| ExecError::InternalFault(format!("workspace setup failed: {e}")))?;

        let result = self
            .run_in_workspace(toolchain, workspace.path(), code, timeout_secs)
            .await;

        let path = workspace.path().to_path_buf();
        match tokio::task::spawn_blocking(move || workspace.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(path = %path.display(), error = %err, "workspace cleanup failed")
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "workspace cleanup task failed")
            }
        }

        tracing::info!(
            toolchain = %toolchain.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = result.as_ref().err().map(ExecError::kind).unwrap_or("ok"),
            "execution finished"
        );
        result
    }

    async fn probe(&self, toolchain: &Toolchain) -> bool {
        for probe in &toolchain.probes {
            let mut cmd = Command::new(&probe.program);
            cmd.args(&probe.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let healthy = match tokio::time::timeout(self.probe_timeout, cmd.status()).await {
                Ok(Ok(status)) => status.success(),
                Ok(Err(err)) => {
                    tracing::debug!(program = %probe.program, error = %err, "toolchain probe failed");
                    false
                }
                Err(_) => {
                    tracing::warn!(program = %probe.program, "toolchain probe timed out");
                    false
                }
            };
            if !healthy {
                return false;
            }
        }
        true
    }

    async fn run_in_workspace(
        &self,
        toolchain: &Toolchain,
        dir: &Path,
        code: &str,
        timeout_secs: u64,
    ) -> ExecutionResult {
        let source = toolchain.layout.prepare(code);
        tokio::fs::write(dir.join(&source.file_name), source.contents.as_bytes())
            .await
            .map_err(|e| ExecError::InternalFault(format!("failed to write source: {e}")))?;

        if let ToolchainKind::CompileThenRun { compile } = &toolchain.kind {
            match self
                .run_phase(compile, &source, dir, self.compile_timeout)
                .await?
            {
                PhaseOutcome::TimedOut => {
                    return Err(ExecError::CompilationFailed(format!(
                        "compilation timed out after {} seconds",
                        self.compile_timeout.as_secs()
                    )));
                }
                PhaseOutcome::Exited { success: false, stderr, .. } => {
                    let diagnostic = if stderr.is_empty() {
                        "Compilation failed".to_string()
                    } else {
                        stderr
                    };
                    return Err(ExecError::CompilationFailed(diagnostic));
                }
                PhaseOutcome::Exited { .. } => {}
            }
        }

        match self
            .run_phase(&toolchain.run, &source, dir, Duration::from_secs(timeout_secs))
            .await?
        {
            PhaseOutcome::TimedOut => Err(ExecError::ExecutionTimeout(timeout_secs)),
            PhaseOutcome::Exited { stdout, stderr, .. } => classify(stdout, stderr),
        }
    }

    async fn run_phase(
        &self,
        template: &CommandTemplate,
        source: &PreparedSource,
        dir: &Path,
        limit: Duration,
    ) -> Result<PhaseOutcome, ExecError> {
        let mut cmd = Command::new(&template.program);
        cmd.args(template.render(source))
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            ExecError::InternalFault(format!("failed to spawn {}: {e}", template.program))
        })?;
        let mut guard = ProcessGroupGuard::new(child);

        let stdout = guard
            .child
            .stdout
            .take()
            .ok_or_else(|| ExecError::InternalFault("missing stdout pipe".to_string()))?;
        let stderr = guard
            .child
            .stderr
            .take()
            .ok_or_else(|| ExecError::InternalFault("missing stderr pipe".to_string()))?;
        let cap = self.max_output_bytes;
        let stdout_task = tokio::spawn(async move { read_limited(stdout, cap).await });
        let stderr_task = tokio::spawn(async move { read_limited(stderr, cap).await });

        match tokio::time::timeout(limit, guard.child.wait()).await {
            Ok(Ok(status)) => {
                // The leader is gone; sweep anything it left running in its group.
                guard.finish();
                let stdout = collect_output(stdout_task, self.kill_grace).await;
                let stderr = collect_output(stderr_task, self.kill_grace).await;
                Ok(PhaseOutcome::Exited {
                    success: status.success(),
                    stdout,
                    stderr,
                })
            }
            Ok(Err(err)) => {
                stdout_task.abort();
                stderr_task.abort();
                Err(ExecError::InternalFault(format!(
                    "failed waiting for {}: {err}",
                    template.program
                )))
            }
            Err(_) => {
                tracing::warn!(
                    program = %template.program,
                    limit_secs = limit.as_secs(),
                    "process exceeded time limit, killing process group"
                );
                guard.terminate(self.kill_grace).await;
                stdout_task.abort();
                stderr_task.abort();
                Ok(PhaseOutcome::TimedOut)
            }
        }
    }
}

#[async_trait]
impl CodeExecutor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, code: &str, language: Language, timeout_secs: u64) -> ExecutionResult {
        match self.toolchains.for_language(language) {
            Some(toolchain) => self.run_toolchain(toolchain, code, timeout_secs).await,
            None => Err(ExecError::UnsupportedLanguage(language.to_string())),
        }
    }
}

/// Kills the child's whole process group unless it was reaped and swept.
/// Also covers the execution future being dropped mid-run.
struct ProcessGroupGuard {
    child: Child,
    pgid: Option<i32>,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(child: Child) -> Self {
        let pgid = child.id().map(|id| id as i32);
        Self {
            child,
            pgid,
            armed: true,
        }
    }

    fn kill_group(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: kill(2) with a negative pid only signals that group.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!(pgid, error = %err, "failed to kill process group");
                }
            }
        }
    }

    fn finish(&mut self) {
        self.kill_group();
        self.armed = false;
    }

    async fn terminate(&mut self, grace: Duration) {
        self.kill_group();
        let _ = self.child.start_kill();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => self.armed = false,
            Err(_) => tracing::warn!(pgid = ?self.pgid, "process did not exit after kill"),
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.kill_group();
            let _ = self.child.start_kill();
        }
    }
}

async fn collect_output(task: JoinHandle<Vec<u8>>, grace: Duration) -> String {
    let bytes = match tokio::time::timeout(grace, task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) | Err(_) => Vec::new(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn read_limited<R>(mut reader: R, limit: usize) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < limit {
                    let remaining = limit - out.len();
                    out.extend_from_slice(&chunk[..remaining.min(n)]);
                }
            }
            Err(_) => break,
        }
    }
    out
}
