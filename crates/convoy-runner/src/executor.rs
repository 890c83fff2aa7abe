//! Job execution supervisor
//!
//! Runs one job's bootstrap script as a supervised child process:
//! environment merged from job + identity + config, output streamed
//! incrementally over the log channel, cancellation honored with a
//! SIGTERM-then-grace-then-SIGKILL sequence. A crashed or killed child is
//! always reported as a failure, never silently as success.

use crate::env::build_environment;
use crate::stream::{self, OutputChunk, StreamSource};
use convoy_core::{AgentConfig, AgentError, AgentIdentity, ExitStatus, Job, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;

/// Runs a single claimed job to completion
pub struct JobExecutor<'a> {
    config: &'a AgentConfig,
    identity: &'a AgentIdentity,
    grace_period: Duration,
}

impl<'a> JobExecutor<'a> {
    pub fn new(config: &'a AgentConfig, identity: &'a AgentIdentity) -> Self {
        Self {
            config,
            identity,
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
        }
    }

    /// Time between SIGTERM and SIGKILL on cancellation.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Run the job's bootstrap script, streaming output to `log_tx` until
    /// the child exits or `cancel` fires.
    pub async fn run(
        &self,
        job: &Job,
        mut cancel: watch::Receiver<bool>,
        log_tx: mpsc::Sender<OutputChunk>,
    ) -> Result<ExitStatus> {
        tokio::fs::create_dir_all(&self.config.build_path).await?;
        let env = build_environment(job, self.identity, self.config);

        tracing::info!(
            "Running job {} (build {}) via {}",
            job.id,
            job.build_id,
            self.config.bootstrap_script.display()
        );

        let mut cmd = Command::new(&self.config.bootstrap_script);
        cmd.envs(&env)
            .current_dir(&self.config.build_path)
            .kill_on_drop(true);

        // PTY is a capability, not a requirement: fall back to pipes when
        // one cannot be allocated.
        let mut pty_master: Option<std::fs::File> = None;
        if self.config.run_in_pty {
            #[cfg(unix)]
            match attach_pty(&mut cmd) {
                Ok(master) => pty_master = Some(master),
                Err(e) => tracing::warn!("PTY unavailable, falling back to pipes: {}", e),
            }
        }
        if pty_master.is_none() {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::Process(format!(
                "failed to spawn bootstrap {}: {}",
                self.config.bootstrap_script.display(),
                e
            ))
        })?;

        match pty_master {
            #[cfg(unix)]
            Some(master) => {
                stream::spawn_pty_reader(master, log_tx);
            }
            _ => {
                if let Some(stdout) = child.stdout.take() {
                    stream::spawn_piped_reader(stdout, StreamSource::Stdout, log_tx.clone());
                }
                if let Some(stderr) = child.stderr.take() {
                    stream::spawn_piped_reader(stderr, StreamSource::Stderr, log_tx);
                }
            }
        }

        let mut cancel_open = true;
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status
                        .map_err(|e| AgentError::Process(format!("wait on bootstrap failed: {}", e)))?;
                    let exit = map_exit(status);
                    tracing::info!("Job {} finished: {}", job.id, exit);
                    return Ok(exit);
                }
                changed = cancel.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            return self.terminate(job, &mut child).await;
                        }
                        Ok(()) => {}
                        // sender gone; keep waiting on the child alone
                        Err(_) => cancel_open = false,
                    }
                }
            }
        }
    }

    /// Graceful shutdown: SIGTERM, bounded grace period, then SIGKILL.
    async fn terminate(&self, job: &Job, child: &mut Child) -> Result<ExitStatus> {
        tracing::info!(
            "Canceling job {}: sending SIGTERM, {}s grace",
            job.id,
            self.grace_period.as_secs()
        );

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        tokio::select! {
            _ = child.wait() => {}
            _ = tokio::time::sleep(self.grace_period) => {
                tracing::warn!("Job {} ignored SIGTERM, killing", job.id);
                let _ = child.kill().await;
            }
        }

        Ok(ExitStatus::Canceled)
    }
}

#[cfg(unix)]
fn attach_pty(cmd: &mut Command) -> Result<std::fs::File> {
    let pty = nix::pty::openpty(None, None)
        .map_err(|e| AgentError::Process(format!("openpty failed: {}", e)))?;

    cmd.stdin(Stdio::from(pty.slave.try_clone()?));
    cmd.stdout(Stdio::from(pty.slave.try_clone()?));
    cmd.stderr(Stdio::from(pty.slave));

    Ok(std::fs::File::from(pty.master))
}

fn map_exit(status: std::process::ExitStatus) -> ExitStatus {
    match status.code() {
        Some(0) => ExitStatus::Success,
        Some(code) => ExitStatus::Failure(code),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                tracing::warn!("Bootstrap died to signal {:?}", status.signal());
            }
            ExitStatus::SignalTerminated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            id: "agent-1".to_string(),
            name: "builder".to_string(),
            access_token: "access-tok".to_string(),
            priority: None,
            meta_data: vec![],
        }
    }

    fn job() -> Job {
        Job {
            id: "job-1".to_string(),
            build_id: "b-1".to_string(),
            step: None,
            env: Default::default(),
            state: Default::default(),
            exit_status: None,
        }
    }

    fn write_script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("bootstrap.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn config_for(dir: &TempDir, script: &Path) -> AgentConfig {
        AgentConfig::new("tok", "builder", script, dir.path().join("builds")).with_pty(false)
    }

    async fn collect(mut rx: mpsc::Receiver<OutputChunk>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend(chunk.bytes);
        }
        out
    }

    #[tokio::test]
    async fn test_successful_script() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "echo hello from the build");
        let config = config_for(&dir, &script);
        let identity = identity();
        let executor = JobExecutor::new(&config, &identity);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (log_tx, log_rx) = mpsc::channel(64);

        let status = executor.run(&job(), cancel_rx, log_tx).await.unwrap();
        assert_eq!(status, ExitStatus::Success);

        let output = collect(log_rx).await;
        assert!(String::from_utf8_lossy(&output).contains("hello from the build"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "exit 7");
        let config = config_for(&dir, &script);
        let identity = identity();
        let executor = JobExecutor::new(&config, &identity);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (log_tx, _log_rx) = mpsc::channel(64);

        let status = executor.run(&job(), cancel_rx, log_tx).await.unwrap();
        assert_eq!(status, ExitStatus::Failure(7));
    }

    #[tokio::test]
    async fn test_missing_bootstrap_is_process_error() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig::new("tok", "builder", "/no/such/script", dir.path()).with_pty(false);
        let identity = identity();
        let executor = JobExecutor::new(&config, &identity);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (log_tx, _log_rx) = mpsc::channel(64);

        let err = executor.run(&job(), cancel_rx, log_tx).await.unwrap_err();
        assert!(matches!(err, AgentError::Process(_)));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_child() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sleep 30");
        let config = config_for(&dir, &script);
        let identity = identity();
        let executor = JobExecutor::new(&config, &identity)
            .with_grace_period(Duration::from_secs(2));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (log_tx, _log_rx) = mpsc::channel(64);

        let job = job();
        let run = executor.run(&job, cancel_rx, log_tx);
        tokio::pin!(run);

        // let the child start, then cancel
        tokio::select! {
            _ = &mut run => panic!("job finished before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(300)) => {}
        }
        cancel_tx.send(true).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancellation should finish within the grace period")
            .unwrap();
        assert_eq!(status, ExitStatus::Canceled);
    }

    #[tokio::test]
    async fn test_job_env_reaches_script() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "echo \"job=$CONVOY_JOB_ID build=$CONVOY_BUILD_ID\"");
        let config = config_for(&dir, &script);
        let identity = identity();
        let executor = JobExecutor::new(&config, &identity);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (log_tx, log_rx) = mpsc::channel(64);

        executor.run(&job(), cancel_rx, log_tx).await.unwrap();
        let output = String::from_utf8_lossy(&collect(log_rx).await).to_string();
        assert!(output.contains("job=job-1 build=b-1"));
    }
}
