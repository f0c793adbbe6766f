//! Process-backed container runtime.
//!
//! Executes the image reference as a local command line. This is the
//! single-node stand-in for a real container daemon: no image pulling and no
//! memory enforcement, but the full output-framing and stop contract.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{
    encode_frame, ContainerExecution, ContainerRuntime, ContainerSpec, LogChannel, Result,
    RuntimeError,
};

/// Interval at which [`ProcessRuntime::stop`] re-checks a signalled child.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runtime that runs each container spec as a local child process.
#[derive(Clone, Default)]
pub struct ProcessRuntime {
    live: Arc<Mutex<HashMap<String, u32>>>,
}

impl ProcessRuntime {
    /// Creates a new process runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pid_of(&self, container_id: &str) -> Option<u32> {
        self.live.lock().ok()?.get(container_id).copied()
    }

    fn forget(live: &Arc<Mutex<HashMap<String, u32>>>, container_id: &str) {
        if let Ok(mut map) = live.lock() {
            map.remove(container_id);
        }
    }
}

impl std::fmt::Debug for ProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRuntime").finish_non_exhaustive()
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    status
        .code()
        .map_or_else(|| 128 + i64::from(status.signal().unwrap_or(0)), i64::from)
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, spec: ContainerSpec) -> Result<ContainerExecution> {
        let mut parts = spec.image.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| RuntimeError::StartFailed("empty image reference".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::StartFailed(format!("{program}: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| RuntimeError::StartFailed("child exited before spawn returned".into()))?;
        let container_id = format!("proc-{pid}");

        if let Ok(mut map) = self.live.lock() {
            map.insert(container_id.clone(), pid);
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::StartFailed("stdout pipe missing".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RuntimeError::StartFailed("stderr pipe missing".to_string())
        })?;

        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let live = Arc::clone(&self.live);
        let id_for_task = container_id.clone();

        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_open = true;
            let mut err_open = true;

            while out_open || err_open {
                let frame = tokio::select! {
                    line = out_lines.next_line(), if out_open => match line {
                        Ok(Some(line)) => Some((LogChannel::Stdout, line)),
                        _ => {
                            out_open = false;
                            None
                        }
                    },
                    line = err_lines.next_line(), if err_open => match line {
                        Ok(Some(line)) => Some((LogChannel::Stderr, line)),
                        _ => {
                            err_open = false;
                            None
                        }
                    },
                };
                if let Some((channel, mut line)) = frame {
                    line.push('\n');
                    if writer
                        .write_all(&encode_frame(channel, line.as_bytes()))
                        .await
                        .is_err()
                    {
                        // Reader side went away (driver finished); keep
                        // draining so the child does not block on a full pipe.
                        break;
                    }
                }
            }
            drop(writer);

            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(error = %e, "failed to reap child process");
                    -1
                }
            };
            Self::forget(&live, &id_for_task);
            debug!(container = %id_for_task, code, "process exited");
            let _ = exit_tx.send(code);
        });

        Ok(ContainerExecution {
            container_id,
            output: Box::pin(reader),
            exit: exit_rx,
        })
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        let Some(pid) = self.pid_of(container_id) else {
            return Ok(());
        };
        let pid = Pid::from_raw(pid as i32);

        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            debug!(container = container_id, error = %e, "SIGTERM failed; process likely gone");
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.pid_of(container_id).is_none() {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        if self.pid_of(container_id).is_some() {
            warn!(container = container_id, "grace window lapsed; sending SIGKILL");
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut output: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>) -> Vec<u8> {
        let mut buf = Vec::new();
        let _ = output.read_to_end(&mut buf).await;
        buf
    }

    #[tokio::test]
    async fn runs_a_process_and_reports_exit_zero() {
        let runtime = ProcessRuntime::new();
        let exec = runtime
            .start(ContainerSpec {
                image: "echo hello".to_string(),
                env: vec![],
                memory_mbytes: 256,
            })
            .await
            .unwrap();

        let output = read_all(exec.output).await;
        let mut decoder = super::super::FrameDecoder::new();
        decoder.extend(&output);
        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.channel, LogChannel::Stdout);
        assert_eq!(&frame.payload[..], b"hello\n");

        assert_eq!(exec.exit.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let runtime = ProcessRuntime::new();
        let exec = runtime
            .start(ContainerSpec {
                image: "false".to_string(),
                env: vec![],
                memory_mbytes: 256,
            })
            .await
            .unwrap();
        let _ = read_all(exec.output).await;
        assert_eq!(exec.exit.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_process() {
        let runtime = ProcessRuntime::new();
        let exec = runtime
            .start(ContainerSpec {
                image: "sleep 30".to_string(),
                env: vec![],
                memory_mbytes: 256,
            })
            .await
            .unwrap();

        let id = exec.container_id.clone();
        runtime.stop(&id, Duration::from_secs(5)).await.unwrap();
        let code = exec.exit.await.unwrap();
        assert_eq!(code, 128 + 15);
    }

    #[tokio::test]
    async fn start_fails_for_missing_program() {
        let runtime = ProcessRuntime::new();
        let err = runtime
            .start(ContainerSpec {
                image: "definitely-not-a-real-binary-xyz".to_string(),
                env: vec![],
                memory_mbytes: 256,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed(_)));
    }
}
