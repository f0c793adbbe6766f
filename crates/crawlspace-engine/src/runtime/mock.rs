//! Scripted container runtime for tests.
//!
//! Simulates container execution without spawning processes. Behaviors cover
//! the orchestrator's interesting paths: clean exits, failures, runs that
//! never finish on their own (for timeout and abort tests), and start
//! failures.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use super::{
    encode_frame, ContainerExecution, ContainerRuntime, ContainerSpec, LogChannel, Result,
    RuntimeError, TIMEOUT_EXIT_CODE,
};

/// Scripted behavior for every container started by a [`MockRuntime`].
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Frames emitted after start, in order.
    pub frames: Vec<(LogChannel, String)>,
    /// Pause between frames.
    pub frame_interval: Duration,
    /// When true, the frame script loops until the container is stopped.
    pub repeat: bool,
    /// Exit code reported when the script completes on its own.
    pub exit_code: i64,
    /// When true, `start` fails outright.
    pub fail_to_start: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            frames: vec![(LogChannel::Stdout, "hello from actor\n".to_string())],
            frame_interval: Duration::from_millis(1),
            repeat: false,
            exit_code: 0,
            fail_to_start: false,
        }
    }
}

/// Mock [`ContainerRuntime`] implementation.
#[derive(Clone)]
pub struct MockRuntime {
    behavior: MockBehavior,
    stops: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    started: Arc<AtomicUsize>,
}

impl MockRuntime {
    /// Creates a runtime whose containers emit one line and exit 0.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    /// Creates a runtime whose containers exit with `code`.
    #[must_use]
    pub fn failing(code: i64) -> Self {
        Self::with_behavior(MockBehavior {
            frames: vec![(LogChannel::Stderr, "ERROR something broke\n".to_string())],
            exit_code: code,
            ..MockBehavior::default()
        })
    }

    /// Creates a runtime whose containers log forever until stopped.
    #[must_use]
    pub fn never_completing() -> Self {
        Self::with_behavior(MockBehavior {
            frames: vec![(LogChannel::Stdout, "hi\n".to_string())],
            frame_interval: Duration::from_millis(100),
            repeat: true,
            ..MockBehavior::default()
        })
    }

    /// Creates a runtime with an explicit behavior script.
    #[must_use]
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            stops: Arc::new(Mutex::new(HashMap::new())),
            started: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of containers started so far.
    #[must_use]
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRuntime")
            .field("behavior", &self.behavior)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _spec: ContainerSpec) -> Result<ContainerExecution> {
        if self.behavior.fail_to_start {
            return Err(RuntimeError::StartFailed("scripted start failure".into()));
        }

        let seq = self.started.fetch_add(1, Ordering::SeqCst);
        let container_id = format!("mock-{seq}");
        let stopped = Arc::new(AtomicBool::new(false));
        if let Ok(mut stops) = self.stops.lock() {
            stops.insert(container_id.clone(), Arc::clone(&stopped));
        }

        let behavior = self.behavior.clone();
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let stops = Arc::clone(&self.stops);
        let id_for_task = container_id.clone();

        tokio::spawn(async move {
            let code = 'script: loop {
                for (channel, line) in &behavior.frames {
                    if stopped.load(Ordering::SeqCst) {
                        break 'script TIMEOUT_EXIT_CODE;
                    }
                    let _ = writer
                        .write_all(&encode_frame(*channel, line.as_bytes()))
                        .await;
                    if !behavior.frame_interval.is_zero() {
                        tokio::time::sleep(behavior.frame_interval).await;
                    }
                }
                if !behavior.repeat {
                    break behavior.exit_code;
                }
                if stopped.load(Ordering::SeqCst) {
                    break TIMEOUT_EXIT_CODE;
                }
            };
            drop(writer);
            if let Ok(mut stops) = stops.lock() {
                stops.remove(&id_for_task);
            }
            let _ = exit_tx.send(code);
        });

        Ok(ContainerExecution {
            container_id,
            output: Box::pin(reader),
            exit: exit_rx,
        })
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<()> {
        if let Ok(stops) = self.stops.lock() {
            if let Some(flag) = stops.get(container_id) {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FrameDecoder;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn succeeding_mock_emits_script_and_exits_zero() {
        let runtime = MockRuntime::succeeding();
        let exec = runtime
            .start(ContainerSpec {
                image: "mock".into(),
                env: vec![],
                memory_mbytes: 128,
            })
            .await
            .unwrap();

        let mut output = exec.output;
        let mut buf = Vec::new();
        let _ = output.read_to_end(&mut buf).await;
        let mut decoder = FrameDecoder::new();
        decoder.extend(&buf);
        let frame = decoder.next_frame().unwrap();
        assert_eq!(&frame.payload[..], b"hello from actor\n");

        assert_eq!(exec.exit.await.unwrap(), 0);
        assert_eq!(runtime.started_count(), 1);
    }

    #[tokio::test]
    async fn never_completing_mock_stops_with_timeout_code() {
        let runtime = MockRuntime::never_completing();
        let exec = runtime
            .start(ContainerSpec {
                image: "mock".into(),
                env: vec![],
                memory_mbytes: 128,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        runtime
            .stop(&exec.container_id, Duration::from_secs(1))
            .await
            .unwrap();

        let mut output = exec.output;
        let mut buf = Vec::new();
        let _ = output.read_to_end(&mut buf).await;
        assert!(!buf.is_empty());

        assert_eq!(exec.exit.await.unwrap(), TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn failing_start_surfaces_error() {
        let runtime = MockRuntime::with_behavior(MockBehavior {
            fail_to_start: true,
            ..MockBehavior::default()
        });
        let err = runtime
            .start(ContainerSpec {
                image: "mock".into(),
                env: vec![],
                memory_mbytes: 128,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed(_)));
    }
}
