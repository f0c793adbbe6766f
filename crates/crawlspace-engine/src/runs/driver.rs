//! Container driver: one task per live run.
//!
//! Starts the container with the injected environment, pumps its framed
//! output into the log pipeline, races execution against the run's deadline,
//! and reports the terminal status. Aborts are discovered by observing the
//! run row; the abort endpoint mutates the row directly and the driver stops
//! the container on its next status check.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::logs::{LogEntry, LogLevel, LogPipeline};
use crate::model::{Run, RunStatus};
use crate::runs::RunService;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, FrameDecoder, LogChannel, TIMEOUT_EXIT_CODE,
};

/// How often the driver re-reads the run row while the container lives.
const STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a driver task needs.
#[derive(Clone)]
pub(crate) struct DriverDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub logs: LogPipeline,
    pub runs: RunService,
    pub stop_grace: Duration,
}

/// Per-channel partial-line assembly state.
#[derive(Default)]
struct LineAssembler {
    stdout: String,
    stderr: String,
}

impl LineAssembler {
    fn buffer_mut(&mut self, channel: LogChannel) -> &mut String {
        match channel {
            LogChannel::Stdout => &mut self.stdout,
            LogChannel::Stderr => &mut self.stderr,
        }
    }

    /// Feeds a frame payload, returning the complete lines it closed.
    fn feed(&mut self, channel: LogChannel, payload: &[u8]) -> Vec<String> {
        let buffer = self.buffer_mut(channel);
        buffer.push_str(&String::from_utf8_lossy(payload));
        let mut lines = Vec::new();
        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Returns any unterminated trailing lines at stream end.
    fn flush(self) -> Vec<(LogChannel, String)> {
        let mut rest = Vec::new();
        if !self.stdout.is_empty() {
            rest.push((LogChannel::Stdout, self.stdout));
        }
        if !self.stderr.is_empty() {
            rest.push((LogChannel::Stderr, self.stderr));
        }
        rest
    }
}

fn fallback_level(channel: LogChannel) -> LogLevel {
    match channel {
        LogChannel::Stdout => LogLevel::Info,
        LogChannel::Stderr => LogLevel::Error,
    }
}

/// Drives one run to completion. The caller owns the active-run accounting.
pub(crate) async fn drive_run(deps: DriverDeps, run: Run) {
    let run_id = run.id.clone();
    debug!(run_id = %run_id, image = %run.image, "driver starting container");

    let token = match deps.runs.run_token(&run).await {
        Ok(token) => token,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "failed to issue run token");
            fail(&deps, &run, format!("run token unavailable: {e}")).await;
            return;
        }
    };

    let spec = ContainerSpec {
        image: run.image.clone(),
        env: deps.runs.env_for_run(&run, &token),
        memory_mbytes: run.memory_mbytes,
    };
    let exec = match deps.runtime.start(spec).await {
        Ok(exec) => exec,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "container start failed");
            fail(&deps, &run, format!("container start failed: {e}")).await;
            return;
        }
    };

    let container_id = exec.container_id;
    let mut output = exec.output;
    let mut exit = exec.exit;

    let started_at = run.started_at.unwrap_or_else(chrono::Utc::now);
    let deadline_utc = started_at
        + chrono::Duration::seconds(i64::try_from(run.timeout_secs).unwrap_or(i64::MAX));
    let remaining = (deadline_utc - chrono::Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let deadline = tokio::time::sleep(remaining);
    tokio::pin!(deadline);

    let mut status_tick = tokio::time::interval(STATUS_CHECK_INTERVAL);
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut decoder = FrameDecoder::new();
    let mut assembler = LineAssembler::default();
    let mut last_error_line: Option<String> = None;
    let mut buf = vec![0u8; 8192];
    let mut output_done = false;
    let mut timed_out = false;
    let mut aborted = false;

    let observed_exit = loop {
        tokio::select! {
            read = output.read(&mut buf), if !output_done => {
                match read {
                    Ok(0) | Err(_) => output_done = true,
                    Ok(n) => {
                        decoder.extend(&buf[..n]);
                        while let Some(frame) = decoder.next_frame() {
                            for line in assembler.feed(frame.channel, &frame.payload) {
                                append_line(&deps, &run, frame.channel, &line, &mut last_error_line)
                                    .await;
                            }
                        }
                    }
                }
            }
            code = &mut exit => {
                break code.ok();
            }
            () = &mut deadline, if !timed_out && !aborted => {
                info!(run_id = %run_id, "run deadline reached; stopping container");
                timed_out = true;
                if let Err(e) = deps.runtime.stop(&container_id, deps.stop_grace).await {
                    warn!(run_id = %run_id, error = %e, "stop after timeout failed");
                }
            }
            _ = status_tick.tick(), if !timed_out && !aborted => {
                match deps.runs.get(&run_id).await {
                    Ok(current) if current.status == RunStatus::Aborted => {
                        info!(run_id = %run_id, "abort observed; stopping container");
                        aborted = true;
                        if let Err(e) = deps.runtime.stop(&container_id, deps.stop_grace).await {
                            warn!(run_id = %run_id, error = %e, "stop after abort failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(run_id = %run_id, error = %e, "status check failed"),
                }
            }
        }
    };

    for (channel, line) in assembler.flush() {
        append_line(&deps, &run, channel, &line, &mut last_error_line).await;
    }

    if aborted {
        // The abort endpoint already finalized the row.
        debug!(run_id = %run_id, "driver exiting after abort");
        return;
    }

    let (status, exit_code, message) = if timed_out {
        (RunStatus::TimedOut, TIMEOUT_EXIT_CODE, None)
    } else {
        match observed_exit {
            Some(0) => (RunStatus::Succeeded, 0, None),
            Some(TIMEOUT_EXIT_CODE) => (RunStatus::TimedOut, TIMEOUT_EXIT_CODE, None),
            Some(code) => (RunStatus::Failed, code, last_error_line.clone()),
            None => (
                RunStatus::Failed,
                -1,
                Some("container lost by runtime".to_string()),
            ),
        }
    };

    match deps
        .runs
        .update_status(&run_id, status, message, Some(exit_code))
        .await
    {
        Ok(run) => info!(run_id = %run_id, status = %run.status, exit_code, "run finished"),
        // An abort can race the container's own exit; the row wins.
        Err(EngineError::InvalidTransition { from, .. }) => {
            debug!(run_id = %run_id, from = %from, "final transition lost to concurrent update");
        }
        Err(e) => warn!(run_id = %run_id, error = %e, "failed to record run outcome"),
    }
}

async fn append_line(
    deps: &DriverDeps,
    run: &Run,
    channel: LogChannel,
    line: &str,
    last_error_line: &mut Option<String>,
) {
    let level = LogLevel::classify(line, fallback_level(channel));
    if channel == LogChannel::Stderr || level >= LogLevel::Warn {
        *last_error_line = Some(line.to_string());
    }
    if let Err(e) = deps.logs.append(&run.id, LogEntry::now(level, line)).await {
        debug!(run_id = %run.id, error = %e, "log append failed");
    }
}

async fn fail(deps: &DriverDeps, run: &Run, message: String) {
    if let Err(e) = deps
        .runs
        .update_status(&run.id, RunStatus::Failed, Some(message), None)
        .await
    {
        warn!(run_id = %run.id, error = %e, "failed to mark run failed");
    }
}
