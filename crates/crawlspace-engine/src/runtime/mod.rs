//! Container runtime contract.
//!
//! The orchestrator consumes this seam; a Docker daemon is one production
//! implementation. The bundled [`ProcessRuntime`] executes runs as local
//! processes and the [`MockRuntime`] scripts executions for tests.
//!
//! # Output framing
//!
//! A running container exposes one multiplexed byte stream. Each frame is an
//! 8-byte header followed by the payload:
//!
//! ```text
//! [channel: u8] [0 0 0] [payload length: u32 big-endian] [payload...]
//! ```
//!
//! Channel 1 is stdout, channel 2 is stderr. The container driver decodes
//! frames into lines and feeds them to the log pipeline.

pub mod mock;
pub mod process;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

pub use mock::MockRuntime;
pub use process::ProcessRuntime;

/// Exit code reported for runs stopped at their deadline.
pub const TIMEOUT_EXIT_CODE: i64 = 143;

/// Errors from container runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The container could not be started.
    #[error("container start failed: {0}")]
    StartFailed(String),

    /// The referenced container is not known to the runtime.
    #[error("unknown container: {0}")]
    UnknownContainer(String),

    /// The runtime daemon is unreachable.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// I/O failure talking to the container.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Which output stream a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChannel {
    /// Container stdout.
    Stdout,
    /// Container stderr.
    Stderr,
}

impl LogChannel {
    const fn byte(self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One decoded output frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Originating stream.
    pub channel: LogChannel,
    /// Frame payload.
    pub payload: Bytes,
}

/// Encodes a frame for the multiplexed output stream.
#[must_use]
pub fn encode_frame(channel: LogChannel, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.extend_from_slice(&[channel.byte(), 0, 0, 0]);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Incremental decoder for the multiplexed output stream.
///
/// Feed raw bytes with [`FrameDecoder::extend`], then drain complete frames
/// with [`FrameDecoder::next_frame`]. Bytes with an unknown channel byte are
/// treated as stdout noise and skipped one byte at a time, so a corrupt
/// stream degrades instead of wedging the reader.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the container stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if self.buf.len() < 8 {
                return None;
            }
            let Some(channel) = LogChannel::from_byte(self.buf[0]) else {
                self.buf.advance(1);
                continue;
            };
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < 8 + len {
                return None;
            }
            self.buf.advance(8);
            let payload = self.buf.split_to(len).freeze();
            return Some(Frame { channel, payload });
        }
    }
}

/// Everything needed to start one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference (interpreted by the runtime implementation).
    pub image: String,
    /// Environment block injected into the container.
    pub env: Vec<(String, String)>,
    /// Memory cap in megabytes.
    pub memory_mbytes: u32,
}

/// A started container: its id, output stream, and exit notification.
pub struct ContainerExecution {
    /// Runtime-scoped container identifier, used for [`ContainerRuntime::stop`].
    pub container_id: String,
    /// Multiplexed output stream (see module docs for framing).
    pub output: Pin<Box<dyn AsyncRead + Send>>,
    /// Resolves with the container's exit code. A dropped sender means the
    /// runtime lost the container; callers treat that as a failure.
    pub exit: oneshot::Receiver<i64>,
}

impl std::fmt::Debug for ContainerExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerExecution")
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}

/// Container runtime contract consumed by the orchestrator.
///
/// Runtimes are pure execution engines; they never touch the metadata store.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Verifies the runtime is reachable; used by readiness checks.
    async fn ping(&self) -> Result<()>;

    /// Starts a container and returns its output stream and exit handle.
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerExecution>;

    /// Stops a container: graceful signal, then forced termination once the
    /// grace window lapses. Idempotent for unknown or finished containers.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let encoded = encode_frame(LogChannel::Stderr, b"boom");
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encoded);

        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.channel, LogChannel::Stderr);
        assert_eq!(frame.payload, Bytes::from_static(b"boom"));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn decoder_handles_split_delivery() {
        let encoded = encode_frame(LogChannel::Stdout, b"hello world");
        let mut decoder = FrameDecoder::new();

        decoder.extend(&encoded[..5]);
        assert!(decoder.next_frame().is_none());
        decoder.extend(&encoded[5..]);

        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"hello world"));
    }

    #[test]
    fn decoder_skips_garbage_bytes() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xff, 0xfe]);
        decoder.extend(&encode_frame(LogChannel::Stdout, b"ok"));

        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"ok"));
    }

    #[test]
    fn decoder_yields_frames_in_order() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(LogChannel::Stdout, b"one"));
        decoder.extend(&encode_frame(LogChannel::Stderr, b"two"));

        assert_eq!(decoder.next_frame().unwrap().payload, Bytes::from_static(b"one"));
        let second = decoder.next_frame().unwrap();
        assert_eq!(second.channel, LogChannel::Stderr);
        assert_eq!(second.payload, Bytes::from_static(b"two"));
    }
}
