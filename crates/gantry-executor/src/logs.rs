//! Per-container log streaming.
//!
//! One streamer task per container: it owns the tail exclusively, buffers
//! newline-terminated lines, and uploads the cumulative log record when
//! the buffer passes the flush threshold and again at EOF. Its lifetime is
//! coupled to the container's tail, not to the step's wait; the build
//! token ends tails that outlive their step.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use gantry_client::ControlPlane;
use gantry_core::{Container, LogRecord, Result};
use gantry_runtime::LogTail;

use crate::Engine;

/// Bytes buffered locally before a flush to the control plane.
pub const FLUSH_THRESHOLD: usize = 1000;

/// Which log endpoint a streamer reports to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LogTarget {
    Step(i64),
    Service(i64),
}

async fn upload(client: &dyn ControlPlane, target: LogTarget, data: &[u8]) -> Result<()> {
    match target {
        LogTarget::Step(number) => client.update_step_log(number, data).await,
        LogTarget::Service(number) => client.update_service_log(number, data).await,
    }
}

/// Pump one container's tail into its log record.
///
/// Mid-stream upload failures are logged and reading continues; the bytes
/// stay in the cumulative record and ride along with the next flush, so
/// delivery is at-least-once. A failing final flush is returned to the
/// caller as a non-fatal error.
pub(crate) async fn stream(
    client: Arc<dyn ControlPlane>,
    tail: LogTail,
    mut record: LogRecord,
    target: LogTarget,
) -> Result<()> {
    let mut reader = StreamReader::new(tail);
    let mut buffer: Vec<u8> = Vec::new();
    let mut line: Vec<u8> = Vec::new();
    let mut dirty = false;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                buffer.extend_from_slice(&line);
                if buffer.len() > FLUSH_THRESHOLD {
                    record.append(&buffer);
                    buffer.clear();
                    match upload(client.as_ref(), target, &record.data).await {
                        Ok(()) => dirty = false,
                        Err(err) => {
                            dirty = true;
                            warn!(error = %err, "log upload failed, continuing to read");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "log tail read failed");
                break;
            }
        }
    }

    if !buffer.is_empty() {
        record.append(&buffer);
        dirty = true;
    }
    if dirty {
        upload(client.as_ref(), target, &record.data).await?;
    }

    debug!(bytes = record.data.len(), "log stream closed");
    Ok(())
}

impl Engine {
    /// Open the container's tail and hand it to a dedicated streamer task.
    pub(crate) async fn spawn_streamer(
        &self,
        container: &Container,
        target: LogTarget,
    ) -> Result<()> {
        let tail = self
            .runtime
            .tail_container(container, self.token.child_token())
            .await?;

        let record = {
            let mut state = self.lock_state();
            state
                .logs
                .remove(&container.id)
                .unwrap_or_else(|| LogRecord {
                    number: container.number,
                    ..Default::default()
                })
        };

        let client = self.client.clone();
        let id = container.id.clone();
        self.lock_streamers()
            .spawn(async move { (id, stream(client, tail, record, target).await) });
        Ok(())
    }

    /// Drain every streamer, logging per-container failures. Final-flush
    /// errors are non-fatal: the containers were already accounted for.
    pub(crate) async fn join_streamers(&self) {
        let mut streamers = std::mem::take(&mut *self.lock_streamers());
        while let Some(joined) = streamers.join_next().await {
            match joined {
                Ok((id, Ok(()))) => debug!(container = %id, "log streamer finished"),
                Ok((id, Err(err))) => {
                    warn!(container = %id, error = %err, "log streamer ended with error");
                }
                Err(err) => warn!(error = %err, "log streamer panicked"),
            }
        }
    }
}
