use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::events::{EventBus, EventKind, TranscodeEvent};

/// A writable destination for the subprocess's media channel.
pub type SinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Duplicating junction between the subprocess's single media channel and
/// the registered sinks. One sink closing early never aborts delivery to the
/// rest; once every sink is gone the junction keeps draining so the
/// subprocess never blocks on a full pipe.
pub struct Fanout {
    branches: Vec<Branch>,
    events: Arc<EventBus>,
}

struct Branch {
    index: usize,
    writer: SinkWriter,
}

impl Fanout {
    pub fn new(writers: Vec<SinkWriter>, events: Arc<EventBus>) -> Self {
        let branches = writers
            .into_iter()
            .enumerate()
            .map(|(index, writer)| Branch { index, writer })
            .collect();
        Self { branches, events }
    }

    /// Copy the channel into every branch until EOF.
    pub async fn pump<R>(mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        if self.branches.is_empty() {
            debug!("no sinks registered, discarding the media channel");
        }

        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("media channel read ended: {}", e);
                    break;
                }
            };

            let mut alive = Vec::with_capacity(self.branches.len());
            for mut branch in self.branches.drain(..) {
                match branch.writer.write_all(&buf[..n]).await {
                    Ok(()) => alive.push(branch),
                    Err(e) => report_branch_failure(&self.events, branch.index, &e),
                }
            }
            self.branches = alive;
        }

        for branch in &mut self.branches {
            if let Err(e) = branch.writer.shutdown().await {
                debug!("sink {} did not shut down cleanly: {}", branch.index, e);
            }
        }
    }
}

/// Expected teardown noise when a sink goes away mid-run.
fn is_cleanup_noise(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::WriteZero
    )
}

fn report_branch_failure(events: &EventBus, index: usize, error: &std::io::Error) {
    if is_cleanup_noise(error) {
        debug!("sink {} closed early: {}", index, error);
        return;
    }
    warn!("sink {} failed: {}", index, error);
    if events.has_listeners(EventKind::Error) {
        events.emit(&TranscodeEvent::Error {
            message: format!("output sink {} failed: {}", index, error),
        });
    }
}
