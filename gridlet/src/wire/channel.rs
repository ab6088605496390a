//! Named-pipe channel binding one worker slot to the master.
//!
//! Each slot owns exactly one pair of unidirectional FIFOs (one per
//! direction). The channel owns the filesystem entries: it creates them on
//! open and unlinks them on close. Paths embed the slot index, so
//! concurrently running slots never cross-talk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::net::unix::pipe;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{WireError, WorkerCodec};
use super::protocol::{InboundMessage, OutboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeEndpoint {
    pub path: PathBuf,
    pub direction: Direction,
}

/// The two endpoints owned exclusively by one worker slot.
///
/// Path format: `{dir}/slot-{n}.in` / `{dir}/slot-{n}.out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePair {
    pub inbound: PipeEndpoint,
    pub outbound: PipeEndpoint,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to create pipe {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open pipe {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PipePair {
    pub fn in_dir(dir: &Path, slot_id: usize) -> Self {
        Self {
            inbound: PipeEndpoint {
                path: dir.join(format!("slot-{slot_id}.in")),
                direction: Direction::In,
            },
            outbound: PipeEndpoint {
                path: dir.join(format!("slot-{slot_id}.out")),
                direction: Direction::Out,
            },
        }
    }

    /// The supervisor's dedicated control pipe pair, next to the slot pairs.
    pub fn control(dir: &Path) -> Self {
        Self {
            inbound: PipeEndpoint {
                path: dir.join("control.in"),
                direction: Direction::In,
            },
            outbound: PipeEndpoint {
                path: dir.join("control.out"),
                direction: Direction::Out,
            },
        }
    }

    /// Create both FIFOs, replacing stale entries from a previous run.
    pub fn create(&self) -> Result<(), ChannelError> {
        for endpoint in [&self.inbound, &self.outbound] {
            let path = &endpoint.path;
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| ChannelError::Create {
                    path: path.clone(),
                    source: e,
                })?;
            }
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| {
                ChannelError::Create {
                    path: path.clone(),
                    source: std::io::Error::from_raw_os_error(errno as i32),
                }
            })?;
            tracing::trace!(path = %path.display(), "created pipe");
        }
        Ok(())
    }

    /// Remove both FIFOs. Missing entries are not an error, so this is safe
    /// to call after a failed open and safe to call twice.
    pub fn unlink(&self) {
        for endpoint in [&self.inbound, &self.outbound] {
            match std::fs::remove_file(&endpoint.path) {
                Ok(()) => {
                    tracing::trace!(path = %endpoint.path.display(), "unlinked pipe");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %endpoint.path.display(), error = %e, "failed to unlink pipe");
                }
            }
        }
    }
}

/// Bidirectional message channel over one slot's pipe pair.
///
/// Reads block until a full line is available; writes append a newline and
/// flush before returning; the protocol is intentionally line-synchronous.
#[derive(Debug)]
pub struct PipeChannel {
    reader: FramedRead<pipe::Receiver, WorkerCodec>,
    writer: FramedWrite<pipe::Sender, WorkerCodec>,
    pair: PipePair,
    closed: bool,
}

impl PipeChannel {
    /// Create the FIFOs and open both ends.
    ///
    /// The sender is opened read-write so the open does not depend on the
    /// master having opened its reader yet.
    pub fn open(pair: PipePair) -> Result<Self, ChannelError> {
        pair.create()?;

        let receiver = pipe::OpenOptions::new()
            .open_receiver(&pair.inbound.path)
            .map_err(|e| {
                pair.unlink();
                ChannelError::Open {
                    path: pair.inbound.path.clone(),
                    source: e,
                }
            })?;

        let sender = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&pair.outbound.path)
            .map_err(|e| {
                pair.unlink();
                ChannelError::Open {
                    path: pair.outbound.path.clone(),
                    source: e,
                }
            })?;

        tracing::debug!(
            inbound = %pair.inbound.path.display(),
            outbound = %pair.outbound.path.display(),
            "pipe channel open"
        );

        Ok(Self {
            reader: FramedRead::new(receiver, WorkerCodec::new()),
            writer: FramedWrite::new(sender, WorkerCodec::new()),
            pair,
            closed: false,
        })
    }

    /// Next inbound message. `None` is the EOF sentinel: every writer on the
    /// inbound pipe has closed.
    pub async fn next_message(&mut self) -> Option<Result<InboundMessage, WireError>> {
        self.reader.next().await
    }

    /// Write one message as a line and flush.
    pub async fn send(&mut self, message: OutboundMessage) -> Result<(), WireError> {
        self.writer.send(message).await
    }

    pub fn pair(&self) -> &PipePair {
        &self.pair
    }

    /// Unlink the backing paths. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.pair.unlink();
            self.closed = true;
        }
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::MasterCodec;
    use crate::wire::protocol::CompletionReport;

    fn master_ends(pair: &PipePair) -> (
        FramedWrite<pipe::Sender, MasterCodec>,
        FramedRead<pipe::Receiver, MasterCodec>,
    ) {
        let sender = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&pair.inbound.path)
            .unwrap();
        let receiver = pipe::OpenOptions::new()
            .open_receiver(&pair.outbound.path)
            .unwrap();
        (
            FramedWrite::new(sender, MasterCodec::new()),
            FramedRead::new(receiver, MasterCodec::new()),
        )
    }

    #[tokio::test]
    async fn ping_pong_over_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 0);
        let mut channel = PipeChannel::open(pair.clone()).unwrap();
        let (mut master_tx, mut master_rx) = master_ends(&pair);

        master_tx.send(InboundMessage::Ping).await.unwrap();
        let msg = channel.next_message().await.unwrap().unwrap();
        assert_eq!(msg, InboundMessage::Ping);

        channel.send(OutboundMessage::Pong).await.unwrap();
        let reply = master_rx.next().await.unwrap().unwrap();
        assert_eq!(reply, OutboundMessage::Pong);
    }

    #[tokio::test]
    async fn completion_report_reaches_master() {
        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 1);
        let mut channel = PipeChannel::open(pair.clone()).unwrap();
        let (_master_tx, mut master_rx) = master_ends(&pair);

        let report = CompletionReport::failure(8, 2, "missing parameter");
        channel
            .send(OutboundMessage::TaskEnd(report.clone()))
            .await
            .unwrap();

        let received = master_rx.next().await.unwrap().unwrap();
        assert_eq!(received, OutboundMessage::TaskEnd(report));
    }

    #[tokio::test]
    async fn eof_when_master_closes_writer() {
        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 2);
        let mut channel = PipeChannel::open(pair.clone()).unwrap();
        let (mut master_tx, _master_rx) = master_ends(&pair);

        master_tx.send(InboundMessage::Quit).await.unwrap();
        drop(master_tx);
        drop(_master_rx);

        assert_eq!(
            channel.next_message().await.unwrap().unwrap(),
            InboundMessage::Quit
        );
        assert!(channel.next_message().await.is_none());
    }

    #[tokio::test]
    async fn close_unlinks_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 3);
        let mut channel = PipeChannel::open(pair.clone()).unwrap();
        assert!(pair.inbound.path.exists());
        assert!(pair.outbound.path.exists());

        channel.close();
        assert!(!pair.inbound.path.exists());
        assert!(!pair.outbound.path.exists());
        channel.close();
    }

    #[tokio::test]
    async fn slots_use_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = PipePair::in_dir(dir.path(), 0);
        let b = PipePair::in_dir(dir.path(), 1);
        assert_ne!(a.inbound.path, b.inbound.path);
        assert_ne!(a.outbound.path, b.outbound.path);
    }

    #[tokio::test]
    async fn open_failure_cleans_up() {
        // A directory where FIFOs cannot be created.
        let pair = PipePair::in_dir(Path::new("/nonexistent-gridlet-dir"), 0);
        let err = PipeChannel::open(pair).unwrap_err();
        assert!(matches!(err, ChannelError::Create { .. }));
    }
}
