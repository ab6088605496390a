//! Worker slot: one pipe pair, one dispatch at a time.
//!
//! The loop is strictly sequential: a dispatch runs to completion before the
//! next inbound line is read, so completion reports leave in dispatch order
//! by construction. A malformed line is fatal to the message only; channel
//! failure or EOF ends the slot.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::executor::TaskExecutor;
use crate::wire::channel::{ChannelError, PipeChannel, PipePair};
use crate::wire::codec::WireError;
use crate::wire::protocol::{InboundMessage, OutboundMessage};

pub struct WorkerSlot {
    slot_id: usize,
    channel: PipeChannel,
    executor: Arc<TaskExecutor>,
    cancel: CancellationToken,
    current_request: Option<u64>,
}

impl WorkerSlot {
    /// Bind the slot to its pipe pair. Channel failure here is fatal to slot
    /// startup and surfaces to the supervisor.
    pub fn open(
        slot_id: usize,
        pair: PipePair,
        executor: Arc<TaskExecutor>,
        cancel: CancellationToken,
    ) -> Result<Self, ChannelError> {
        let channel = PipeChannel::open(pair)?;
        Ok(Self {
            slot_id,
            channel,
            executor,
            cancel,
            current_request: None,
        })
    }

    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    /// Request id of the dispatch currently being processed.
    pub fn current_request(&self) -> Option<u64> {
        self.current_request
    }

    /// Process dispatches until QUIT, EOF, cancellation, or channel failure.
    ///
    /// Cancellation is only honored between dispatches: an in-flight task
    /// runs to completion or failure.
    pub async fn run(mut self) {
        tracing::info!(slot = self.slot_id, "slot accepting dispatches");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::info!(slot = self.slot_id, "slot draining");
                    break;
                }

                message = self.channel.next_message() => {
                    match message {
                        Some(Ok(InboundMessage::Execute(request))) => {
                            self.current_request = Some(request.request_id);
                            let report = self.executor.execute(&request).await;
                            self.current_request = None;

                            if let Err(e) = self.channel.send(OutboundMessage::TaskEnd(report)).await {
                                tracing::error!(
                                    slot = self.slot_id,
                                    error = %e,
                                    "failed to emit completion report"
                                );
                                break;
                            }
                        }
                        Some(Ok(InboundMessage::Ping)) => {
                            if let Err(e) = self.channel.send(OutboundMessage::Pong).await {
                                tracing::error!(slot = self.slot_id, error = %e, "failed to answer ping");
                                break;
                            }
                        }
                        Some(Ok(InboundMessage::Quit)) => {
                            tracing::info!(slot = self.slot_id, "quit received");
                            break;
                        }
                        Some(Err(WireError::Protocol(e))) => {
                            tracing::warn!(
                                slot = self.slot_id,
                                error = %e,
                                "malformed protocol line, skipping"
                            );
                        }
                        Some(Err(e)) => {
                            tracing::error!(slot = self.slot_id, error = %e, "channel failure");
                            break;
                        }
                        None => {
                            tracing::info!(slot = self.slot_id, "inbound pipe closed");
                            break;
                        }
                    }
                }
            }
        }

        self.channel.close();
        tracing::info!(slot = self.slot_id, "slot stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::registry::TaskRegistry;
    use crate::resolver::{BackingResolver, FileResolver};
    use crate::serializer::{JsonSerializer, Serializer};
    use crate::tracker::ObjectTracker;
    use crate::value::RuntimeValue;
    use crate::wire::codec::MasterCodec;
    use crate::wire::protocol::{
        CompletionReport, DispatchRequest, OnFailure, ParamValue, TargetKind,
    };

    use futures::{SinkExt, StreamExt};
    use tokio::net::unix::pipe;
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn demo_registry() -> Arc<TaskRegistry> {
        let registry = TaskRegistry::new();
        registry.register("demo.answer", vec![], |_| async {
            Ok(vec![RuntimeValue::Int(2)])
        });
        registry.register("demo.slow_answer", vec![], |_| async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok(vec![RuntimeValue::Int(1)])
        });
        registry
    }

    fn demo_executor(registry: Arc<TaskRegistry>) -> Arc<TaskExecutor> {
        let resolver: Arc<dyn BackingResolver> = Arc::new(FileResolver::new());
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        let tracker = Arc::new(ObjectTracker::new(
            Arc::clone(&resolver),
            Arc::clone(&serializer),
        ));
        Arc::new(TaskExecutor::new(
            registry,
            tracker,
            None,
            resolver,
            serializer,
            Arc::new(ExecutionContext::new("test-node", "/tmp")),
        ))
    }

    fn dispatch(request_id: u64, method: &str) -> InboundMessage {
        InboundMessage::Execute(Box::new(DispatchRequest {
            request_id,
            stdout_path: String::new(),
            stderr_path: String::new(),
            debug: false,
            num_slaves: 0,
            has_target: false,
            on_failure: OnFailure::Retry,
            target_kind: TargetKind::Function,
            module_or_class: "demo".to_string(),
            method_name: method.to_string(),
            target_has_self: false,
            params: vec![],
            result_bindings: vec!["r0".to_string()],
        }))
    }

    struct MasterEnd {
        tx: FramedWrite<pipe::Sender, MasterCodec>,
        rx: FramedRead<pipe::Receiver, MasterCodec>,
    }

    fn attach_master(pair: &PipePair) -> MasterEnd {
        let sender = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&pair.inbound.path)
            .unwrap();
        let receiver = pipe::OpenOptions::new()
            .open_receiver(&pair.outbound.path)
            .unwrap();
        MasterEnd {
            tx: FramedWrite::new(sender, MasterCodec::new()),
            rx: FramedRead::new(receiver, MasterCodec::new()),
        }
    }

    async fn expect_report(master: &mut MasterEnd) -> CompletionReport {
        match master.rx.next().await.unwrap().unwrap() {
            OutboundMessage::TaskEnd(report) => report,
            other => panic!("expected completion report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_produces_completion_report() {
        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 0);
        let slot = WorkerSlot::open(
            0,
            pair.clone(),
            demo_executor(demo_registry()),
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(slot.current_request(), None);
        let join = tokio::spawn(slot.run());
        let mut master = attach_master(&pair);

        master.tx.send(dispatch(11, "answer")).await.unwrap();
        let report = expect_report(&mut master).await;
        assert_eq!(report.request_id, 11);
        assert_eq!(report.exit_status, 0);
        assert_eq!(report.new_values[0].value, ParamValue::Int(2));

        master.tx.send(InboundMessage::Quit).await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn reports_keep_dispatch_order() {
        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 0);
        let slot = WorkerSlot::open(
            0,
            pair.clone(),
            demo_executor(demo_registry()),
            CancellationToken::new(),
        )
        .unwrap();
        let join = tokio::spawn(slot.run());
        let mut master = attach_master(&pair);

        // The first task is slower than the second; reports still arrive in
        // dispatch order because the slot is sequential.
        master.tx.send(dispatch(1, "slow_answer")).await.unwrap();
        master.tx.send(dispatch(2, "answer")).await.unwrap();

        let first = expect_report(&mut master).await;
        let second = expect_report(&mut master).await;
        assert_eq!(first.request_id, 1);
        assert_eq!(second.request_id, 2);

        master.tx.send(InboundMessage::Quit).await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 0);
        let slot = WorkerSlot::open(
            0,
            pair.clone(),
            demo_executor(demo_registry()),
            CancellationToken::new(),
        )
        .unwrap();
        let join = tokio::spawn(slot.run());
        let mut master = attach_master(&pair);

        master.tx.send(InboundMessage::Ping).await.unwrap();
        assert_eq!(
            master.rx.next().await.unwrap().unwrap(),
            OutboundMessage::Pong
        );

        master.tx.send(InboundMessage::Quit).await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_and_slot_survives() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 0);
        let slot = WorkerSlot::open(
            0,
            pair.clone(),
            demo_executor(demo_registry()),
            CancellationToken::new(),
        )
        .unwrap();
        let join = tokio::spawn(slot.run());

        // Raw writer so we can inject garbage alongside valid traffic.
        let mut raw = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&pair.inbound.path)
            .unwrap();
        raw.write_all(b"GIBBERISH LINE\nPING\n").await.unwrap();

        let receiver = pipe::OpenOptions::new()
            .open_receiver(&pair.outbound.path)
            .unwrap();
        let mut rx = FramedRead::new(receiver, MasterCodec::new());
        assert_eq!(rx.next().await.unwrap().unwrap(), OutboundMessage::Pong);

        raw.write_all(b"QUIT\n").await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_drains_an_idle_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pair = PipePair::in_dir(dir.path(), 0);
        let cancel = CancellationToken::new();
        let slot = WorkerSlot::open(
            0,
            pair.clone(),
            demo_executor(demo_registry()),
            cancel.clone(),
        )
        .unwrap();
        let join = tokio::spawn(slot.run());
        let _master = attach_master(&pair);

        cancel.cancel();
        join.await.unwrap();
        assert!(!pair.inbound.path.exists());
    }
}
