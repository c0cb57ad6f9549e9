use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fingraph_core::event::{ExecutionOrderEntry, ProgressEvent, ProgressKind, StageStatus};
use fingraph_core::traits::ProgressObserver;

/// Observer that forwards notifications into a bounded channel.
///
/// Uses `try_send`, so a slow consumer costs dropped events rather than a
/// stalled pipeline.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    transaction_id: String,
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelObserver {
    pub fn channel(
        transaction_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                transaction_id: transaction_id.into(),
                tx,
            },
            rx,
        )
    }

    fn send(&self, stage: &str, kind: ProgressKind) {
        let event = ProgressEvent::new(&self.transaction_id, stage, kind);
        if let Err(e) = self.tx.try_send(event) {
            debug!(stage, error = %e, "Progress event dropped");
        }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_start(&self, stage: &str, tasks: &[String]) {
        self.send(
            stage,
            ProgressKind::Started {
                tasks: tasks.to_vec(),
            },
        );
    }

    fn on_complete(&self, stage: &str) {
        self.send(stage, ProgressKind::Completed);
    }

    fn on_fail(&self, stage: &str, error: &str) {
        self.send(
            stage,
            ProgressKind::Failed {
                error: error.to_string(),
            },
        );
    }
}

/// Builds the client-facing execution order from progress events.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    order: Vec<ExecutionOrderEntry>,
    events: Vec<ProgressEvent>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        match &event.kind {
            ProgressKind::Started { .. } => {
                self.order
                    .push(ExecutionOrderEntry::start(&event.stage, event.timestamp));
            }
            ProgressKind::Completed => self.finish(&event.stage, StageStatus::Completed, event),
            ProgressKind::Failed { .. } => self.finish(&event.stage, StageStatus::Failed, event),
        }
        self.events.push(event.clone());
    }

    fn finish(&mut self, stage: &str, status: StageStatus, event: &ProgressEvent) {
        let running = self
            .order
            .iter_mut()
            .rev()
            .find(|e| e.stage == stage && e.status == StageStatus::Running);
        match running {
            Some(entry) => entry.finish(status, event.timestamp),
            // A stage can fail before it starts (input validation).
            None => {
                let mut entry = ExecutionOrderEntry::start(stage, event.timestamp);
                entry.finish(status, event.timestamp);
                self.order.push(entry);
            }
        }
    }

    pub fn execution_order(&self) -> &[ExecutionOrderEntry] {
        &self.order
    }

    pub fn events(&self) -> &[ProgressEvent] {
        &self.events
    }

    /// Stage currently running, if any.
    pub fn current_stage(&self) -> Option<&str> {
        self.order
            .iter()
            .rev()
            .find(|e| e.status == StageStatus::Running)
            .map(|e| e.stage.as_str())
    }

    /// Consume events until every sender is dropped or `cancel` fires.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Self {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        info!(
                            transaction_id = %event.transaction_id,
                            stage = %event.stage,
                            event = ?event.kind,
                            "Progress"
                        );
                        self.apply(&event);
                    }
                    None => break,
                },
            }
        }
        self
    }

    /// Spawn [`ProgressTracker::run`] as a background task.
    pub fn spawn(
        rx: mpsc::Receiver<ProgressEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<ProgressTracker> {
        tokio::spawn(Self::new().run(rx, cancel))
    }
}
