use std::fmt;

use tokio::sync::broadcast;

use crate::orchestration::events::PipelineEvent;

/// In-process fan-out of pipeline events. Publishing never blocks; slow
/// subscribers lag and skip ahead instead of holding workers back.
pub struct InProcPipelineBus {
    sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcPipelineBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcPipelineBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcPipelineBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Never blocks, so workers can emit from inside lock scopes.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}
