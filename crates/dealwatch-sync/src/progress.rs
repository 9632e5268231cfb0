use dealwatch_core::{ScanEvent, ScanPhase};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// Fire-and-forget stream of [`ScanEvent`]s. Publishing never blocks and never
/// fails; subscribers that fall behind lose the oldest events.
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    sender: broadcast::Sender<ScanEvent>,
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ScanEvent) {
        let progress = event.progress.map(|p| format!("{}/{}", p.current, p.total));
        let progress = progress.as_deref();
        match event.phase {
            ScanPhase::Error => {
                warn!(source = %event.source, phase = ?event.phase, progress, "{}", event.message)
            }
            ScanPhase::Connecting | ScanPhase::Complete => {
                info!(source = %event.source, phase = ?event.phase, progress, "{}", event.message)
            }
            _ => {
                debug!(source = %event.source, phase = ?event.phase, progress, "{}", event.message)
            }
        }
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_CAPACITY)
    }
}
