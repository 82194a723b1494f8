//! Events published by the engine to whatever presentation layer is attached.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::fetch::ItemStage;
use crate::job::{JobId, JobReport};
use crate::link::LinkReference;
use crate::quality::BitrateTier;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    JobStarted {
        job: JobId,
        link: LinkReference,
        total: usize,
        destination: PathBuf,
    },
    Thumbnail {
        job: JobId,
        path: PathBuf,
    },
    /// Short human-readable line; empty clears the status.
    Status(String),
    ItemStage {
        job: JobId,
        index: usize,
        stage: ItemStage,
    },
    TierFailed {
        job: JobId,
        index: usize,
        tier: BitrateTier,
        error: String,
    },
    StreamProgress {
        job: JobId,
        index: usize,
        downloaded: u64,
        total: Option<u64>,
        percent: Option<u8>,
    },
    ItemFinished {
        job: JobId,
        index: usize,
        success: bool,
    },
    Progress {
        job: JobId,
        processed: usize,
        total: usize,
        percent: u8,
    },
    JobFinished(JobReport),
    JobFailed {
        link: LinkReference,
        error: String,
    },
    /// Transient state was cleared and the engine is idle again.
    Reset,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::default();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);
        bus.emit(EngineEvent::Status("hello".to_string()));
        bus.emit(EngineEvent::Reset);
        assert!(matches!(kept.recv(), Ok(EngineEvent::Status(s)) if s == "hello"));
        assert!(matches!(kept.recv(), Ok(EngineEvent::Reset)));
        assert_eq!(bus.subscribers.lock().map(|s| s.len()).unwrap_or(0), 1);
    }
}
