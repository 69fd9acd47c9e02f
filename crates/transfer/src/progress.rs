use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::types::ProgressEvent;

/// Receives progress events from a coordinator.
///
/// Called from worker tasks; implementations must be cheap and must not
/// block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Sink shared between a coordinator and its workers.
pub type SharedSink = Arc<dyn ProgressSink>;

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NullSink {
    pub fn shared() -> SharedSink {
        Arc::new(Self)
    }
}

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Coalesces per-unit completions into one event every `every` units.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    every: usize,
    done: usize,
}

impl ProgressThrottle {
    /// `every == 0` is treated as 1.
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            done: 0,
        }
    }

    /// Records one completion; returns the running count when an event
    /// is due.
    pub fn record(&mut self) -> Option<usize> {
        self.done += 1;
        (self.done % self.every == 0).then_some(self.done)
    }

    pub fn done(&self) -> usize {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    #[test]
    fn throttle_fires_every_n() {
        let mut throttle = ProgressThrottle::new(3);
        let fired: Vec<_> = (0..10).filter_map(|_| throttle.record()).collect();
        assert_eq!(fired, vec![3, 6, 9]);
        assert_eq!(throttle.done(), 10);
    }

    #[test]
    fn throttle_zero_means_every_unit() {
        let mut throttle = ProgressThrottle::new(0);
        assert_eq!(throttle.record(), Some(1));
        assert_eq!(throttle.record(), Some(2));
    }

    #[test]
    fn closure_sink() {
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let sink: SharedSink = Arc::new(move |event: ProgressEvent| {
            *counter.lock().unwrap() += event.current;
        });

        sink.emit(ProgressEvent::new(Phase::Transferring, 2, 5));
        sink.emit(ProgressEvent::new(Phase::Transferring, 3, 5));
        assert_eq!(*seen.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: SharedSink = Arc::new(tx);
        sink.emit(ProgressEvent::new(Phase::Preparing, 0, 1));
        drop(sink);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.phase, Phase::Preparing);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.emit(ProgressEvent::new(Phase::Preparing, 0, 2));
        sink.emit(ProgressEvent::new(Phase::Complete, 2, 2));
        let phases: Vec<_> = sink.events().iter().map(|e| e.phase).collect();
        assert_eq!(phases, vec![Phase::Preparing, Phase::Complete]);
    }
}
