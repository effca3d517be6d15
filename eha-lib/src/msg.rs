//! Outbound message contract and the transport abstraction.
//!
//! The real publish/subscribe transport lives outside this crate; the core
//! only needs something it can hand [EhaMessage]s to. [InProcessBus] is a
//! crossbeam-channel fan-out used by tests, the CLI, and embedders that run
//! everything in one process.
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::dict::ChannelId;
use crate::evr::EvrRecord;
use crate::value::ChannelValue;

/// A channel value with its batch correlation token.
#[derive(Debug, Clone)]
pub struct ChannelValueMessage {
    pub value: ChannelValue,
    pub stream_id: String,
    pub from_sse: bool,
}

/// Snapshot of the process-wide suspect channel table.
#[derive(Debug, Clone, Default)]
pub struct SuspectChannelTable {
    pub channels: Vec<ChannelId>,
}

/// Everything the core publishes.
#[derive(Debug, Clone)]
pub enum EhaMessage {
    /// Start of one processing batch. All values of the batch carry the
    /// same stream id, letting subscribers regroup a derivation chain.
    StartChannelProc { stream_id: String },
    ChannelValue(Box<ChannelValueMessage>),
    Evr(Box<EvrRecord>),
    EndChannelProc { stream_id: String },
    SuspectChannels(SuspectChannelTable),
}

/// Abstract outbound transport.
pub trait MessageBus: Send + Sync {
    fn publish(&self, msg: EhaMessage);
}

/// Discards everything.
pub struct NullBus;

impl MessageBus for NullBus {
    fn publish(&self, _msg: EhaMessage) {}
}

/// Accumulates published messages for later inspection. Used by tests and
/// by file-driven tools that want the batch as a value.
#[derive(Default)]
pub struct CollectingBus {
    messages: Mutex<Vec<EhaMessage>>,
}

impl CollectingBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand back and reset the accumulated messages.
    #[must_use]
    pub fn take(&self) -> Vec<EhaMessage> {
        std::mem::take(&mut self.messages.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl MessageBus for CollectingBus {
    fn publish(&self, msg: EhaMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(msg);
    }
}

/// Fan-out bus over crossbeam channels. Slow subscribers do not block the
/// publisher; disconnected subscribers are dropped on the next publish.
#[derive(Default)]
pub struct InProcessBus {
    subscribers: Mutex<Vec<Sender<EhaMessage>>>,
}

impl InProcessBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EhaMessage> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

impl MessageBus for InProcessBus {
    fn publish(&self, msg: EhaMessage) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(msg.clone()).is_ok());
    }
}

/// Periodically broadcasts the suspect channel table on a fixed interval
/// until dropped or stopped.
pub struct SuspectChannelBroadcaster {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl SuspectChannelBroadcaster {
    pub fn start(
        bus: Arc<dyn MessageBus>,
        table: Arc<Mutex<SuspectChannelTable>>,
        interval: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("suspect_channel_broadcast".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let snapshot = table.lock().unwrap_or_else(|e| e.into_inner()).clone();
                        bus.publish(EhaMessage::SuspectChannels(snapshot));
                    }
                    _ => {
                        debug!("suspect channel broadcaster stopping");
                        break;
                    }
                }
            })
            .expect("failed to spawn suspect channel broadcaster");
        SuspectChannelBroadcaster {
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SuspectChannelBroadcaster {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_bus_fans_out() {
        let bus = InProcessBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        bus.publish(EhaMessage::StartChannelProc {
            stream_id: "s1".into(),
        });
        assert!(matches!(
            rx1.try_recv().unwrap(),
            EhaMessage::StartChannelProc { .. }
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            EhaMessage::StartChannelProc { .. }
        ));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(EhaMessage::EndChannelProc {
            stream_id: "s1".into(),
        });
        assert!(bus
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty());
    }

    #[test]
    fn suspect_broadcast_fires() {
        let bus = Arc::new(CollectingBus::new());
        let table = Arc::new(Mutex::new(SuspectChannelTable {
            channels: vec!["A-0001".into()],
        }));
        let caster = SuspectChannelBroadcaster::start(
            bus.clone(),
            table,
            Duration::from_millis(10),
        );
        thread::sleep(Duration::from_millis(60));
        caster.stop();
        let msgs = bus.take();
        assert!(msgs
            .iter()
            .any(|m| matches!(m, EhaMessage::SuspectChannels(t) if t.channels == vec!["A-0001".to_string()])));
    }
}
