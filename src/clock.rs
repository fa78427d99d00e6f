//! # Slot Clock
//!
//! Drives the per-slot and per-epoch maintenance of the subnet scheduler and
//! keeps the node's [`LocalChainContext`](crate::chain::LocalChainContext)
//! current. Ticks are broadcast so any number of components can follow them.
//!
//! The clock is anchored on a `tokio::time::Instant`, which lets tests run it
//! under a paused runtime.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chain::{ChainSpec, Epoch, Slot};

/// Buffered ticks per subscriber before it starts lagging.
const CLOCK_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockEvent {
    Slot(Slot),
    /// Emitted right after the first slot of the epoch.
    Epoch(Epoch),
}

#[derive(Clone, Debug)]
pub struct SlotClock {
    genesis: Instant,
    slot_duration: Duration,
    slots_per_epoch: u64,
    events: broadcast::Sender<ClockEvent>,
}

impl SlotClock {
    /// Clock whose slot 0 starts at `genesis`.
    pub fn from_instant(genesis: Instant, spec: &ChainSpec) -> Self {
        let (events, _) = broadcast::channel(CLOCK_CHANNEL_CAPACITY);
        Self {
            genesis,
            slot_duration: Duration::from_secs(spec.seconds_per_slot.max(1)),
            slots_per_epoch: spec.slots_per_epoch.max(1),
            events,
        }
    }

    /// Clock anchored on a wall-clock genesis time in unix seconds.
    pub fn from_genesis_time(genesis_time: u64, spec: &ChainSpec) -> Self {
        let now = Instant::now();
        let wall_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let genesis_wall = Duration::from_secs(genesis_time);
        let genesis = if genesis_wall <= wall_now {
            now.checked_sub(wall_now - genesis_wall).unwrap_or(now)
        } else {
            now + (genesis_wall - wall_now)
        };
        Self::from_instant(genesis, spec)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.events.subscribe()
    }

    /// Current slot; slot 0 before genesis.
    pub fn current_slot(&self) -> Slot {
        let elapsed = Instant::now().saturating_duration_since(self.genesis);
        (elapsed.as_millis() / self.slot_duration.as_millis()) as Slot
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_slot() / self.slots_per_epoch
    }

    pub fn slot_start(&self, slot: Slot) -> Instant {
        let millis = (self.slot_duration.as_millis() as u64).saturating_mul(slot);
        self.genesis + Duration::from_millis(millis)
    }

    /// Emits a tick at the start of every slot until `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let clock = self.clone();
        tokio::spawn(async move {
            let mut next = clock.current_slot() + 1;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("slot clock stopped");
                        break;
                    }
                    _ = sleep_until(clock.slot_start(next)) => {
                        trace!(slot = next, "slot tick");
                        // A send error only means nobody is listening yet.
                        let _ = clock.events.send(ClockEvent::Slot(next));
                        if next % clock.slots_per_epoch == 0 {
                            let _ = clock.events.send(ClockEvent::Epoch(next / clock.slots_per_epoch));
                        }
                        next += 1;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_spec() -> ChainSpec {
        ChainSpec {
            seconds_per_slot: 1,
            slots_per_epoch: 4,
            ..ChainSpec::mainnet()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_slot_and_epoch_ticks() {
        let clock = SlotClock::from_instant(Instant::now(), &fast_spec());
        let mut rx = clock.subscribe();
        let cancel = CancellationToken::new();
        let handle = clock.spawn(cancel.clone());

        let mut seen = Vec::new();
        while seen.len() < 5 {
            seen.push(rx.recv().await.expect("clock running"));
        }
        assert_eq!(
            seen,
            vec![
                ClockEvent::Slot(1),
                ClockEvent::Slot(2),
                ClockEvent::Slot(3),
                ClockEvent::Slot(4),
                ClockEvent::Epoch(1),
            ]
        );

        cancel.cancel();
        handle.await.expect("clock task exits");
    }

    #[tokio::test(start_paused = true)]
    async fn current_slot_follows_time() {
        let clock = SlotClock::from_instant(Instant::now(), &fast_spec());
        assert_eq!(clock.current_slot(), 0);
        tokio::time::advance(Duration::from_millis(9_500)).await;
        assert_eq!(clock.current_slot(), 9);
        assert_eq!(clock.current_epoch(), 2);
    }
}
