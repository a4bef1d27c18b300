use std::sync::Arc;

use aixel_engine::EngineError;
use aixel_transport::{DeviceFault, SourceError, TrackId, TrackState};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::lifecycle::LifecycleState;
use crate::track::TrackParams;

/// Session-wide fault surfaced to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultNotification {
    EngineStartFailure(EngineError),
    Engine(EngineError),
    Device(DeviceFault),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    Position {
        frames: u64,
    },
    TrackAdded {
        id: TrackId,
    },
    TrackRemoved {
        id: TrackId,
    },
    TrackStateChanged {
        id: TrackId,
        state: TrackState,
    },
    TrackParamsChanged {
        id: TrackId,
        params: TrackParams,
    },
    TrackFault {
        id: TrackId,
        error: SourceError,
    },
    Fault(FaultNotification),
}

const DEFAULT_EVENT_CAPACITY: usize = 1_024;

struct Subscriber {
    tx: Sender<Event>,
    dropped: u64,
}

/// Fan-out of events to any number of subscribers.
///
/// Each subscriber has a bounded queue. A subscriber that stops draining it
/// loses the events that do not fit, the others are unaffected. Subscribers
/// that hang up are dropped on the next emit.
pub struct EventHub {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        self.subscribers.lock().push(Subscriber { tx, dropped: 0 });
        rx
    }

    pub fn emit(&self, event: Event) {
        self.subscribers
            .lock()
            .retain_mut(|subscriber| match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    if subscriber.dropped > 0 {
                        debug!(dropped = subscriber.dropped, "event subscriber caught up");
                        subscriber.dropped = 0;
                    }
                    true
                }
                Err(TrySendError::Full(_)) => {
                    if subscriber.dropped == 0 {
                        warn!(capacity = self.capacity, "event subscriber is lagging, dropping events");
                    }
                    subscriber.dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub name: String,
    pub state: TrackState,
    pub params: TrackParams,
    pub effective_mute: bool,
}

/// Everything the UI may read, captured at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub lifecycle: LifecycleState,
    pub clock_position: u64,
    pub tracks: Vec<TrackSnapshot>,
}

impl Snapshot {
    pub fn track(&self, id: TrackId) -> Option<&TrackSnapshot> {
        self.tracks.iter().find(|track| track.id == id)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleState::Idle,
            clock_position: 0,
            tracks: Vec::new(),
        }
    }
}

/// Read-only view of the latest snapshot. The writer replaces the whole
/// snapshot at once, so a read never mixes two updates.
#[derive(Clone, Default)]
pub struct SnapshotReader {
    cell: Arc<RwLock<Snapshot>>,
}

impl SnapshotReader {
    pub fn get(&self) -> Snapshot {
        self.cell.read().clone()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.cell.read().lifecycle
    }

    pub fn clock_position(&self) -> u64 {
        self.cell.read().clock_position
    }

    pub(crate) fn store(&self, snapshot: Snapshot) {
        *self.cell.write() = snapshot;
    }
}
