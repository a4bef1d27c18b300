use std::fmt;

use aixel_transport::{BufferSource, NodeHandle, SourceError, StreamFormat, TrackId, TrackState, Window};

use crate::error::{OrchestrationError, Result};

/// Mix parameters of a track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackParams {
    pub gain: f32,
    pub mute: bool,
    pub solo: bool,
}

impl TrackParams {
    /// Mute as heard: a solo anywhere in the session silences every
    /// non-solo track regardless of its own flag.
    pub fn effectively_muted(&self, any_solo: bool) -> bool {
        self.mute || (any_solo && !self.solo)
    }
}

impl Default for TrackParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            mute: false,
            solo: false,
        }
    }
}

pub(crate) fn validate_gain(gain: f32) -> Result<f32> {
    if (0.0..=1.0).contains(&gain) {
        Ok(gain)
    } else {
        Err(OrchestrationError::InvalidGain(gain))
    }
}

/// A track about to be handed to the orchestrator.
///
/// The id is optional; the orchestrator assigns the next free one on insert.
/// Once added, the track is only reachable through the orchestrator's
/// commands.
pub struct Track {
    id: Option<TrackId>,
    name: String,
    params: TrackParams,
    source: Box<dyn BufferSource>,
}

impl Track {
    pub fn new(name: impl Into<String>, source: impl BufferSource + 'static) -> Self {
        Self {
            id: None,
            name: name.into(),
            params: TrackParams::default(),
            source: Box::new(source),
        }
    }

    pub fn with_id(mut self, id: TrackId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.params.gain = gain;
        self
    }

    pub fn muted(mut self, mute: bool) -> Self {
        self.params.mute = mute;
        self
    }

    pub fn soloed(mut self, solo: bool) -> Self {
        self.params.solo = solo;
        self
    }

    pub fn id(&self) -> Option<TrackId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> TrackParams {
        self.params
    }

    /// A track outside an orchestrator is never loaded.
    pub fn state(&self) -> TrackState {
        TrackState::Unloaded
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A registered track as owned by the orchestrator.
pub(crate) struct TrackSlot {
    pub id: TrackId,
    pub name: String,
    pub params: TrackParams,
    pub state: TrackState,
    source: Box<dyn BufferSource>,
}

impl TrackSlot {
    pub fn node(&self) -> NodeHandle {
        self.id.into()
    }

    pub fn produce(&mut self, window: Window, format: StreamFormat) -> std::result::Result<Vec<f32>, SourceError> {
        self.source.produce(window, format)
    }

    pub fn seek(&mut self, position: u64) -> std::result::Result<(), SourceError> {
        self.source.seek(position)
    }
}

/// Insertion-ordered set of tracks. Order is the mix order.
#[derive(Default)]
pub(crate) struct TrackList {
    slots: Vec<TrackSlot>,
    next_id: u64,
}

impl TrackList {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.slots.iter().any(|slot| slot.id == id)
    }

    /// Register `track`, assigning an id when it has none.
    pub fn insert(&mut self, track: Track, state: TrackState) -> Result<TrackId> {
        let id = match track.id {
            Some(id) if self.contains(id) => return Err(OrchestrationError::DuplicateTrack(id)),
            Some(id) => id,
            None => self.allocate_id()?,
        };
        self.next_id = self.next_id.max(id.0.saturating_add(1));

        self.slots.push(TrackSlot {
            id,
            name: track.name,
            params: track.params,
            state,
            source: track.source,
        });
        Ok(id)
    }

    /// First free id at or above `next_id`, wrapping to the lowest free id
    /// once the top of the range is taken.
    fn allocate_id(&self) -> Result<TrackId> {
        let free = |id: &u64| !self.contains(TrackId(*id));
        (self.next_id..=u64::MAX)
            .find(free)
            .or_else(|| (0..self.next_id).find(free))
            .map(TrackId)
            .ok_or(OrchestrationError::TooManyTracks { limit: self.len() })
    }

    pub fn remove(&mut self, id: TrackId) -> Option<TrackSlot> {
        let index = self.slots.iter().position(|slot| slot.id == id)?;
        Some(self.slots.remove(index))
    }

    pub fn get(&self, id: TrackId) -> Option<&TrackSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut TrackSlot> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackSlot> {
        self.slots.iter_mut()
    }

    pub fn slots_mut(&mut self) -> &mut [TrackSlot] {
        &mut self.slots
    }

    pub fn any_solo(&self) -> bool {
        self.slots.iter().any(|slot| slot.params.solo)
    }

    /// Effective mute per track, in mix order.
    pub fn effective_mutes(&self) -> Vec<bool> {
        let any_solo = self.any_solo();
        self.slots
            .iter()
            .map(|slot| slot.params.effectively_muted(any_solo))
            .collect()
    }
}
