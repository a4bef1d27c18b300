use std::time::Duration;

use aixel_transport::{NodeBuffer, SourceError, StreamFormat, Timestamp, TrackId, TrackState, Window};
use rayon::prelude::*;

use crate::track::TrackList;

/// Maps the logical playback clock onto the device clock, one lookahead
/// window at a time.
///
/// `clock` is the logical position of the next window to produce.
/// `scheduled_until` is the device time at which the queued audio runs out;
/// it is cleared whenever playback halts so the next window lands at the
/// device's current time.
#[derive(Debug, Clone)]
pub struct Scheduler {
    window_frames: u64,
    clock: u64,
    scheduled_until: Option<Timestamp>,
}

/// Buffers produced for one window, before submission.
#[derive(Debug, Default)]
pub(crate) struct Production {
    pub buffers: Vec<NodeBuffer>,
    pub failures: Vec<(TrackId, SourceError)>,
}

impl Scheduler {
    pub fn new(window_frames: u32) -> Self {
        Self {
            window_frames: window_frames.max(1) as u64,
            clock: 0,
            scheduled_until: None,
        }
    }

    pub fn window_frames(&self) -> u64 {
        self.window_frames
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn scheduled_until(&self) -> Option<Timestamp> {
        self.scheduled_until
    }

    /// Move the logical clock. Also forgets the device horizon.
    pub(crate) fn reset(&mut self, position: u64) {
        self.clock = position;
        self.scheduled_until = None;
    }

    pub(crate) fn halt(&mut self) {
        self.scheduled_until = None;
    }

    /// A window is due once less than one window of audio is queued ahead
    /// of the device.
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.scheduled_until {
            Some(until) => until.0 <= now.0 + self.window_frames,
            None => true,
        }
    }

    /// Wall-clock time until the next window becomes due.
    pub fn time_until_due(&self, now: Timestamp, sample_rate: u32) -> Duration {
        let Some(until) = self.scheduled_until else {
            return Duration::ZERO;
        };
        let due_at = until.0.saturating_sub(self.window_frames);
        let frames = due_at.saturating_sub(now.0);
        Duration::from_secs_f64(frames as f64 / sample_rate.max(1) as f64)
    }

    /// The next logical window and the device window it will play in.
    pub fn next_windows(&self, now: Timestamp) -> (Window, Window) {
        let logical = Window::new(self.clock, self.window_frames);
        let start = self.scheduled_until.map_or(now, |until| until.max(now));
        (logical, Window::at(start, self.window_frames))
    }

    /// Ask every audible playing track for `window`, in parallel.
    ///
    /// Results come back in mix order; each buffer is scaled by its track's
    /// gain and sized to exactly one window.
    pub(crate) fn produce(&self, tracks: &mut TrackList, window: Window, format: StreamFormat) -> Production {
        let any_solo = tracks.any_solo();
        let outcomes: Vec<_> = tracks
            .slots_mut()
            .par_iter_mut()
            .map(|slot| {
                if slot.state != TrackState::Playing || slot.params.effectively_muted(any_solo) {
                    return None;
                }
                let gain = slot.params.gain;
                Some((slot.id, gain, slot.produce(window, format)))
            })
            .collect();

        let expected = format.samples_for(window.frames);
        let mut production = Production::default();
        for (id, gain, result) in outcomes.into_iter().flatten() {
            match result {
                Ok(mut samples) => {
                    samples.resize(expected, 0.0);
                    if gain != 1.0 {
                        samples.iter_mut().for_each(|sample| *sample *= gain);
                    }
                    production.buffers.push(NodeBuffer {
                        node: id.into(),
                        samples,
                    });
                }
                Err(error) => production.failures.push((id, error)),
            }
        }
        production
    }

    /// Record that `device` was queued and move on to the next window.
    pub(crate) fn commit(&mut self, device: Window) {
        self.clock += self.window_frames;
        self.scheduled_until = Some(device.end_timestamp());
    }
}
