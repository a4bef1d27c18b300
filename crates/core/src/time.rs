use aixel_transport::{PPQN, frames_to_ticks, ticks_to_frames};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.numerator
    }

    pub fn ticks_per_bar(&self) -> u64 {
        PPQN * self.numerator as u64
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

impl From<(u32, u32)> for TimeSignature {
    fn from((numerator, denominator): (u32, u32)) -> Self {
        Self::new(numerator, denominator)
    }
}

/// Maps the frame-based playback clock onto musical time for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeContext {
    pub tempo: f64,
    pub time_signature: TimeSignature,
    pub sample_rate: u32,
}

impl TimeContext {
    pub fn new(tempo: f64, time_signature: impl Into<TimeSignature>, sample_rate: u32) -> Self {
        Self {
            tempo,
            time_signature: time_signature.into(),
            sample_rate,
        }
    }

    pub fn frames_to_ticks(&self, frames: u64) -> u64 {
        frames_to_ticks(frames as f64, self.tempo, self.sample_rate).round() as u64
    }

    pub fn ticks_to_frames(&self, ticks: u64) -> u64 {
        ticks_to_frames(ticks as f64, self.tempo, self.sample_rate).round() as u64
    }

    pub fn ticks_to_beats(&self, ticks: u64) -> f64 {
        ticks as f64 / PPQN as f64
    }

    pub fn beats_to_ticks(&self, beats: f64) -> u64 {
        (beats * PPQN as f64) as u64
    }

    pub fn bars_to_frames(&self, bars: f64) -> u64 {
        let beats = bars * self.time_signature.beats_per_bar() as f64;
        self.ticks_to_frames(self.beats_to_ticks(beats))
    }

    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    pub fn format_position(&self, ticks: u64) -> MusicalPosition {
        let total_beats = self.ticks_to_beats(ticks);
        let beats_per_bar = self.time_signature.beats_per_bar() as f64;

        let bar = (total_beats / beats_per_bar).floor() as u32 + 1;
        let beat_in_bar = (total_beats % beats_per_bar).floor() as u32 + 1;
        let tick_in_beat = (ticks % PPQN) as u32;

        MusicalPosition {
            bar,
            beat: beat_in_bar,
            tick: tick_in_beat,
        }
    }

    /// Musical position of a clock position in frames.
    pub fn position_at(&self, frames: u64) -> MusicalPosition {
        self.format_position(self.frames_to_ticks(frames))
    }
}

impl Default for TimeContext {
    fn default() -> Self {
        Self::new(120.0, TimeSignature::default(), 48_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MusicalPosition {
    pub bar: u32,
    pub beat: u32,
    pub tick: u32,
}

impl std::fmt::Display for MusicalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{:03}", self.bar, self.beat, self.tick)
    }
}
