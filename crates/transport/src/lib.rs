use std::fmt;
use std::sync::Arc;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

mod source;

pub use source::{BufferSource, SampleSource, SourceError};

/// Pulses Per Quarter Note - defines musical timing resolution
pub const PPQN: u64 = 960;

/// Stable identifier of a track, unique within one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a track's node inside the audio engine.
///
/// Nodes are derived from track ids so the engine and the orchestrator agree
/// on identity without a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

impl From<TrackId> for NodeHandle {
    fn from(id: TrackId) -> Self {
        NodeHandle(id.0)
    }
}

/// A point on the device clock, in frames since the engine started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

/// A half-open span of frames `[start, start + frames)`.
///
/// The same type is used for logical playback windows and for device
/// windows; which clock `start` refers to depends on the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: u64,
    pub frames: u64,
}

impl Window {
    pub fn new(start: u64, frames: u64) -> Self {
        Self { start, frames }
    }

    /// Window of `frames` starting at a device timestamp.
    pub fn at(timestamp: Timestamp, frames: u64) -> Self {
        Self::new(timestamp.0, frames)
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.frames
    }

    pub fn end_timestamp(&self) -> Timestamp {
        Timestamp(self.end())
    }

    /// True when `self` begins exactly where `previous` ends.
    pub fn follows(&self, previous: &Window) -> bool {
        self.start == previous.end()
    }

    pub fn contains(&self, frame: u64) -> bool {
        frame >= self.start && frame < self.end()
    }
}

/// Sample rate and channel count of the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Number of interleaved samples needed to cover `frames`.
    #[inline]
    pub fn samples_for(&self, frames: u64) -> usize {
        frames as usize * self.channels as usize
    }

    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    pub fn secs_to_frames(&self, secs: f64) -> u64 {
        (secs * self.sample_rate as f64).round() as u64
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(48_000, 2)
    }
}

/// Playback state of a single track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackState {
    /// Not registered with an orchestrator.
    Unloaded,
    /// Registered, engine not ready.
    Loaded,
    /// Attached to a ready engine, waiting for playback.
    Scheduled,
    /// Receiving buffers from the scheduler.
    Playing,
    /// Source failed; skipped until the clock is reset.
    Stopped,
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackState::Unloaded => "unloaded",
            TrackState::Loaded => "loaded",
            TrackState::Scheduled => "scheduled",
            TrackState::Playing => "playing",
            TrackState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Audio produced by one track for one window, addressed to its node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeBuffer {
    pub node: NodeHandle,
    /// Interleaved samples, exactly `window.frames * channels` long.
    pub samples: Vec<f32>,
}

/// Faults reported asynchronously by the audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFault {
    /// The device needed audio and none was queued.
    Underrun,
    /// The output device disappeared or the stream died.
    DeviceLost,
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFault::Underrun => f.write_str("buffer underrun"),
            DeviceFault::DeviceLost => f.write_str("output device lost"),
        }
    }
}

/// Owned interleaved audio, as produced by decoders and mix-downs.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// Shared, immutable audio sample data.
///
/// Cloning only bumps the reference count, so many sources can play the same
/// decoded stem without copying it.
///
/// ```
/// use aixel_transport::AudioArc;
///
/// let audio = AudioArc::new(vec![0.0, 0.5, 1.0, 0.5], 44100, 2);
/// let shared = audio.clone();
/// assert_eq!(shared.frames(), 2);
/// ```
#[derive(Clone)]
pub struct AudioArc {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioArc {
    /// # Panics
    ///
    /// Panics if `channels` is 0 or if `samples.len()` is not divisible by `channels`.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        assert!(channels > 0, "channels must be greater than 0");
        assert_eq!(
            samples.len() % channels as usize,
            0,
            "samples.len() must be divisible by channels"
        );
        Self {
            samples: Arc::from(samples),
            sample_rate,
            channels,
        }
    }

    /// Takes ownership of a decoded buffer.
    pub fn from_audio_buffer(buffer: AudioBuffer) -> Self {
        Self::new(buffer.samples, buffer.sample_rate, buffer.channels)
    }

    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_arc(&self) -> &Arc<[f32]> {
        &self.samples
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel).
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample at `frame` for output channel `channel`, folding extra output
    /// channels onto the available source channels.
    #[inline]
    pub fn sample_for(&self, frame: usize, channel: usize) -> f32 {
        let channels = self.channels as usize;
        self.samples[frame * channels + channel % channels]
    }

    /// Resample to `target_sample_rate`. Returns a cheap clone when the rate
    /// already matches.
    pub fn resample(&self, target_sample_rate: u32) -> anyhow::Result<Self> {
        if self.sample_rate == target_sample_rate {
            return Ok(self.clone());
        }

        resample_audio_arc(self, target_sample_rate)
    }
}

impl fmt::Debug for AudioArc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioArc")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("duration_secs", &self.duration_secs())
            .finish()
    }
}

pub fn ticks_to_frames(ticks: f64, tempo: f64, sample_rate: u32) -> f64 {
    let seconds_per_beat = 60.0 / tempo;
    let seconds_per_tick = seconds_per_beat / PPQN as f64;
    ticks * seconds_per_tick * sample_rate as f64
}

pub fn frames_to_ticks(frames: f64, tempo: f64, sample_rate: u32) -> f64 {
    let seconds_per_beat = 60.0 / tempo;
    let seconds_per_tick = seconds_per_beat / PPQN as f64;
    frames / (seconds_per_tick * sample_rate as f64)
}

/// Sinc-interpolated resampling of an `AudioArc`.
pub fn resample_audio_arc(audio: &AudioArc, target_sample_rate: u32) -> anyhow::Result<AudioArc> {
    if audio.sample_rate == target_sample_rate {
        return Ok(audio.clone());
    }
    if audio.is_empty() {
        return Ok(AudioArc::new(Vec::new(), target_sample_rate, audio.channels));
    }

    let channels = audio.channels as usize;
    let input_frames = audio.frames();
    let resample_ratio = target_sample_rate as f64 / audio.sample_rate as f64;

    // rubato works on planar buffers
    let mut input_channels = vec![Vec::with_capacity(input_frames); channels];
    for frame in audio.samples().chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            input_channels[ch].push(sample);
        }
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler =
        SincFixedIn::<f32>::new(resample_ratio, 2.0, params, input_frames, channels)?;
    let output_channels = resampler.process(&input_channels, None)?;

    let output_frames = output_channels[0].len();
    let mut output_samples = Vec::with_capacity(output_frames * channels);
    for frame_idx in 0..output_frames {
        for channel in &output_channels {
            output_samples.push(channel[frame_idx]);
        }
    }

    Ok(AudioArc::new(
        output_samples,
        target_sample_rate,
        audio.channels,
    ))
}
