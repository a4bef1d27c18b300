use crate::{AudioArc, StreamFormat, Window};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("source exhausted")]
    Exhausted,

    #[error("decode error: {0}")]
    Decode(String),
}

/// Something that can fill a window of the timeline with audio.
///
/// Windows handed to `produce` are in logical playback time. Consecutive calls
/// receive contiguous windows while playback runs; after a seek or a stop the
/// next window starts wherever the clock was moved to.
pub trait BufferSource: Send {
    /// Interleaved samples for `window` in `format`. Returning fewer samples
    /// than `window.frames * channels` is allowed, the remainder is silence.
    fn produce(&mut self, window: Window, format: StreamFormat) -> Result<Vec<f32>, SourceError>;

    /// Reposition the source before the next window at `position`.
    fn seek(&mut self, _position: u64) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Plays decoded audio placed on the timeline at `offset`.
///
/// The source is random access: each window is read at its own position, so
/// skipped (muted) windows never desynchronise it.
#[derive(Debug, Clone)]
pub struct SampleSource {
    audio: AudioArc,
    offset: u64,
    looping: bool,
}

impl SampleSource {
    pub fn new(audio: AudioArc) -> Self {
        Self {
            audio,
            offset: 0,
            looping: false,
        }
    }

    /// Start playing `offset` frames into the timeline.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn audio(&self) -> &AudioArc {
        &self.audio
    }

    fn end(&self) -> u64 {
        self.offset + self.audio.frames() as u64
    }
}

impl BufferSource for SampleSource {
    fn produce(&mut self, window: Window, format: StreamFormat) -> Result<Vec<f32>, SourceError> {
        if self.audio.sample_rate() != format.sample_rate {
            return Err(SourceError::Decode(format!(
                "source is {} Hz, stream is {} Hz",
                self.audio.sample_rate(),
                format.sample_rate
            )));
        }

        let total_frames = self.audio.frames() as u64;
        if total_frames == 0 || (!self.looping && window.start >= self.end()) {
            return Err(SourceError::Exhausted);
        }

        let channels = format.channels as usize;
        let mut samples = vec![0.0; format.samples_for(window.frames)];

        for (i, frame) in samples.chunks_exact_mut(channels).enumerate() {
            let position = window.start + i as u64;
            if position < self.offset {
                continue;
            }

            let mut relative = position - self.offset;
            if self.looping {
                relative %= total_frames;
            } else if relative >= total_frames {
                break;
            }

            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = self.audio.sample_for(relative as usize, ch);
            }
        }

        Ok(samples)
    }
}
