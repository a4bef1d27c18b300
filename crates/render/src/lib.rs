use std::path::Path;
use std::sync::Arc;

use aixel_core::{Orchestrator, OrchestratorConfig, StepOutcome, Track};
use aixel_engine::OfflineEngine;
use aixel_transport::{AudioBuffer, StreamFormat, TrackState};
use tracing::info;

/// Mix `tracks` offline through the same orchestrator the live host uses.
///
/// Rendering stops after `max_frames`, or earlier once every track's source
/// is exhausted. The result is trimmed to the frames actually rendered.
pub fn bounce(tracks: Vec<Track>, config: &OrchestratorConfig, max_frames: u64) -> anyhow::Result<AudioBuffer> {
    if tracks.is_empty() {
        anyhow::bail!("nothing to bounce");
    }

    let format = StreamFormat::new(config.sample_rate, config.channels);
    let engine = OfflineEngine::new(format);
    let mut orchestrator = Orchestrator::new(Arc::new(engine.clone()), config.clone());

    for track in tracks {
        orchestrator.add_track(track)?;
    }
    orchestrator.setup()?;
    orchestrator.play()?;

    let mut rendered = 0u64;
    while rendered < max_frames {
        match orchestrator.step()? {
            StepOutcome::Submitted { at, .. } => {
                engine.advance(at.frames);
                rendered += at.frames;
            }
            outcome => anyhow::bail!("bounce interrupted: {outcome:?}"),
        }

        // Silenced tracks are never produced and never run out
        let exhausted = orchestrator
            .snapshot()
            .tracks
            .iter()
            .filter(|track| !track.effective_mute)
            .all(|track| track.state == TrackState::Stopped);
        if exhausted {
            break;
        }
    }
    orchestrator.teardown()?;

    let mut mix = engine.take_mix();
    let frames = rendered.min(max_frames);
    mix.samples.truncate(format.samples_for(frames));
    info!(
        frames,
        seconds = format.frames_to_secs(frames),
        "bounce complete"
    );
    Ok(mix)
}

pub fn write_wav(buffer: &AudioBuffer, path: &Path) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: buffer.channels,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;

    for &sample in &buffer.samples {
        writer.write_sample(sample)?;
    }

    writer.finalize()?;
    Ok(())
}
