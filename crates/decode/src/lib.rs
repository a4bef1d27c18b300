use std::fs::File;
use std::path::Path;

use aixel_transport::{AudioArc, AudioBuffer, SampleSource};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Decode the default track of an audio file into interleaved f32 samples.
pub fn decode_file(path: &Path) -> anyhow::Result<AudioBuffer> {
    let file = File::open(path)
        .map_err(|err| anyhow::anyhow!("cannot open {}: {err}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default track in {}", path.display()))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow::anyhow!("unknown sample rate in {}", path.display()))?;
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2) as u16;
    let track_id = track.id;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    let mut skipped = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt packet costs its own samples, not the whole stem
            Err(SymphoniaError::DecodeError(message)) => {
                skipped += 1;
                debug!(message, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        let duration = decoded.capacity() as u64;

        let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "stem decoded with corrupt packets");
    }

    Ok(AudioBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode `path` and resample it to `sample_rate`, ready to become a track.
pub fn load_audio(path: &Path, sample_rate: u32) -> anyhow::Result<AudioArc> {
    let audio = AudioArc::from_audio_buffer(decode_file(path)?);
    if audio.sample_rate() == sample_rate {
        return Ok(audio);
    }

    debug!(
        path = %path.display(),
        from = audio.sample_rate(),
        to = sample_rate,
        "resampling stem"
    );
    audio.resample(sample_rate)
}

/// A track source playing the file at `path` once from the start.
pub fn load_stem(path: &Path, sample_rate: u32) -> anyhow::Result<SampleSource> {
    Ok(SampleSource::new(load_audio(path, sample_rate)?))
}
