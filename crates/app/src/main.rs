mod cli;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aixel_core::{
    AudioEngineAdapter, CpalEngine, Event, LifecycleState, OrchestrationManager, OrchestratorConfig,
    Snapshot, TimeContext, Track, TrackState,
};
use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{BounceArgs, Cli, Mode, PlayArgs, StemArgs};

const POLL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;
    match cli.mode {
        Mode::Play(args) => play(args, config),
        Mode::Bounce(args) => bounce(args, config),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .ok();
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display())),
        None => Ok(OrchestratorConfig::load()),
    }
}

fn build_tracks(stems: &StemArgs, sample_rate: u32) -> Result<Vec<Track>> {
    stems
        .files
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let source = aixel_decode::load_stem(path, sample_rate)
                .with_context(|| format!("load stem {}", path.display()))?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("track {index}"));

            Ok(Track::new(name, source)
                .with_gain(stems.gain.get(index).copied().unwrap_or(1.0))
                .soloed(stems.solo.contains(&index))
                .muted(stems.mute.contains(&index)))
        })
        .collect()
}

fn play(args: PlayArgs, config: OrchestratorConfig) -> Result<()> {
    let engine = Arc::new(CpalEngine::new()?);
    let format = engine.format();
    info!(sample_rate = format.sample_rate, channels = format.channels, "output device");

    let tracks = build_tracks(&args.stems, format.sample_rate)?;
    let time = config.time_context(format.sample_rate);
    let settle_timeout = config.command_timeout();

    let manager = OrchestrationManager::new(engine, config)?;
    let events = manager.subscribe();
    let logger = thread::Builder::new()
        .name("aixel-events".into())
        .spawn(move || log_events(events, time))?;

    for track in tracks {
        manager.add_track(track)?;
    }

    manager.setup()?;
    let state = manager.settle(settle_timeout)?;
    if state != LifecycleState::Ready {
        anyhow::bail!("audio engine did not come up (session is {state})");
    }
    manager.play()?;

    let deadline = args
        .seconds
        .map(|seconds| Instant::now() + Duration::from_secs_f64(seconds));
    loop {
        thread::sleep(POLL);
        let snapshot = manager.snapshot();

        if snapshot.lifecycle == LifecycleState::Faulted {
            warn!("session faulted, stopping");
            break;
        }
        if audible_stems_finished(&snapshot) {
            info!("all stems finished");
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
    }

    manager.teardown()?;
    manager.settle(settle_timeout)?;
    drop(manager);

    if logger.join().is_err() {
        warn!("event logger panicked");
    }
    Ok(())
}

/// Muted and solo-silenced stems are never produced, so they never stop on
/// their own and do not hold playback open.
fn audible_stems_finished(snapshot: &Snapshot) -> bool {
    snapshot
        .tracks
        .iter()
        .filter(|track| !track.effective_mute)
        .all(|track| track.state == TrackState::Stopped)
}

fn bounce(args: BounceArgs, config: OrchestratorConfig) -> Result<()> {
    let tracks = build_tracks(&args.stems, config.sample_rate)?;
    let frames = (args.seconds.max(0.0) * config.sample_rate as f64).round() as u64;

    let mix = aixel_render::bounce(tracks, &config, frames)?;
    aixel_render::write_wav(&mix, &args.out)
        .with_context(|| format!("write {}", args.out.display()))?;

    info!(path = %args.out.display(), frames = mix.frames(), "wrote mix");
    Ok(())
}

/// Logs session events until the manager goes away.
fn log_events(events: Receiver<Event>, time: TimeContext) {
    let mut last_bar = 0;
    for event in events {
        match event {
            Event::StateChanged { from, to } => info!(%from, %to, "session"),
            Event::Position { frames } => {
                let position = time.position_at(frames);
                if position.bar != last_bar {
                    last_bar = position.bar;
                    info!(%position, "bar");
                }
            }
            Event::TrackFault { id, error } => warn!(track = %id, %error, "track stopped"),
            Event::Fault(fault) => error!(?fault, "session fault"),
            other => debug!(?other, "event"),
        }
    }
}
