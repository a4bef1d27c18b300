//! Drives the default output device directly through the adapter: a sine
//! tone is queued one window ahead of the device clock for two seconds.

use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use aixel_engine::{AudioEngineAdapter, CpalEngine};
use aixel_transport::{NodeBuffer, NodeHandle, Window};

const WINDOW_FRAMES: u64 = 1024;

fn main() -> anyhow::Result<()> {
    let engine = CpalEngine::new()?;
    let format = engine.format();
    println!("Output format: {format:?}");

    let node = NodeHandle(1);
    engine.start()?;
    engine.attach(node);

    let channels = format.channels as usize;
    let step = TAU * 440.0 / format.sample_rate as f32;
    let mut scheduled_until = 0u64;
    let deadline = Instant::now() + Duration::from_secs(2);

    while Instant::now() < deadline {
        let now = engine.current_device_time().0;
        if scheduled_until > now + WINDOW_FRAMES {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        }

        let at = Window::new(scheduled_until.max(now), WINDOW_FRAMES);
        let mut samples = Vec::with_capacity(format.samples_for(WINDOW_FRAMES));
        for frame in at.start..at.end() {
            let value = (frame as f32 * step).sin() * 0.2;
            samples.extend(std::iter::repeat_n(value, channels));
        }

        engine.submit(vec![NodeBuffer { node, samples }], at)?;
        scheduled_until = at.end();
    }

    while let Ok(fault) = engine.faults().try_recv() {
        println!("fault: {fault}");
    }

    engine.detach(node);
    engine.stop();
    Ok(())
}
