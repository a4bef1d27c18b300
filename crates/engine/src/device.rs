use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use aixel_transport::{DeviceFault, NodeBuffer, NodeHandle, StreamFormat, Timestamp, Window};
use basedrop::{Collector, Handle, Owned};
use cpal::{
    FromSample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{AudioEngineAdapter, EngineError, mix_attached};

const DEFAULT_QUEUE_BLOCKS: usize = 16;
const FAULT_CAPACITY: usize = 16;

/// A mixed block waiting to be rendered. The samples are `Owned` so the
/// callback can drop a finished block without freeing on the audio thread.
struct Block {
    at: u64,
    epoch: u64,
    samples: Owned<Vec<f32>>,
}

/// State shared between the adapter and the stream callback.
#[derive(Default)]
struct DeviceShared {
    device_time: AtomicU64,
    flush_epoch: AtomicU64,
    armed: AtomicBool,
}

struct DeviceThread {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Output adapter on top of the default `cpal` device.
///
/// `cpal::Stream` is not `Send`, so the stream lives on its own thread for the
/// lifetime of a session; the adapter talks to it through an `rtrb` ring of
/// pre-mixed blocks and a handful of atomics.
pub struct CpalEngine {
    format: StreamFormat,
    queue_blocks: usize,
    shared: Arc<DeviceShared>,
    thread: Mutex<Option<DeviceThread>>,
    producer: Mutex<Option<rtrb::Producer<Block>>>,
    collector: Mutex<Collector>,
    handle: Handle,
    attached: Mutex<Vec<NodeHandle>>,
    faults_tx: Sender<DeviceFault>,
    faults_rx: Receiver<DeviceFault>,
}

impl CpalEngine {
    /// Probe the default output device for its native format.
    pub fn new() -> Result<Self, EngineError> {
        Self::with_queue_blocks(DEFAULT_QUEUE_BLOCKS)
    }

    pub fn with_queue_blocks(queue_blocks: usize) -> Result<Self, EngineError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(EngineError::NoOutputDevice)?;
        let config = device
            .default_output_config()
            .map_err(|err| EngineError::Device(err.to_string()))?;
        let format = StreamFormat::new(config.sample_rate().0, config.channels());

        let collector = Collector::new();
        let handle = collector.handle();
        let (faults_tx, faults_rx) = crossbeam_channel::bounded(FAULT_CAPACITY);

        Ok(Self {
            format,
            queue_blocks: queue_blocks.max(2),
            shared: Arc::new(DeviceShared::default()),
            thread: Mutex::new(None),
            producer: Mutex::new(None),
            collector: Mutex::new(collector),
            handle,
            attached: Mutex::new(Vec::new()),
            faults_tx,
            faults_rx,
        })
    }
}

impl AudioEngineAdapter for CpalEngine {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn start(&self) -> Result<(), EngineError> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Ok(());
        }

        let (producer, consumer) = rtrb::RingBuffer::<Block>::new(self.queue_blocks);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        self.shared.device_time.store(0, Ordering::Release);
        self.shared.armed.store(false, Ordering::Release);

        let format = self.format;
        let shared = self.shared.clone();
        let faults = self.faults_tx.clone();

        let join = thread::Builder::new()
            .name("aixel-device".into())
            .spawn(move || {
                let stream = match open_stream(format, consumer, shared, faults) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Park until stop() so the stream stays alive on this thread
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|err| EngineError::ThreadSpawn(err.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = join.join();
                return Err(err);
            }
            Err(_) => {
                let _ = join.join();
                return Err(EngineError::Device("device thread exited during start".into()));
            }
        }

        *self.producer.lock() = Some(producer);
        *thread_slot = Some(DeviceThread { stop_tx, join });
        info!(
            sample_rate = self.format.sample_rate,
            channels = self.format.channels,
            "output stream started"
        );
        Ok(())
    }

    fn stop(&self) {
        let thread = self.thread.lock().take();
        *self.producer.lock() = None;
        self.shared.armed.store(false, Ordering::Release);

        if let Some(thread) = thread {
            let _ = thread.stop_tx.send(());
            if thread.join.join().is_err() {
                warn!("device thread panicked");
            }
            info!("output stream stopped");
        }
        self.collector.lock().collect();
    }

    fn flush(&self) {
        self.shared.armed.store(false, Ordering::Release);
        let epoch = self.shared.flush_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(epoch, "flushed queued output");
    }

    fn attach(&self, node: NodeHandle) {
        let mut attached = self.attached.lock();
        if !attached.contains(&node) {
            attached.push(node);
        }
    }

    fn detach(&self, node: NodeHandle) {
        self.attached.lock().retain(|n| *n != node);
    }

    fn current_device_time(&self) -> Timestamp {
        Timestamp(self.shared.device_time.load(Ordering::Acquire))
    }

    fn submit(&self, buffers: Vec<NodeBuffer>, at: Window) -> Result<(), EngineError> {
        let mut producer = self.producer.lock();
        let producer = producer.as_mut().ok_or(EngineError::NotRunning)?;

        let mix = {
            let attached = self.attached.lock();
            mix_attached(&buffers, &attached, self.format.samples_for(at.frames))
        };
        let block = Block {
            at: at.start,
            epoch: self.shared.flush_epoch.load(Ordering::Acquire),
            samples: Owned::new(&self.handle, mix),
        };
        producer.push(block).map_err(|_| EngineError::QueueFull)?;
        self.shared.armed.store(true, Ordering::Release);

        self.collector.lock().collect();
        Ok(())
    }

    fn faults(&self) -> Receiver<DeviceFault> {
        self.faults_rx.clone()
    }
}

impl Drop for CpalEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream(
    format: StreamFormat,
    consumer: rtrb::Consumer<Block>,
    shared: Arc<DeviceShared>,
    faults: Sender<DeviceFault>,
) -> Result<cpal::Stream, EngineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(EngineError::NoOutputDevice)?;
    let supported = device
        .default_output_config()
        .map_err(|err| EngineError::Device(err.to_string()))?;

    if supported.channels() != format.channels || supported.sample_rate().0 != format.sample_rate {
        return Err(EngineError::UnsupportedFormat(format!(
            "device changed to {} Hz / {} channels",
            supported.sample_rate().0,
            supported.channels()
        )));
    }

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer, shared, faults)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, shared, faults)?,
        sample_format => {
            return Err(EngineError::UnsupportedFormat(format!(
                "sample format '{sample_format}'"
            )));
        }
    };

    stream
        .play()
        .map_err(|err| EngineError::Device(err.to_string()))?;
    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    consumer: rtrb::Consumer<Block>,
    shared: Arc<DeviceShared>,
    faults: Sender<DeviceFault>,
) -> Result<cpal::Stream, EngineError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut playback = Playback {
        consumer,
        current: None,
        cursor: 0,
        clock: 0,
        starving: false,
    };

    let error_faults = faults.clone();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                playback.render(data, channels, &shared, &faults);
            },
            move |err| {
                warn!(%err, "output stream error");
                let _ = error_faults.try_send(DeviceFault::DeviceLost);
            },
            None,
        )
        .map_err(|err| EngineError::Device(err.to_string()))
}

/// Callback-side playback cursor. Lives inside the stream closure.
struct Playback {
    consumer: rtrb::Consumer<Block>,
    current: Option<Block>,
    cursor: usize,
    clock: u64,
    starving: bool,
}

impl Playback {
    fn render<T>(
        &mut self,
        data: &mut [T],
        channels: usize,
        shared: &DeviceShared,
        faults: &Sender<DeviceFault>,
    ) where
        T: SizedSample + FromSample<f32>,
    {
        let epoch = shared.flush_epoch.load(Ordering::Acquire);
        if self.current.as_ref().is_some_and(|block| block.epoch != epoch) {
            self.current = None;
        }

        for frame in data.chunks_mut(channels) {
            if self.current.is_none() {
                self.current = self.next_block(channels, epoch);
            }

            let mut finished = false;
            match self.current.as_ref() {
                Some(block) if block.at <= self.clock => {
                    for (ch, out) in frame.iter_mut().enumerate() {
                        *out = T::from_sample(block.samples[self.cursor + ch]);
                    }
                    self.cursor += channels;
                    finished = self.cursor >= block.samples.len();
                }
                Some(_) => silence(frame),
                None => {
                    silence(frame);
                    if shared.armed.load(Ordering::Acquire) && !self.starving {
                        self.starving = true;
                        let _ = faults.try_send(DeviceFault::Underrun);
                    }
                }
            }
            if finished {
                self.current = None;
                self.cursor = 0;
            }

            self.clock += 1;
        }

        shared.device_time.store(self.clock, Ordering::Release);
    }

    fn next_block(&mut self, channels: usize, epoch: u64) -> Option<Block> {
        while let Ok(block) = self.consumer.pop() {
            if block.epoch != epoch {
                continue;
            }
            // Skip whatever part of the block is already in the past
            let late = self.clock.saturating_sub(block.at) as usize * channels;
            if late < block.samples.len() {
                self.cursor = late;
                self.starving = false;
                return Some(block);
            }
        }
        None
    }
}

fn silence<T: SizedSample + FromSample<f32>>(frame: &mut [T]) {
    for sample in frame.iter_mut() {
        *sample = T::from_sample(0.0);
    }
}
