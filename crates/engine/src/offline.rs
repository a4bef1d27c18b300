use std::sync::Arc;

use aixel_transport::{
    AudioBuffer, DeviceFault, NodeBuffer, NodeHandle, StreamFormat, Timestamp, Window,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::{AudioEngineAdapter, EngineError, mix_attached};

/// One `submit` call as seen by the offline device.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub at: Window,
    pub buffers: Vec<NodeBuffer>,
}

impl Submission {
    pub fn nodes(&self) -> Vec<NodeHandle> {
        self.buffers.iter().map(|buffer| buffer.node).collect()
    }
}

#[derive(Default)]
struct OfflineState {
    running: bool,
    clock: u64,
    attached: Vec<NodeHandle>,
    submissions: Vec<Submission>,
    start_failure: Option<String>,
    mix: Vec<f32>,
    starts: usize,
    stops: usize,
    flushes: usize,
}

/// A virtual device with a manually driven clock.
///
/// Every submission is recorded and mixed into an output buffer, which makes
/// the adapter usable both as a test double and for offline bounces. Clones
/// share the same device.
#[derive(Clone)]
pub struct OfflineEngine {
    format: StreamFormat,
    state: Arc<Mutex<OfflineState>>,
    faults_tx: Sender<DeviceFault>,
    faults_rx: Receiver<DeviceFault>,
}

impl OfflineEngine {
    pub fn new(format: StreamFormat) -> Self {
        let (faults_tx, faults_rx) = crossbeam_channel::unbounded();
        Self {
            format,
            state: Arc::new(Mutex::new(OfflineState::default())),
            faults_tx,
            faults_rx,
        }
    }

    /// Make the next `start()` fail with `message`.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        self.state.lock().start_failure = Some(message.into());
    }

    /// Move the device clock forward, as if `frames` had been rendered.
    pub fn advance(&self, frames: u64) {
        self.state.lock().clock += frames;
    }

    pub fn inject_fault(&self, fault: DeviceFault) {
        let _ = self.faults_tx.send(fault);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn attached(&self) -> Vec<NodeHandle> {
        self.state.lock().attached.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    /// Everything submitted so far, mixed at device positions.
    pub fn take_mix(&self) -> AudioBuffer {
        let samples = std::mem::take(&mut self.state.lock().mix);
        AudioBuffer {
            samples,
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
        }
    }
}

impl AudioEngineAdapter for OfflineEngine {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if let Some(message) = state.start_failure.take() {
            return Err(EngineError::Device(message));
        }
        if !state.running {
            state.running = true;
            state.clock = 0;
            state.starts += 1;
        }
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.running {
            state.running = false;
            state.stops += 1;
        }
    }

    fn flush(&self) {
        self.state.lock().flushes += 1;
    }

    fn attach(&self, node: NodeHandle) {
        let mut state = self.state.lock();
        if !state.attached.contains(&node) {
            state.attached.push(node);
        }
    }

    fn detach(&self, node: NodeHandle) {
        self.state.lock().attached.retain(|n| *n != node);
    }

    fn current_device_time(&self) -> Timestamp {
        Timestamp(self.state.lock().clock)
    }

    fn submit(&self, buffers: Vec<NodeBuffer>, at: Window) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(EngineError::NotRunning);
        }

        let channels = self.format.channels as usize;
        let block = mix_attached(&buffers, &state.attached, self.format.samples_for(at.frames));
        let offset = at.start as usize * channels;
        if state.mix.len() < offset + block.len() {
            state.mix.resize(offset + block.len(), 0.0);
        }
        for (out, sample) in state.mix[offset..].iter_mut().zip(&block) {
            *out += *sample;
        }

        debug!(start = at.start, frames = at.frames, nodes = buffers.len(), "offline submit");
        state.submissions.push(Submission { at, buffers });
        Ok(())
    }

    fn faults(&self) -> Receiver<DeviceFault> {
        self.faults_rx.clone()
    }
}
