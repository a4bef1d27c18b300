//! Audio engine adapters.
//!
//! The orchestrator never talks to a device directly. It drives an
//! [`AudioEngineAdapter`], which owns the device session, keeps the set of
//! attached nodes, exposes a monotonic device clock and accepts mixed-down
//! buffers for a device window. Faults are delivered asynchronously on a
//! channel.

mod device;
mod offline;

pub use device::CpalEngine;
pub use offline::{OfflineEngine, Submission};

use aixel_transport::{DeviceFault, NodeBuffer, NodeHandle, StreamFormat, Timestamp, Window};
use crossbeam_channel::Receiver;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("no output device found")]
    NoOutputDevice,

    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("engine is not running")]
    NotRunning,

    #[error("submission queue is full")]
    QueueFull,

    #[error("failed to spawn device thread: {0}")]
    ThreadSpawn(String),
}

/// Capability surface of the external audio engine.
///
/// All methods take `&self`; implementations synchronise internally so the
/// adapter can be shared between the host and the timing loop.
pub trait AudioEngineAdapter: Send + Sync {
    /// Format buffers must be produced in.
    fn format(&self) -> StreamFormat;

    /// Open the device and start the output stream. Starting a running
    /// engine is a no-op.
    fn start(&self) -> Result<(), EngineError>;

    /// Stop the output stream and release the device.
    fn stop(&self);

    /// Drop every queued buffer that has not been rendered yet.
    fn flush(&self);

    fn attach(&self, node: NodeHandle);

    fn detach(&self, node: NodeHandle);

    /// Frames rendered by the device since it was started.
    fn current_device_time(&self) -> Timestamp;

    /// Queue `buffers` to be mixed in order and played during the device
    /// window `at`. Buffers for nodes that are not attached are ignored.
    fn submit(&self, buffers: Vec<NodeBuffer>, at: Window) -> Result<(), EngineError>;

    /// Channel carrying device faults. Every clone receives from the same
    /// queue, so each fault is delivered once.
    fn faults(&self) -> Receiver<DeviceFault>;
}

/// Sum `buffers` for attached nodes into one interleaved block of `len`
/// samples, in the order given.
pub(crate) fn mix_attached(buffers: &[NodeBuffer], attached: &[NodeHandle], len: usize) -> Vec<f32> {
    let mut mix = vec![0.0f32; len];
    for buffer in buffers {
        if !attached.contains(&buffer.node) {
            tracing::debug!(node = buffer.node.0, "dropping buffer for detached node");
            continue;
        }
        for (out, sample) in mix.iter_mut().zip(&buffer.samples) {
            *out += *sample;
        }
    }
    mix
}
