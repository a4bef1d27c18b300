//! Orchestration core: tracks, lookahead scheduling and the session
//! lifecycle on top of an [`AudioEngineAdapter`](aixel_engine::AudioEngineAdapter).

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod orchestrator;
mod realtime;
pub mod scheduler;
pub mod time;
pub mod track;

pub use config::OrchestratorConfig;
pub use error::{ConfigError, OrchestrationError, Result};
pub use events::{Event, EventHub, FaultNotification, Snapshot, SnapshotReader, TrackSnapshot};
pub use lifecycle::{CommandKind, LifecycleState};
pub use manager::OrchestrationManager;
pub use orchestrator::{Interrupt, Orchestrator, StepOutcome};
pub use scheduler::Scheduler;
pub use time::{MusicalPosition, TimeContext, TimeSignature};
pub use track::{Track, TrackParams};

pub use aixel_engine::{AudioEngineAdapter, CpalEngine, EngineError, OfflineEngine};
pub use aixel_transport::{
    AudioArc, AudioBuffer, BufferSource, DeviceFault, PPQN, SampleSource, SourceError,
    StreamFormat, Timestamp, TrackId, TrackState, Window,
};
