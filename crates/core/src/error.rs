use aixel_engine::EngineError;
use aixel_transport::TrackId;

use crate::lifecycle::{CommandKind, LifecycleState};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestrationError {
    #[error("cannot {command} while {state}")]
    InvalidState {
        command: CommandKind,
        state: LifecycleState,
    },

    #[error("track {0} not found")]
    NotFound(TrackId),

    #[error("track {0} is already registered")]
    DuplicateTrack(TrackId),

    #[error("track limit of {limit} reached")]
    TooManyTracks { limit: usize },

    #[error("gain {0} is outside 0.0..=1.0")]
    InvalidGain(f32),

    #[error("audio engine failed to start: {0}")]
    EngineStart(#[source] EngineError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to spawn timing loop: {0}")]
    Spawn(String),

    #[error("timing loop has exited")]
    Disconnected,

    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u128 },
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
