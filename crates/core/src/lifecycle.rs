use std::fmt;

use aixel_transport::TrackState;

/// Lifecycle of an orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    SettingUp,
    Ready,
    Playing,
    Paused,
    TearingDown,
    Faulted,
}

/// Commands accepted by the orchestrator, used for validation and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Setup,
    Play,
    Pause,
    Stop,
    Seek,
    Teardown,
    AddTrack,
    RemoveTrack,
    SetGain,
    SetMute,
    SetSolo,
}

impl LifecycleState {
    /// Transition table: whether `command` may be issued in this state.
    pub fn accepts(self, command: CommandKind) -> bool {
        use LifecycleState::*;

        match command {
            CommandKind::Setup => self == Idle,
            CommandKind::Play => matches!(self, Ready | Paused),
            CommandKind::Pause => self == Playing,
            CommandKind::Stop => matches!(self, Ready | Playing | Paused),
            CommandKind::Seek => self == Ready,
            CommandKind::Teardown => self != TearingDown,
            CommandKind::AddTrack
            | CommandKind::RemoveTrack
            | CommandKind::SetGain
            | CommandKind::SetMute
            | CommandKind::SetSolo => !matches!(self, TearingDown | Faulted),
        }
    }

    /// A device fault faults the session from any state but `TearingDown`.
    pub fn accepts_fault(self) -> bool {
        self != LifecycleState::TearingDown
    }

    /// Track nodes are attached to the engine in these states.
    pub fn is_engine_live(self) -> bool {
        matches!(
            self,
            LifecycleState::Ready | LifecycleState::Playing | LifecycleState::Paused
        )
    }

    /// State a healthy track takes while the session is in this state.
    pub fn track_state(self) -> TrackState {
        match self {
            LifecycleState::Playing => TrackState::Playing,
            LifecycleState::Ready | LifecycleState::Paused => TrackState::Scheduled,
            LifecycleState::Idle
            | LifecycleState::SettingUp
            | LifecycleState::TearingDown
            | LifecycleState::Faulted => TrackState::Loaded,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::SettingUp => "setting up",
            LifecycleState::Ready => "ready",
            LifecycleState::Playing => "playing",
            LifecycleState::Paused => "paused",
            LifecycleState::TearingDown => "tearing down",
            LifecycleState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Setup => "setup",
            CommandKind::Play => "play",
            CommandKind::Pause => "pause",
            CommandKind::Stop => "stop",
            CommandKind::Seek => "seek",
            CommandKind::Teardown => "teardown",
            CommandKind::AddTrack => "add track",
            CommandKind::RemoveTrack => "remove track",
            CommandKind::SetGain => "set gain",
            CommandKind::SetMute => "set mute",
            CommandKind::SetSolo => "set solo",
        };
        f.write_str(name)
    }
}
