use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aixel_engine::AudioEngineAdapter;
use aixel_transport::{DeviceFault, SourceError, StreamFormat, TrackId, TrackState, Window};
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result};
use crate::events::{Event, EventHub, FaultNotification, Snapshot, SnapshotReader, TrackSnapshot};
use crate::lifecycle::{CommandKind, LifecycleState};
use crate::scheduler::Scheduler;
use crate::time::MusicalPosition;
use crate::track::{Track, TrackList, TrackParams, validate_gain};

/// Epoch counter shared between command senders and the scheduling step.
///
/// Raising it invalidates any window currently being produced.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicU64>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn raise(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// What a call to [`Orchestrator::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Not playing; nothing was produced.
    Idle,
    /// A halt or fault arrived while the window was being produced. Nothing
    /// was submitted and the clock did not move.
    Discarded { window: Window },
    Submitted { window: Window, at: Window },
}

/// The orchestration state machine.
///
/// Single writer of the track list, the lifecycle state and the playback
/// clock. It does no threading of its own: [`OrchestrationManager`] runs one
/// on a timing thread, while tests and offline renders call [`step`] directly.
///
/// [`OrchestrationManager`]: crate::OrchestrationManager
/// [`step`]: Orchestrator::step
pub struct Orchestrator {
    engine: Arc<dyn AudioEngineAdapter>,
    config: OrchestratorConfig,
    format: StreamFormat,
    lifecycle: LifecycleState,
    tracks: TrackList,
    scheduler: Scheduler,
    faults: Receiver<DeviceFault>,
    events: Arc<EventHub>,
    snapshot: SnapshotReader,
    interrupt: Interrupt,
    engine_started: bool,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn AudioEngineAdapter>, config: OrchestratorConfig) -> Self {
        let format = engine.format();
        let faults = engine.faults();
        let orchestrator = Self {
            scheduler: Scheduler::new(config.window_frames),
            events: Arc::new(EventHub::with_capacity(config.event_capacity)),
            engine,
            config,
            format,
            lifecycle: LifecycleState::Idle,
            tracks: TrackList::default(),
            faults,
            snapshot: SnapshotReader::default(),
            interrupt: Interrupt::new(),
            engine_started: false,
        };
        orchestrator.publish();
        orchestrator
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn clock_position(&self) -> u64 {
        self.scheduler.clock()
    }

    pub fn musical_position(&self) -> MusicalPosition {
        self.config
            .time_context(self.format.sample_rate)
            .position_at(self.scheduler.clock())
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|slot| slot.id).collect()
    }

    pub fn track_state(&self, id: TrackId) -> Option<TrackState> {
        self.tracks.get(id).map(|slot| slot.state)
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.get()
    }

    /// Reader that stays valid after the orchestrator moves to another thread.
    pub fn observer(&self) -> SnapshotReader {
        self.snapshot.clone()
    }

    pub fn events(&self) -> Arc<EventHub> {
        self.events.clone()
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    pub fn fault_receiver(&self) -> Receiver<DeviceFault> {
        self.faults.clone()
    }

    fn ensure(&self, command: CommandKind) -> Result<()> {
        if self.lifecycle.accepts(command) {
            Ok(())
        } else {
            Err(OrchestrationError::InvalidState {
                command,
                state: self.lifecycle,
            })
        }
    }

    pub fn setup(&mut self) -> Result<()> {
        self.begin_setup()?;
        self.complete_setup()
    }

    /// Enter `SettingUp`. Clears the clock and rewinds sources.
    ///
    /// Pending device faults are applied first, so a fault raised while idle
    /// rejects the setup.
    pub fn begin_setup(&mut self) -> Result<()> {
        self.poll_faults();
        self.ensure(CommandKind::Setup)?;

        self.scheduler.reset(0);
        let failures = self.reposition(0);
        self.transition(LifecycleState::SettingUp, true);
        self.fail_tracks(failures);
        Ok(())
    }

    /// Start the engine and attach every track.
    pub fn complete_setup(&mut self) -> Result<()> {
        if self.lifecycle != LifecycleState::SettingUp {
            return Ok(());
        }

        if let Err(err) = self.engine.start() {
            warn!(%err, "audio engine failed to start");
            self.events
                .emit(Event::Fault(FaultNotification::EngineStartFailure(err.clone())));
            self.transition(LifecycleState::Faulted, false);
            return Err(OrchestrationError::EngineStart(err));
        }
        self.engine_started = true;

        for slot in self.tracks.iter() {
            self.engine.attach(slot.node());
        }
        self.transition(LifecycleState::Ready, false);
        Ok(())
    }

    pub fn play(&mut self) -> Result<()> {
        self.ensure(CommandKind::Play)?;
        self.transition(LifecycleState::Playing, false);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.ensure(CommandKind::Pause)?;
        self.halt();
        self.transition(LifecycleState::Paused, false);
        Ok(())
    }

    /// Halt playback and return to the start. Nodes stay attached.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure(CommandKind::Stop)?;
        self.halt();
        self.scheduler.reset(0);
        let failures = self.reposition(0);
        self.transition(LifecycleState::Ready, true);
        self.fail_tracks(failures);
        self.events.emit(Event::Position { frames: 0 });
        Ok(())
    }

    pub fn seek(&mut self, frames: u64) -> Result<()> {
        self.ensure(CommandKind::Seek)?;
        self.scheduler.reset(frames);
        let failures = self.reposition(frames);
        self.fail_tracks(failures);
        debug!(frames, "seek");
        self.events.emit(Event::Position { frames });
        Ok(())
    }

    pub fn teardown(&mut self) -> Result<()> {
        self.begin_teardown()?;
        self.complete_teardown();
        Ok(())
    }

    pub fn begin_teardown(&mut self) -> Result<()> {
        self.ensure(CommandKind::Teardown)?;
        self.interrupt.raise();
        self.scheduler.halt();
        self.transition(LifecycleState::TearingDown, false);
        Ok(())
    }

    /// Detach every node, release the device and return to `Idle`.
    pub fn complete_teardown(&mut self) {
        if self.lifecycle != LifecycleState::TearingDown {
            return;
        }

        for slot in self.tracks.iter() {
            self.engine.detach(slot.node());
        }
        if self.engine_started {
            self.engine.flush();
            self.engine.stop();
            self.engine_started = false;
        }

        // Still tearing down: whatever the old device reported is moot
        let dropped = self.faults.try_iter().count();
        if dropped > 0 {
            debug!(dropped, "dropping faults raised before teardown finished");
        }

        self.scheduler.reset(0);
        let failures = self.reposition(0);
        self.transition(LifecycleState::Idle, true);
        self.fail_tracks(failures);
    }

    /// Tear down whatever is still running. Used when the host goes away.
    pub fn shutdown(&mut self) {
        if matches!(
            self.lifecycle,
            LifecycleState::Idle | LifecycleState::TearingDown
        ) {
            self.complete_teardown();
            return;
        }
        if let Err(err) = self.teardown() {
            warn!(%err, "teardown on shutdown failed");
        }
    }

    pub fn add_track(&mut self, track: Track) -> Result<TrackId> {
        self.ensure(CommandKind::AddTrack)?;
        if self.tracks.len() >= self.config.max_tracks {
            return Err(OrchestrationError::TooManyTracks {
                limit: self.config.max_tracks,
            });
        }
        validate_gain(track.params().gain)?;

        let id = self.tracks.insert(track, self.lifecycle.track_state())?;
        if self.lifecycle.is_engine_live() {
            self.engine.attach(id.into());
        }

        let position = self.scheduler.clock();
        let seeked = match self.tracks.get_mut(id) {
            Some(slot) if position > 0 => slot.seek(position),
            _ => Ok(()),
        };

        debug!(track = %id, state = %self.lifecycle, "track added");
        self.events.emit(Event::TrackAdded { id });
        if let Err(error) = seeked {
            self.fail_track(id, error);
        }
        self.publish();
        Ok(id)
    }

    pub fn remove_track(&mut self, id: TrackId) -> Result<()> {
        self.ensure(CommandKind::RemoveTrack)?;
        let slot = self
            .tracks
            .remove(id)
            .ok_or(OrchestrationError::NotFound(id))?;

        if self.lifecycle.is_engine_live() {
            self.engine.detach(slot.node());
        }

        debug!(track = %id, name = %slot.name, "track removed");
        self.events.emit(Event::TrackRemoved { id });
        self.publish();
        Ok(())
    }

    pub fn set_gain(&mut self, id: TrackId, gain: f32) -> Result<()> {
        self.update_params(CommandKind::SetGain, id, |params| {
            params.gain = validate_gain(gain)?;
            Ok(())
        })
    }

    pub fn set_mute(&mut self, id: TrackId, mute: bool) -> Result<()> {
        self.update_params(CommandKind::SetMute, id, |params| {
            params.mute = mute;
            Ok(())
        })
    }

    pub fn set_solo(&mut self, id: TrackId, solo: bool) -> Result<()> {
        self.update_params(CommandKind::SetSolo, id, |params| {
            params.solo = solo;
            Ok(())
        })
    }

    fn update_params(
        &mut self,
        command: CommandKind,
        id: TrackId,
        update: impl FnOnce(&mut TrackParams) -> Result<()>,
    ) -> Result<()> {
        self.ensure(command)?;
        let slot = self
            .tracks
            .get_mut(id)
            .ok_or(OrchestrationError::NotFound(id))?;

        let mut params = slot.params;
        update(&mut params)?;
        slot.params = params;

        debug!(track = %id, gain = params.gain, mute = params.mute, solo = params.solo, "track params changed");
        self.events.emit(Event::TrackParamsChanged { id, params });
        self.publish();
        Ok(())
    }

    /// Apply a device fault. Returns whether it changed the session.
    pub fn handle_fault(&mut self, fault: DeviceFault) -> bool {
        if !self.lifecycle.accepts_fault() {
            warn!(%fault, state = %self.lifecycle, "dropping device fault");
            return false;
        }

        warn!(%fault, state = %self.lifecycle, "device fault");
        self.halt();
        self.events
            .emit(Event::Fault(FaultNotification::Device(fault)));
        if self.lifecycle != LifecycleState::Faulted {
            self.transition(LifecycleState::Faulted, false);
        }
        true
    }

    pub fn poll_faults(&mut self) {
        while let Ok(fault) = self.faults.try_recv() {
            self.handle_fault(fault);
        }
    }

    /// Whether a window should be produced now.
    pub fn is_due(&self) -> bool {
        self.lifecycle == LifecycleState::Playing
            && self.scheduler.is_due(self.engine.current_device_time())
    }

    /// How long the timing loop may wait before the next step.
    pub fn time_until_due(&self) -> Duration {
        let idle = self.config.idle_poll();
        if self.lifecycle != LifecycleState::Playing {
            return idle;
        }
        self.scheduler
            .time_until_due(self.engine.current_device_time(), self.format.sample_rate)
            .min(idle)
    }

    /// Produce and submit one lookahead window.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.lifecycle != LifecycleState::Playing {
            return Ok(StepOutcome::Idle);
        }

        let epoch = self.interrupt.epoch();
        let now = self.engine.current_device_time();
        let (window, at) = self.scheduler.next_windows(now);
        let production = self.scheduler.produce(&mut self.tracks, window, self.format);

        self.poll_faults();
        if self.interrupt.epoch() != epoch || self.lifecycle != LifecycleState::Playing {
            debug!(start = window.start, "discarding interrupted window");
            return Ok(StepOutcome::Discarded { window });
        }

        for (id, error) in production.failures {
            self.fail_track(id, error);
        }

        if let Err(err) = self.engine.submit(production.buffers, at) {
            warn!(%err, "submit failed");
            self.halt();
            self.events
                .emit(Event::Fault(FaultNotification::Engine(err.clone())));
            self.transition(LifecycleState::Faulted, false);
            return Err(err.into());
        }

        self.scheduler.commit(at);
        self.events.emit(Event::Position {
            frames: self.scheduler.clock(),
        });
        self.publish();
        Ok(StepOutcome::Submitted { window, at })
    }

    fn halt(&mut self) {
        self.interrupt.raise();
        self.scheduler.halt();
        if self.engine_started {
            self.engine.flush();
        }
    }

    fn reposition(&mut self, position: u64) -> Vec<(TrackId, SourceError)> {
        self.tracks
            .iter_mut()
            .filter_map(|slot| slot.seek(position).err().map(|err| (slot.id, err)))
            .collect()
    }

    fn fail_tracks(&mut self, failures: Vec<(TrackId, SourceError)>) {
        for (id, error) in failures {
            self.fail_track(id, error);
        }
        self.publish();
    }

    fn fail_track(&mut self, id: TrackId, error: SourceError) {
        let Some(slot) = self.tracks.get_mut(id) else {
            return;
        };
        slot.state = TrackState::Stopped;
        warn!(track = %id, name = %slot.name, %error, "track failed");
        self.events.emit(Event::TrackFault { id, error });
        self.events.emit(Event::TrackStateChanged {
            id,
            state: TrackState::Stopped,
        });
    }

    /// Move to `to` and retarget every track. Stopped tracks keep their
    /// state unless `rearm` is set.
    fn transition(&mut self, to: LifecycleState, rearm: bool) {
        let from = self.lifecycle;
        self.lifecycle = to;

        let target = to.track_state();
        let mut changed = Vec::new();
        for slot in self.tracks.iter_mut() {
            if slot.state == TrackState::Stopped && !rearm {
                continue;
            }
            if slot.state != target {
                slot.state = target;
                changed.push(slot.id);
            }
        }

        info!(%from, %to, "lifecycle");
        self.events.emit(Event::StateChanged { from, to });
        for id in changed {
            self.events.emit(Event::TrackStateChanged { id, state: target });
        }
        self.publish();
    }

    fn publish(&self) {
        let mutes = self.tracks.effective_mutes();
        let tracks = self
            .tracks
            .iter()
            .zip(mutes)
            .map(|(slot, effective_mute)| TrackSnapshot {
                id: slot.id,
                name: slot.name.clone(),
                state: slot.state,
                params: slot.params,
                effective_mute,
            })
            .collect();

        self.snapshot.store(Snapshot {
            lifecycle: self.lifecycle,
            clock_position: self.scheduler.clock(),
            tracks,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aixel_engine::{EngineError, OfflineEngine};
    use aixel_transport::{BufferSource, NodeHandle};
    use parking_lot::Mutex;

    const W: u64 = 4;

    fn fixture() -> (OfflineEngine, Orchestrator) {
        let engine = OfflineEngine::new(StreamFormat::new(48_000, 1));
        let config = OrchestratorConfig {
            window_frames: W as u32,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(Arc::new(engine.clone()), config);
        (engine, orchestrator)
    }

    /// Emits each frame's index as its sample value and records every call.
    #[derive(Clone, Default)]
    struct Ramp {
        windows: Arc<Mutex<Vec<Window>>>,
        seeks: Arc<Mutex<Vec<u64>>>,
    }

    impl BufferSource for Ramp {
        fn produce(&mut self, window: Window, _format: StreamFormat) -> std::result::Result<Vec<f32>, SourceError> {
            self.windows.lock().push(window);
            Ok((window.start..window.end()).map(|f| f as f32).collect())
        }

        fn seek(&mut self, position: u64) -> std::result::Result<(), SourceError> {
            self.seeks.lock().push(position);
            Ok(())
        }
    }

    struct Constant(f32);

    impl BufferSource for Constant {
        fn produce(&mut self, window: Window, format: StreamFormat) -> std::result::Result<Vec<f32>, SourceError> {
            Ok(vec![self.0; format.samples_for(window.frames)])
        }
    }

    /// Fails once `limit` windows have been produced.
    struct FailAfter {
        limit: usize,
        produced: usize,
    }

    impl BufferSource for FailAfter {
        fn produce(&mut self, window: Window, format: StreamFormat) -> std::result::Result<Vec<f32>, SourceError> {
            if self.produced >= self.limit {
                return Err(SourceError::Decode("truncated stream".into()));
            }
            self.produced += 1;
            Ok(vec![0.1; format.samples_for(window.frames)])
        }
    }

    /// Raises the interrupt while producing, as a concurrent halt would.
    struct Interrupting(Interrupt);

    impl BufferSource for Interrupting {
        fn produce(&mut self, window: Window, format: StreamFormat) -> std::result::Result<Vec<f32>, SourceError> {
            self.0.raise();
            Ok(vec![0.0; format.samples_for(window.frames)])
        }
    }

    fn state_changes(events: &Receiver<Event>) -> Vec<(LifecycleState, LifecycleState)> {
        events
            .try_iter()
            .filter_map(|event| match event {
                Event::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_full_lifecycle() {
        use LifecycleState::*;
        let (engine, mut orch) = fixture();
        let events = orch.subscribe();

        orch.setup().unwrap();
        orch.play().unwrap();
        orch.pause().unwrap();
        orch.play().unwrap();
        orch.stop().unwrap();
        orch.teardown().unwrap();

        assert_eq!(
            state_changes(&events),
            vec![
                (Idle, SettingUp),
                (SettingUp, Ready),
                (Ready, Playing),
                (Playing, Paused),
                (Paused, Playing),
                (Playing, Ready),
                (Ready, TearingDown),
                (TearingDown, Idle),
            ]
        );
        assert_eq!(engine.start_count(), 1);
        assert_eq!(engine.stop_count(), 1);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_invalid_commands_change_nothing() {
        let (_engine, mut orch) = fixture();

        assert_eq!(
            orch.play(),
            Err(OrchestrationError::InvalidState {
                command: CommandKind::Play,
                state: LifecycleState::Idle,
            })
        );
        assert!(orch.pause().is_err());
        assert!(orch.stop().is_err());
        assert_eq!(orch.lifecycle(), LifecycleState::Idle);

        orch.add_track(Track::new("ramp", Ramp::default())).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();
        orch.step().unwrap();
        let clock = orch.clock_position();

        assert!(orch.setup().is_err());
        assert!(matches!(
            orch.seek(0),
            Err(OrchestrationError::InvalidState {
                command: CommandKind::Seek,
                state: LifecycleState::Playing,
            })
        ));
        assert!(orch.play().is_err());
        assert_eq!(orch.lifecycle(), LifecycleState::Playing);
        assert_eq!(orch.clock_position(), clock);
    }

    const ALL_COMMANDS: [CommandKind; 11] = [
        CommandKind::Setup,
        CommandKind::Play,
        CommandKind::Pause,
        CommandKind::Stop,
        CommandKind::Seek,
        CommandKind::Teardown,
        CommandKind::AddTrack,
        CommandKind::RemoveTrack,
        CommandKind::SetGain,
        CommandKind::SetMute,
        CommandKind::SetSolo,
    ];

    /// Where a full command lands from `state`, or `None` if it is rejected.
    fn expected_transition(state: LifecycleState, command: CommandKind) -> Option<LifecycleState> {
        use CommandKind as C;
        use LifecycleState::*;

        match (state, command) {
            (TearingDown, _) => None,
            (_, C::Teardown) => Some(Idle),
            (Faulted, _) => None,
            (Idle, C::Setup) => Some(Ready),
            (Ready | Paused, C::Play) => Some(Playing),
            (Playing, C::Pause) => Some(Paused),
            (Ready | Playing | Paused, C::Stop) => Some(Ready),
            (Ready, C::Seek) => Some(Ready),
            (_, C::AddTrack | C::RemoveTrack | C::SetGain | C::SetMute | C::SetSolo) => Some(state),
            _ => None,
        }
    }

    fn issue(orch: &mut Orchestrator, command: CommandKind, id: TrackId) -> Result<()> {
        match command {
            CommandKind::Setup => orch.setup(),
            CommandKind::Play => orch.play(),
            CommandKind::Pause => orch.pause(),
            CommandKind::Stop => orch.stop(),
            CommandKind::Seek => orch.seek(2 * W),
            CommandKind::Teardown => orch.teardown(),
            CommandKind::AddTrack => orch.add_track(Track::new("extra", Constant(0.1))).map(drop),
            CommandKind::RemoveTrack => orch.remove_track(id),
            CommandKind::SetGain => orch.set_gain(id, 0.5),
            CommandKind::SetMute => orch.set_mute(id, true),
            CommandKind::SetSolo => orch.set_solo(id, true),
        }
    }

    /// A session with one track, driven into `state` with a nonzero clock
    /// wherever the state allows one.
    fn session_in(state: LifecycleState) -> (OfflineEngine, Orchestrator, TrackId) {
        use LifecycleState::*;
        let (engine, mut orch) = fixture();
        let id = orch.add_track(Track::new("ramp", Ramp::default())).unwrap();

        match state {
            Idle => {}
            SettingUp => orch.begin_setup().unwrap(),
            Ready => {
                orch.setup().unwrap();
                orch.seek(W).unwrap();
            }
            Playing | Paused | Faulted => {
                orch.setup().unwrap();
                orch.play().unwrap();
                orch.step().unwrap();
                if state == Paused {
                    orch.pause().unwrap();
                }
                if state == Faulted {
                    engine.inject_fault(DeviceFault::DeviceLost);
                    orch.poll_faults();
                }
            }
            TearingDown => {
                orch.setup().unwrap();
                orch.begin_teardown().unwrap();
            }
        }
        assert_eq!(orch.lifecycle(), state);
        (engine, orch, id)
    }

    #[test]
    fn test_every_command_in_every_state() {
        use LifecycleState::*;

        for state in [Idle, SettingUp, Ready, Playing, Paused, TearingDown, Faulted] {
            for command in ALL_COMMANDS {
                let (_engine, mut orch, id) = session_in(state);
                let clock = orch.clock_position();
                let tracks = orch.track_ids();

                let result = issue(&mut orch, command, id);

                match expected_transition(state, command) {
                    Some(to) => {
                        assert_eq!(result, Ok(()), "{command} from {state}");
                        assert_eq!(orch.lifecycle(), to, "{command} from {state}");
                    }
                    None => {
                        assert_eq!(
                            result,
                            Err(OrchestrationError::InvalidState { command, state }),
                            "{command} from {state}"
                        );
                        assert_eq!(orch.lifecycle(), state, "{command} from {state}");
                        assert_eq!(orch.clock_position(), clock, "{command} from {state}");
                        assert_eq!(orch.track_ids(), tracks, "{command} from {state}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_command_sequences_follow_the_transition_table() {
        let (engine, mut orch) = fixture();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = |bound: usize| {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (seed >> 33) as usize % bound
        };

        for round in 0..400 {
            let state = orch.lifecycle();
            let clock = orch.clock_position();

            if next(29) == 0 {
                engine.inject_fault(DeviceFault::Underrun);
                orch.poll_faults();
                assert_eq!(orch.lifecycle(), LifecycleState::Faulted, "round {round}");
                continue;
            }

            let command = ALL_COMMANDS[next(ALL_COMMANDS.len())];
            let id = orch.track_ids().first().copied().unwrap_or(TrackId(0));
            let result = issue(&mut orch, command, id);

            match expected_transition(state, command) {
                Some(to) => {
                    assert!(
                        matches!(result, Ok(()) | Err(OrchestrationError::NotFound(_))),
                        "round {round}: {command} from {state}: {result:?}"
                    );
                    assert_eq!(orch.lifecycle(), to, "round {round}: {command} from {state}");
                }
                None => {
                    assert_eq!(
                        result,
                        Err(OrchestrationError::InvalidState { command, state }),
                        "round {round}"
                    );
                    assert_eq!(orch.lifecycle(), state, "round {round}");
                    assert_eq!(orch.clock_position(), clock, "round {round}");
                }
            }

            if orch.step().unwrap_or(StepOutcome::Idle) != StepOutcome::Idle {
                engine.advance(W);
            }
        }
    }

    #[test]
    fn test_musical_position_follows_device_rate() {
        let engine = OfflineEngine::new(StreamFormat::new(44_100, 1));
        let mut orch = Orchestrator::new(Arc::new(engine), OrchestratorConfig::default());
        orch.setup().unwrap();

        // One bar of 4/4 at 120 BPM is two seconds of device time
        orch.seek(88_200).unwrap();
        assert_eq!(orch.musical_position().to_string(), "2.1.000");
    }

    #[test]
    fn test_largest_explicit_id_is_accepted() {
        let (_engine, mut orch) = fixture();
        let top = orch
            .add_track(Track::new("top", Constant(0.1)).with_id(TrackId(u64::MAX)))
            .unwrap();
        let next = orch.add_track(Track::new("next", Constant(0.1))).unwrap();

        assert_eq!(top, TrackId(u64::MAX));
        assert_eq!(next, TrackId(0));
        assert_eq!(orch.track_ids(), vec![top, next]);
    }

    #[test]
    fn test_steps_advance_clock_by_window() {
        let (engine, mut orch) = fixture();
        let ramp = Ramp::default();
        orch.add_track(Track::new("ramp", ramp.clone())).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();

        for n in 1..=5 {
            let outcome = orch.step().unwrap();
            assert!(matches!(outcome, StepOutcome::Submitted { .. }));
            assert_eq!(orch.clock_position(), n * W);
            engine.advance(W);
        }

        let windows = ramp.windows.lock().clone();
        assert_eq!(windows.len(), 5);
        assert_eq!(windows[0], Window::new(0, W));
        assert!(windows.windows(2).all(|pair| pair[1].follows(&pair[0])));

        let submissions = engine.submissions();
        assert!(submissions.windows(2).all(|pair| pair[1].at.follows(&pair[0].at)));
        assert_eq!(engine.take_mix().samples[..8], [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_submission_order_is_insertion_order() {
        let (engine, mut orch) = fixture();
        for value in [0.1, 0.2, 0.3] {
            orch.add_track(Track::new("c", Constant(value))).unwrap();
        }
        orch.setup().unwrap();
        orch.play().unwrap();
        orch.step().unwrap();

        assert_eq!(
            engine.submissions()[0].nodes(),
            vec![NodeHandle(0), NodeHandle(1), NodeHandle(2)]
        );
    }

    #[test]
    fn test_stop_resets_clock_and_rewinds_sources() {
        let (_engine, mut orch) = fixture();
        let ramp = Ramp::default();
        orch.add_track(Track::new("ramp", ramp.clone())).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();
        orch.step().unwrap();
        orch.step().unwrap();

        orch.stop().unwrap();
        assert_eq!(orch.lifecycle(), LifecycleState::Ready);
        assert_eq!(orch.clock_position(), 0);
        assert_eq!(ramp.seeks.lock().last(), Some(&0));
        assert_eq!(orch.track_state(TrackId(0)), Some(TrackState::Scheduled));
    }

    #[test]
    fn test_pause_freezes_clock_and_flushes() {
        let (engine, mut orch) = fixture();
        orch.add_track(Track::new("c", Constant(0.5))).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();
        orch.step().unwrap();
        let flushes = engine.flush_count();

        orch.pause().unwrap();
        assert_eq!(orch.step().unwrap(), StepOutcome::Idle);
        assert_eq!(orch.clock_position(), W);
        assert_eq!(engine.flush_count(), flushes + 1);

        // Resuming lands the next window at the device's current time
        engine.advance(100);
        orch.play().unwrap();
        let StepOutcome::Submitted { window, at } = orch.step().unwrap() else {
            panic!("expected a submission");
        };
        assert_eq!(window.start, W);
        assert_eq!(at.start, 100);
    }

    #[test]
    fn test_seek_only_from_ready() {
        let (_engine, mut orch) = fixture();
        let ramp = Ramp::default();
        orch.add_track(Track::new("ramp", ramp.clone())).unwrap();
        orch.setup().unwrap();

        orch.seek(96).unwrap();
        assert_eq!(orch.clock_position(), 96);
        assert_eq!(ramp.seeks.lock().last(), Some(&96));

        orch.play().unwrap();
        orch.step().unwrap();
        assert_eq!(ramp.windows.lock()[0], Window::new(96, W));
    }

    #[test]
    fn test_solo_mutes_everything_else() {
        let (engine, mut orch) = fixture();
        let a = orch.add_track(Track::new("a", Constant(0.1))).unwrap();
        let b = orch.add_track(Track::new("b", Constant(0.2)).muted(true)).unwrap();
        let c = orch.add_track(Track::new("c", Constant(0.3))).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();

        orch.set_solo(a, true).unwrap();
        let mutes: Vec<_> = orch.snapshot().tracks.iter().map(|t| t.effective_mute).collect();
        assert_eq!(mutes, vec![false, true, true]);
        orch.step().unwrap();
        assert_eq!(engine.submissions()[0].nodes(), vec![NodeHandle::from(a)]);

        orch.set_solo(a, false).unwrap();
        let snapshot = orch.snapshot();
        assert!(!snapshot.track(a).unwrap().effective_mute);
        assert!(snapshot.track(b).unwrap().effective_mute);
        assert!(!snapshot.track(c).unwrap().effective_mute);
    }

    #[test]
    fn test_gain_is_validated_and_applied() {
        let (engine, mut orch) = fixture();
        let id = orch.add_track(Track::new("c", Constant(1.0))).unwrap();

        assert_eq!(orch.set_gain(id, 1.2), Err(OrchestrationError::InvalidGain(1.2)));
        assert_eq!(orch.set_gain(TrackId(9), 0.5), Err(OrchestrationError::NotFound(TrackId(9))));
        orch.set_gain(id, 0.25).unwrap();

        orch.setup().unwrap();
        orch.play().unwrap();
        orch.step().unwrap();
        assert_eq!(engine.submissions()[0].buffers[0].samples, vec![0.25; W as usize]);
    }

    #[test]
    fn test_failing_track_is_isolated() {
        let (engine, mut orch) = fixture();
        let events = orch.subscribe();
        let bad = orch
            .add_track(Track::new("bad", FailAfter { limit: 1, produced: 0 }))
            .unwrap();
        let good = orch.add_track(Track::new("good", Constant(0.5))).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();

        for _ in 0..4 {
            orch.step().unwrap();
        }

        assert_eq!(orch.lifecycle(), LifecycleState::Playing);
        assert_eq!(orch.track_state(bad), Some(TrackState::Stopped));
        assert_eq!(orch.track_state(good), Some(TrackState::Playing));

        let faults: Vec<_> = events
            .try_iter()
            .filter(|event| matches!(event, Event::TrackFault { .. }))
            .collect();
        assert_eq!(faults.len(), 1);

        let submissions = engine.submissions();
        assert_eq!(submissions.len(), 4);
        assert!(submissions[1..].iter().all(|s| s.nodes() == vec![NodeHandle::from(good)]));

        // Stopped survives pause/play and is re-armed by stop
        orch.pause().unwrap();
        orch.play().unwrap();
        assert_eq!(orch.track_state(bad), Some(TrackState::Stopped));
        orch.stop().unwrap();
        assert_eq!(orch.track_state(bad), Some(TrackState::Scheduled));
    }

    #[test]
    fn test_interrupted_window_is_not_submitted() {
        let (engine, mut orch) = fixture();
        let interrupt = orch.interrupt();
        orch.add_track(Track::new("gate", Interrupting(interrupt))).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();

        let outcome = orch.step().unwrap();
        assert_eq!(outcome, StepOutcome::Discarded { window: Window::new(0, W) });
        assert_eq!(engine.submission_count(), 0);
        assert_eq!(orch.clock_position(), 0);

        orch.teardown().unwrap();
        assert_eq!(orch.lifecycle(), LifecycleState::Idle);
        assert_eq!(engine.submission_count(), 0);
    }

    #[test]
    fn test_device_lost_faults_session() {
        let (engine, mut orch) = fixture();
        let events = orch.subscribe();
        orch.add_track(Track::new("c", Constant(0.5))).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();
        orch.step().unwrap();

        engine.inject_fault(DeviceFault::DeviceLost);
        orch.poll_faults();

        assert_eq!(orch.lifecycle(), LifecycleState::Faulted);
        assert!(events
            .try_iter()
            .any(|e| e == Event::Fault(FaultNotification::Device(DeviceFault::DeviceLost))));
        assert_eq!(
            orch.play(),
            Err(OrchestrationError::InvalidState {
                command: CommandKind::Play,
                state: LifecycleState::Faulted,
            })
        );
        assert!(orch.add_track(Track::new("late", Constant(0.1))).is_err());

        orch.teardown().unwrap();
        assert_eq!(orch.lifecycle(), LifecycleState::Idle);
        assert!(engine.attached().is_empty());

        orch.setup().unwrap();
        assert_eq!(orch.lifecycle(), LifecycleState::Ready);
        assert_eq!(engine.attached(), vec![NodeHandle(0)]);
    }

    #[test]
    fn test_fault_during_production_discards_window() {
        let (engine, mut orch) = fixture();
        orch.add_track(Track::new("c", Constant(0.5))).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();

        engine.inject_fault(DeviceFault::Underrun);
        assert!(matches!(orch.step().unwrap(), StepOutcome::Discarded { .. }));
        assert_eq!(orch.lifecycle(), LifecycleState::Faulted);
        assert_eq!(engine.submission_count(), 0);
    }

    #[test]
    fn test_fault_while_idle_requires_teardown() {
        let (engine, mut orch) = fixture();
        let events = orch.subscribe();
        engine.inject_fault(DeviceFault::Underrun);
        orch.poll_faults();

        assert_eq!(orch.lifecycle(), LifecycleState::Faulted);
        assert_eq!(
            state_changes(&events),
            vec![(LifecycleState::Idle, LifecycleState::Faulted)]
        );
        assert!(orch.setup().is_err());

        orch.teardown().unwrap();
        orch.setup().unwrap();
        assert_eq!(orch.lifecycle(), LifecycleState::Ready);
    }

    #[test]
    fn test_queued_fault_rejects_setup() {
        let (engine, mut orch) = fixture();
        engine.inject_fault(DeviceFault::DeviceLost);

        assert_eq!(
            orch.setup(),
            Err(OrchestrationError::InvalidState {
                command: CommandKind::Setup,
                state: LifecycleState::Faulted,
            })
        );
        assert_eq!(engine.start_count(), 0);
    }

    #[test]
    fn test_repeated_fault_stays_faulted() {
        let (engine, mut orch) = fixture();
        let events = orch.subscribe();
        orch.setup().unwrap();
        engine.inject_fault(DeviceFault::Underrun);
        engine.inject_fault(DeviceFault::DeviceLost);
        orch.poll_faults();

        assert_eq!(orch.lifecycle(), LifecycleState::Faulted);
        let received: Vec<_> = events.try_iter().collect();
        let transitions = received
            .iter()
            .filter(|e| matches!(e, Event::StateChanged { to: LifecycleState::Faulted, .. }))
            .count();
        let notified = received
            .iter()
            .filter(|e| matches!(e, Event::Fault(FaultNotification::Device(_))))
            .count();
        assert_eq!(transitions, 1);
        assert_eq!(notified, 2);
    }

    #[test]
    fn test_fault_during_teardown_is_dropped() {
        let (engine, mut orch) = fixture();
        orch.setup().unwrap();

        orch.begin_teardown().unwrap();
        assert!(!orch.handle_fault(DeviceFault::DeviceLost));
        engine.inject_fault(DeviceFault::Underrun);
        orch.complete_teardown();
        assert_eq!(orch.lifecycle(), LifecycleState::Idle);

        orch.poll_faults();
        assert_eq!(orch.lifecycle(), LifecycleState::Idle);
        orch.setup().unwrap();
        assert_eq!(orch.lifecycle(), LifecycleState::Ready);
    }

    #[test]
    fn test_engine_start_failure() {
        let (engine, mut orch) = fixture();
        let events = orch.subscribe();
        engine.fail_next_start("device busy");

        let result = orch.setup();
        let busy = EngineError::Device("device busy".into());
        assert_eq!(result, Err(OrchestrationError::EngineStart(busy.clone())));
        assert_eq!(orch.lifecycle(), LifecycleState::Faulted);
        assert!(events
            .try_iter()
            .any(|e| e == Event::Fault(FaultNotification::EngineStartFailure(busy.clone()))));

        // Teardown skips the device it never started
        orch.teardown().unwrap();
        assert_eq!(engine.stop_count(), 0);
        orch.setup().unwrap();
        assert_eq!(orch.lifecycle(), LifecycleState::Ready);
    }

    #[test]
    fn test_submit_failure_faults_session() {
        let (engine, mut orch) = fixture();
        orch.add_track(Track::new("c", Constant(0.5))).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();

        engine.stop();
        assert_eq!(
            orch.step(),
            Err(OrchestrationError::Engine(EngineError::NotRunning))
        );
        assert_eq!(orch.lifecycle(), LifecycleState::Faulted);
        assert_eq!(orch.clock_position(), 0);
    }

    #[test]
    fn test_tracks_attach_with_the_engine() {
        let (engine, mut orch) = fixture();
        let early = orch.add_track(Track::new("early", Constant(0.1))).unwrap();
        assert!(engine.attached().is_empty());
        assert_eq!(orch.track_state(early), Some(TrackState::Loaded));

        orch.setup().unwrap();
        assert_eq!(engine.attached(), vec![NodeHandle::from(early)]);
        assert_eq!(orch.track_state(early), Some(TrackState::Scheduled));

        orch.play().unwrap();
        let late = orch.add_track(Track::new("late", Constant(0.1))).unwrap();
        assert_eq!(orch.track_state(late), Some(TrackState::Playing));
        assert_eq!(engine.attached().len(), 2);

        orch.remove_track(early).unwrap();
        assert_eq!(engine.attached(), vec![NodeHandle::from(late)]);
        assert_eq!(
            orch.remove_track(early),
            Err(OrchestrationError::NotFound(early))
        );
    }

    #[test]
    fn test_track_limit() {
        let engine = OfflineEngine::new(StreamFormat::new(48_000, 1));
        let config = OrchestratorConfig {
            max_tracks: 2,
            ..Default::default()
        };
        let mut orch = Orchestrator::new(Arc::new(engine), config);

        orch.add_track(Track::new("a", Constant(0.1))).unwrap();
        orch.add_track(Track::new("b", Constant(0.1))).unwrap();
        assert_eq!(
            orch.add_track(Track::new("c", Constant(0.1))),
            Err(OrchestrationError::TooManyTracks { limit: 2 })
        );
    }

    #[test]
    fn test_snapshot_reflects_latest_state() {
        let (_engine, mut orch) = fixture();
        let observer = orch.observer();
        orch.add_track(Track::new("kick", Constant(0.1))).unwrap();
        orch.setup().unwrap();
        orch.play().unwrap();
        orch.step().unwrap();

        let snapshot = observer.get();
        assert_eq!(snapshot.lifecycle, LifecycleState::Playing);
        assert_eq!(snapshot.clock_position, W);
        assert_eq!(snapshot.tracks[0].name, "kick");
        assert_eq!(snapshot.tracks[0].state, TrackState::Playing);
    }

    #[test]
    fn test_due_only_while_playing() {
        let (engine, mut orch) = fixture();
        orch.setup().unwrap();
        assert!(!orch.is_due());

        orch.play().unwrap();
        assert!(orch.is_due());
        orch.step().unwrap();
        orch.step().unwrap();
        assert!(!orch.is_due());
        engine.advance(W);
        assert!(orch.is_due());
    }
}
