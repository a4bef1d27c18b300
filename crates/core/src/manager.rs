use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use aixel_engine::AudioEngineAdapter;
use aixel_transport::TrackId;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result};
use crate::events::{Event, EventHub, Snapshot, SnapshotReader};
use crate::lifecycle::LifecycleState;
use crate::orchestrator::{Interrupt, Orchestrator};
use crate::realtime::RealtimePriority;
use crate::track::Track;

enum Command {
    Setup,
    Play,
    Pause,
    Stop,
    Seek(u64),
    Teardown,
    AddTrack(Track),
    RemoveTrack(TrackId),
    SetGain(TrackId, f32),
    SetMute(TrackId, bool),
    SetSolo(TrackId, bool),
    Shutdown,
}

enum Reply {
    Done,
    TrackAdded(TrackId),
}

struct Request {
    command: Command,
    reply: Sender<Result<Reply>>,
    /// The caller stops waiting at this point.
    deadline: Instant,
}

/// Owns an [`Orchestrator`] on a dedicated timing thread.
///
/// Commands are queued to the thread and applied between scheduling steps;
/// each call blocks until the thread has answered. Halting commands raise the
/// interrupt before they are queued so a window already being produced is
/// thrown away. State is observed through [`snapshot`](Self::snapshot) and
/// [`subscribe`](Self::subscribe).
///
/// `setup()` and `teardown()` return once the session has entered
/// `SettingUp` / `TearingDown`. Their completion shows up as a state change.
///
/// A call that times out is not applied if it is still queued when its
/// deadline passes. One that the thread picked up just before the deadline may
/// still take effect, so after a `Timeout` check the snapshot.
pub struct OrchestrationManager {
    commands: Sender<Request>,
    interrupt: Interrupt,
    snapshot: SnapshotReader,
    events: Arc<EventHub>,
    timeout: Duration,
    idle_poll: Duration,
    thread: Option<JoinHandle<()>>,
}

impl OrchestrationManager {
    pub fn new(engine: Arc<dyn AudioEngineAdapter>, config: OrchestratorConfig) -> Result<Self> {
        Self::spawn(Orchestrator::new(engine, config))
    }

    /// Move an existing orchestrator onto the timing thread.
    pub fn spawn(orchestrator: Orchestrator) -> Result<Self> {
        let config = orchestrator.config().clone();
        let (commands, requests) = crossbeam_channel::bounded(config.command_capacity.max(1));
        let interrupt = orchestrator.interrupt();
        let snapshot = orchestrator.observer();
        let events = orchestrator.events();

        let thread = thread::Builder::new()
            .name("aixel-timing".into())
            .spawn(move || timing_loop(orchestrator, requests))
            .map_err(|err| OrchestrationError::Spawn(err.to_string()))?;

        Ok(Self {
            commands,
            interrupt,
            snapshot,
            events,
            timeout: config.command_timeout(),
            idle_poll: config.idle_poll(),
            thread: Some(thread),
        })
    }

    pub fn setup(&self) -> Result<()> {
        self.call(Command::Setup).map(drop)
    }

    pub fn play(&self) -> Result<()> {
        self.call(Command::Play).map(drop)
    }

    pub fn pause(&self) -> Result<()> {
        self.interrupt.raise();
        self.call(Command::Pause).map(drop)
    }

    pub fn stop(&self) -> Result<()> {
        self.interrupt.raise();
        self.call(Command::Stop).map(drop)
    }

    pub fn seek(&self, frames: u64) -> Result<()> {
        self.call(Command::Seek(frames)).map(drop)
    }

    pub fn teardown(&self) -> Result<()> {
        self.interrupt.raise();
        self.call(Command::Teardown).map(drop)
    }

    pub fn add_track(&self, track: Track) -> Result<TrackId> {
        match self.call(Command::AddTrack(track))? {
            Reply::TrackAdded(id) => Ok(id),
            Reply::Done => Err(OrchestrationError::Disconnected),
        }
    }

    pub fn remove_track(&self, id: TrackId) -> Result<()> {
        self.call(Command::RemoveTrack(id)).map(drop)
    }

    pub fn set_gain(&self, id: TrackId, gain: f32) -> Result<()> {
        self.call(Command::SetGain(id, gain)).map(drop)
    }

    pub fn set_mute(&self, id: TrackId, mute: bool) -> Result<()> {
        self.call(Command::SetMute(id, mute)).map(drop)
    }

    pub fn set_solo(&self, id: TrackId, solo: bool) -> Result<()> {
        self.call(Command::SetSolo(id, solo)).map(drop)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.get()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.snapshot.lifecycle()
    }

    pub fn observer(&self) -> SnapshotReader {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.events.subscribe()
    }

    /// Wait until the session leaves `SettingUp` / `TearingDown`.
    pub fn settle(&self, timeout: Duration) -> Result<LifecycleState> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.lifecycle();
            if !matches!(state, LifecycleState::SettingUp | LifecycleState::TearingDown) {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                return Err(OrchestrationError::Timeout {
                    timeout_ms: timeout.as_millis(),
                });
            }
            thread::sleep(self.idle_poll.min(Duration::from_millis(1)));
        }
    }

    fn call(&self, command: Command) -> Result<Reply> {
        let timed_out = || OrchestrationError::Timeout {
            timeout_ms: self.timeout.as_millis(),
        };

        let deadline = Instant::now() + self.timeout;
        let (reply, response) = crossbeam_channel::bounded(1);
        let request = Request {
            command,
            reply,
            deadline,
        };
        self.commands
            .send_deadline(request, deadline)
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => timed_out(),
                SendTimeoutError::Disconnected(_) => OrchestrationError::Disconnected,
            })?;

        match response.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(timed_out()),
            Err(RecvTimeoutError::Disconnected) => Err(OrchestrationError::Disconnected),
        }
    }
}

impl Drop for OrchestrationManager {
    fn drop(&mut self) {
        self.interrupt.raise();
        let (reply, _response) = crossbeam_channel::bounded(1);
        let request = Request {
            command: Command::Shutdown,
            reply,
            deadline: Instant::now() + self.timeout,
        };
        if self.commands.send_timeout(request, self.timeout).is_err() {
            warn!("timing loop did not accept shutdown");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("timing loop panicked");
            }
        }
    }
}

fn timing_loop(mut orchestrator: Orchestrator, requests: Receiver<Request>) {
    let config = orchestrator.config().clone();
    let _priority = config.realtime_priority.then(|| {
        let priority = RealtimePriority::promote(config.window_frames, orchestrator.format().sample_rate);
        debug!(promoted = priority.is_promoted(), "timing loop priority");
        priority
    });
    let mut faults = orchestrator.fault_receiver();
    let mut faults_closed = false;
    info!(window_frames = config.window_frames, "timing loop started");

    loop {
        if faults_closed {
            faults = crossbeam_channel::never();
            faults_closed = false;
        }
        let timeout = if orchestrator.is_due() {
            Duration::ZERO
        } else {
            orchestrator.time_until_due()
        };
        let deadline = crossbeam_channel::after(timeout);

        crossbeam_channel::select_biased! {
            recv(requests) -> msg => match msg {
                Ok(request) => {
                    if !apply(&mut orchestrator, request) {
                        break;
                    }
                }
                Err(_) => {
                    orchestrator.shutdown();
                    break;
                }
            },
            recv(faults) -> fault => match fault {
                Ok(fault) => {
                    orchestrator.handle_fault(fault);
                }
                Err(_) => {
                    debug!("fault channel closed");
                    faults_closed = true;
                }
            },
            recv(deadline) -> _ => {}
        }

        if orchestrator.is_due() {
            if let Err(err) = orchestrator.step() {
                debug!(%err, "scheduling step failed");
            }
        }
    }

    info!("timing loop stopped");
}

/// Apply one request. Returns false once the loop should exit.
fn apply(orchestrator: &mut Orchestrator, request: Request) -> bool {
    let Request {
        command,
        reply,
        deadline,
    } = request;
    if !matches!(command, Command::Shutdown) && Instant::now() >= deadline {
        debug!("dropping command its caller gave up on");
        return true;
    }
    let respond = |result: Result<Reply>| {
        let _ = reply.send(result);
    };

    match command {
        Command::Setup => {
            let began = orchestrator.begin_setup();
            let ok = began.is_ok();
            respond(began.map(|()| Reply::Done));
            if ok {
                if let Err(err) = orchestrator.complete_setup() {
                    warn!(%err, "setup failed");
                }
            }
        }
        Command::Teardown => {
            let began = orchestrator.begin_teardown();
            let ok = began.is_ok();
            respond(began.map(|()| Reply::Done));
            if ok {
                orchestrator.complete_teardown();
            }
        }
        Command::Shutdown => {
            orchestrator.shutdown();
            respond(Ok(Reply::Done));
            return false;
        }
        Command::AddTrack(track) => respond(orchestrator.add_track(track).map(Reply::TrackAdded)),
        Command::Play => respond(orchestrator.play().map(|()| Reply::Done)),
        Command::Pause => respond(orchestrator.pause().map(|()| Reply::Done)),
        Command::Stop => respond(orchestrator.stop().map(|()| Reply::Done)),
        Command::Seek(frames) => respond(orchestrator.seek(frames).map(|()| Reply::Done)),
        Command::RemoveTrack(id) => respond(orchestrator.remove_track(id).map(|()| Reply::Done)),
        Command::SetGain(id, gain) => respond(orchestrator.set_gain(id, gain).map(|()| Reply::Done)),
        Command::SetMute(id, mute) => respond(orchestrator.set_mute(id, mute).map(|()| Reply::Done)),
        Command::SetSolo(id, solo) => respond(orchestrator.set_solo(id, solo).map(|()| Reply::Done)),
    }
    true
}
