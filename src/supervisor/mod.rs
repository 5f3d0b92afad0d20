//! Connection supervisor
//!
//! Owns the external VPN client process and the connection state machine:
//!
//! ```text
//! Disconnected --connect--> Connecting --exit 0 / marker--> Connected
//!                           Connecting --exit != 0 / spawn error--> Failed --> Disconnected
//! Connecting | Connected --disconnect--> Disconnecting --process gone--> Disconnected
//! ```
//!
//! # Concurrency
//!
//! The state and the live process session belong to a single actor task. Callers
//! hold cheap [`ConnectionSupervisor`] handles that send requests to the actor; the
//! per-process wait task reports back through a second channel. Every process event
//! carries the generation of the session that produced it, and the actor drops any
//! event whose generation is no longer live. That is what keeps a natural exit
//! racing a user disconnect from resurrecting a `Connected` state.

pub mod process;
pub mod state;

pub use process::{DiagnosticTail, Readiness, Termination};
pub use state::{ConnectionState, FailureReason, StateChange};

use crate::config::ClientSettings;
use crate::platform::{self, Elevation, Launch, PlatformError};
use crate::vpn::{CredentialBroker, EnvBinding, Profile};
use process::{ProcessEvent, ProcessExit, SessionConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("No VPN profile selected")]
    NoProfileSelected,
    #[error("Profile {} is not readable: {reason}", .path.display())]
    ProfileUnavailable { path: PathBuf, reason: String },
    #[error("A connection is already active")]
    AlreadyActive,
    #[error("Failed to start VPN client: {0}")]
    SpawnFailure(String),
    #[error("VPN client exited with code {code}")]
    ProcessExitedNonZero { code: i32, diagnostic_tail: String },
    #[error("VPN client stopped unexpectedly: {reason}")]
    ProcessAborted {
        reason: String,
        diagnostic_tail: String,
    },
    #[error("Failed to stop VPN client: {0}")]
    TerminationFailure(String),
    #[error("Connection supervisor has shut down")]
    SupervisorStopped,
}

impl SupervisorError {
    /// Error matching a `Failed` transition
    pub fn from_failure(reason: FailureReason, diagnostic: Option<String>) -> Self {
        let diagnostic_tail = diagnostic.unwrap_or_default();
        match reason {
            FailureReason::ExitCode(code) => SupervisorError::ProcessExitedNonZero {
                code,
                diagnostic_tail,
            },
            FailureReason::Spawn(message) => SupervisorError::SpawnFailure(message),
            reason @ (FailureReason::Signalled | FailureReason::Wait(_)) => {
                SupervisorError::ProcessAborted {
                    reason: reason.to_string(),
                    diagnostic_tail,
                }
            }
        }
    }

    /// Captured client output, when the error carries any
    pub fn diagnostic_tail(&self) -> Option<&str> {
        match self {
            SupervisorError::ProcessExitedNonZero {
                diagnostic_tail, ..
            }
            | SupervisorError::ProcessAborted {
                diagnostic_tail, ..
            } if !diagnostic_tail.is_empty() => Some(diagnostic_tail.as_str()),
            _ => None,
        }
    }
}

/// How the supervisor launches and stops the client
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub client_binary: PathBuf,
    pub elevation: Arc<dyn Elevation>,
    pub grace_period: Duration,
    pub diagnostic_limit: usize,
    pub readiness: Readiness,
}

impl SupervisorOptions {
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, PlatformError> {
        let elevation: Arc<dyn Elevation> = Arc::from(platform::get_elevation(settings.elevation)?);
        let readiness = match &settings.ready_marker {
            Some(marker) if !marker.trim().is_empty() => {
                Readiness::OutputMarker(marker.trim().to_string())
            }
            _ => Readiness::ExitCode,
        };
        Ok(Self {
            client_binary: settings.binary.clone(),
            elevation,
            grace_period: Duration::from_secs(settings.grace_period_secs),
            diagnostic_limit: settings.diagnostic_tail_bytes,
            readiness,
        })
    }
}

type Reply = oneshot::Sender<Result<(), SupervisorError>>;

enum Request {
    Connect {
        profile: Profile,
        env: Vec<EnvBinding>,
        reply: Reply,
    },
    Disconnect {
        reply: Reply,
    },
    Shutdown {
        reply: Reply,
    },
}

/// Fan-out of state changes to every live subscription
#[derive(Clone, Default)]
struct Observers {
    inner: Arc<Mutex<ObserverList>>,
}

#[derive(Default)]
struct ObserverList {
    senders: Vec<mpsc::UnboundedSender<StateChange>>,
    closed: bool,
}

impl Observers {
    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // after shutdown the sender is dropped here and the stream ends at once
        if !list.closed {
            list.senders.push(tx);
        }
        Subscription { rx }
    }

    fn notify(&self, change: StateChange) {
        let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        list.senders.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Drop every subscription so receivers see the end of the stream
    fn close(&self) {
        let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        list.closed = true;
        list.senders.clear();
    }
}

/// Stream of state changes, in transition order
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<StateChange>,
}

impl Subscription {
    /// Next state change; `None` once the supervisor has shut down
    pub async fn recv(&mut self) -> Option<StateChange> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StateChange> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next transition into a resting state
    ///
    /// A `Failed` seen on the way turns into the matching error.
    pub async fn settled(&mut self) -> Result<ConnectionState, SupervisorError> {
        let mut failure = None;
        while let Some(change) = self.rx.recv().await {
            match change.state {
                ConnectionState::Failed(reason) => failure = Some((reason, change.diagnostic)),
                ConnectionState::Connected => return Ok(ConnectionState::Connected),
                ConnectionState::Disconnected => {
                    return match failure {
                        Some((reason, diagnostic)) => {
                            Err(SupervisorError::from_failure(reason, diagnostic))
                        }
                        None => Ok(ConnectionState::Disconnected),
                    };
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {}
            }
        }
        Err(SupervisorError::SupervisorStopped)
    }
}

/// Handle to the connection supervisor
///
/// Clones share the same supervisor. When the last handle is dropped the
/// supervisor stops any running client and exits.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    observers: Observers,
}

impl ConnectionSupervisor {
    /// Start the supervisor on the current tokio runtime
    pub fn spawn(options: SupervisorOptions) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let observers = Observers::default();

        let actor = Actor {
            options,
            state: ConnectionState::Disconnected,
            session: None,
            next_generation: 0,
            shutting_down: false,
            state_tx,
            observers: observers.clone(),
            events_tx,
        };
        tokio::spawn(actor.run(requests_rx, events_rx));

        Self {
            requests: requests_tx,
            state: state_rx,
            observers,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.observers.subscribe()
    }

    /// Start connecting with `profile`
    ///
    /// Returns once the client is spawned; the outcome arrives as state changes.
    /// Credentials are drained from `credentials` on every path, including
    /// rejections.
    pub async fn connect(
        &self,
        profile: Option<&Profile>,
        credentials: &CredentialBroker,
    ) -> Result<(), SupervisorError> {
        let env = credentials.consume_for_environment();
        let profile = profile.ok_or(SupervisorError::NoProfileSelected)?;

        self.request(|reply| Request::Connect {
            profile: profile.clone(),
            env,
            reply,
        })
        .await
    }

    /// Stop the client and return to `Disconnected`
    ///
    /// A no-op when already disconnected. Termination errors are reported but the
    /// state still settles.
    pub async fn disconnect(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Request::Disconnect { reply }).await
    }

    /// Disconnect from any state and stop accepting commands
    pub async fn force_shutdown(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Request::Shutdown { reply }).await
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Request) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .map_err(|_| SupervisorError::SupervisorStopped)?;
        rx.await.map_err(|_| SupervisorError::SupervisorStopped)?
    }
}

fn check_readable(path: &Path) -> Result<(), SupervisorError> {
    let unavailable = |reason: String| SupervisorError::ProfileUnavailable {
        path: path.to_path_buf(),
        reason,
    };
    let metadata = fs::metadata(path).map_err(|e| unavailable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unavailable("not a regular file".to_string()));
    }
    fs::File::open(path).map_err(|e| unavailable(e.to_string()))?;
    Ok(())
}

/// A spawned client process and the callers waiting for it to stop
struct Session {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
    waiters: Vec<Reply>,
}

struct Actor {
    options: SupervisorOptions,
    state: ConnectionState,
    session: Option<Session>,
    next_generation: u64,
    shutting_down: bool,
    state_tx: watch::Sender<ConnectionState>,
    observers: Observers,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
}

impl Actor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        info!(
            "Connection supervisor started (client={}, elevation={})",
            self.options.client_binary.display(),
            self.options.elevation.name()
        );
        let mut requests_open = true;

        loop {
            tokio::select! {
                request = requests.recv(), if requests_open => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("All supervisor handles dropped");
                        requests_open = false;
                        self.stop(None, true);
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                else => break,
            }

            if self.shutting_down && self.session.is_none() {
                break;
            }
        }

        self.observers.close();
        info!("Connection supervisor stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect {
                profile,
                env,
                reply,
            } => {
                let result = self.connect(&profile, env);
                let _ = reply.send(result);
            }
            Request::Disconnect { reply } => self.stop(Some(reply), false),
            Request::Shutdown { reply } => self.stop(Some(reply), true),
        }
    }

    fn connect(&mut self, profile: &Profile, env: Vec<EnvBinding>) -> Result<(), SupervisorError> {
        if self.shutting_down {
            return Err(SupervisorError::SupervisorStopped);
        }
        if self.state != ConnectionState::Disconnected {
            debug!("Rejecting connect while {}", self.state);
            return Err(SupervisorError::AlreadyActive);
        }
        check_readable(profile.path())?;

        self.transition(ConnectionState::Connecting, None);

        let launch = Launch::new(
            self.options.client_binary.clone(),
            vec![profile.path().as_os_str().to_owned()],
        );
        let names: Vec<&str> = env.iter().map(|b| b.name).collect();
        let launch = self.options.elevation.wrap(launch, &names);
        debug!("Launching {:?} with {} credential variables", launch, names.len());

        let spawned = process::spawn_client(launch, &env);
        drop(env);

        match spawned {
            Ok(child) => {
                self.next_generation += 1;
                let generation = self.next_generation;
                info!(
                    "Started VPN client for {} (pid {:?})",
                    profile.name(),
                    child.id()
                );

                let (cancel_tx, cancel_rx) = oneshot::channel();
                let session = SessionConfig {
                    generation,
                    elevation: self.options.elevation.clone(),
                    grace_period: self.options.grace_period,
                    diagnostic_limit: self.options.diagnostic_limit,
                    readiness: self.options.readiness.clone(),
                };
                tokio::spawn(process::supervise(
                    child,
                    session,
                    cancel_rx,
                    self.events_tx.clone(),
                ));
                self.session = Some(Session {
                    generation,
                    cancel: Some(cancel_tx),
                    waiters: Vec::new(),
                });
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to start {}: {}",
                    self.options.client_binary.display(),
                    e
                );
                self.fail(FailureReason::Spawn(e.to_string()), None);
                Err(SupervisorError::SpawnFailure(e.to_string()))
            }
        }
    }

    /// Disconnect (and with `shutdown`, stop accepting connects)
    fn stop(&mut self, reply: Option<Reply>, shutdown: bool) {
        if shutdown && !self.shutting_down {
            info!("Connection supervisor shutting down");
            self.shutting_down = true;
        }

        if let Some(session) = self.session.as_mut() {
            if let Some(reply) = reply {
                session.waiters.push(reply);
            }
            if let Some(cancel) = session.cancel.take() {
                let _ = cancel.send(());
                self.transition(ConnectionState::Disconnecting, None);
            }
            return;
        }

        // No live process: either idle, or the client already exited after connecting
        if self.state == ConnectionState::Connected {
            self.transition(ConnectionState::Disconnecting, None);
            self.transition(ConnectionState::Disconnected, None);
        }
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
    }

    fn handle_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Ready { generation } => {
                if !self.is_live(generation) {
                    debug!("Ignoring readiness from stale session {}", generation);
                    return;
                }
                if self.state == ConnectionState::Connecting {
                    self.transition(ConnectionState::Connected, None);
                }
            }
            ProcessEvent::Exited {
                generation,
                exit,
                diagnostic,
            } => {
                if !self.is_live(generation) {
                    debug!("Ignoring exit from stale session {}", generation);
                    return;
                }
                let Some(session) = self.session.take() else {
                    return;
                };
                let diagnostic = (!diagnostic.is_empty()).then_some(diagnostic);
                self.handle_exit(session, exit, diagnostic);
            }
        }
    }

    fn handle_exit(&mut self, session: Session, exit: ProcessExit, diagnostic: Option<String>) {
        match self.state {
            ConnectionState::Disconnecting => {
                let result = match exit {
                    ProcessExit::Terminated(Err(message)) => {
                        warn!("Client termination failed: {}", message);
                        Err(message)
                    }
                    ProcessExit::Terminated(Ok(Termination { forced: true })) => {
                        warn!(
                            "Client ignored the stop request for {:?} and was killed",
                            self.options.grace_period
                        );
                        Ok(())
                    }
                    _ => Ok(()),
                };
                self.transition(ConnectionState::Disconnected, None);
                for waiter in session.waiters {
                    let _ = waiter.send(
                        result
                            .clone()
                            .map_err(SupervisorError::TerminationFailure),
                    );
                }
            }
            ConnectionState::Connecting => match classify(exit) {
                Ok(()) if self.options.readiness == Readiness::ExitCode => {
                    self.transition(ConnectionState::Connected, None);
                }
                Ok(()) => {
                    warn!("Client exited before reporting readiness");
                    self.transition(ConnectionState::Disconnected, diagnostic);
                }
                Err(reason) => self.fail(reason, diagnostic),
            },
            ConnectionState::Connected => match classify(exit) {
                Ok(()) => {
                    info!("Client exited, tunnel closed");
                    self.transition(ConnectionState::Disconnected, diagnostic);
                }
                Err(reason) => self.fail(reason, diagnostic),
            },
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                debug!("Client exit while {}, nothing to do", self.state);
            }
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    /// Publish a transient failure, then come to rest
    fn fail(&mut self, reason: FailureReason, diagnostic: Option<String>) {
        warn!("Connection failed: {}", reason);
        self.transition(ConnectionState::Failed(reason), diagnostic);
        self.transition(ConnectionState::Disconnected, None);
    }

    fn transition(&mut self, state: ConnectionState, diagnostic: Option<String>) {
        info!("Connection state: {} -> {}", self.state, state);
        self.state = state.clone();
        self.state_tx.send_replace(state.clone());
        self.observers.notify(StateChange { state, diagnostic });
    }
}

fn classify(exit: ProcessExit) -> Result<(), FailureReason> {
    match exit {
        ProcessExit::Natural(status) if status.success() => Ok(()),
        ProcessExit::Natural(status) => match status.code() {
            Some(code) => Err(FailureReason::ExitCode(code)),
            None => Err(FailureReason::Signalled),
        },
        ProcessExit::WaitFailed(message) => Err(FailureReason::Wait(message)),
        ProcessExit::Terminated(_) => Ok(()),
    }
}
