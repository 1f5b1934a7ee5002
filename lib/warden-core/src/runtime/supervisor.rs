use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
};

use futures::FutureExt as _;
use snafu::{OptionExt as _, Snafu};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, error, warn};

use super::{
    child::{ChildKind, LifeCycleKind, SupervisorConfig},
    container::{GenericServerContainer, SupervisedWorker},
    link::{ChildExit, ExitLink, ExitReason},
    process::{Id, Name, Process, ProcessExt as _},
    restart::{RestartAction, RestartReport, RestartScheme, RestartState},
    server::GenericServer,
};

/// Supervisor errors.
#[derive(Clone, Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum SupervisorError {
    /// Supervisor or worker name is invalid.
    #[snafu(display("Invalid name for supervisor or worker: '{}'", name))]
    InvalidName {
        /// The invalid name.
        name: String,
    },

    /// The supervisor has no children.
    #[snafu(display("Supervisor '{}' has no child processes.", supervisor_id))]
    NoChildren {
        /// The supervisor's identifier.
        supervisor_id: String,
    },

    /// Two children of the same supervisor share an identifier.
    #[snafu(display("Supervisor '{}' has more than one child named '{}'.", supervisor_id, child_id))]
    DuplicateChild {
        /// The supervisor's identifier.
        supervisor_id: String,

        /// The duplicated child identifier.
        child_id: String,
    },

    /// The supervisor was already started.
    #[snafu(display("Supervisor '{}' was already started.", supervisor_id))]
    AlreadyStarted {
        /// The supervisor's identifier.
        supervisor_id: String,
    },

    /// The supervisor is no longer running.
    #[snafu(display("Supervisor '{}' is not running.", supervisor_id))]
    NotRunning {
        /// The supervisor's identifier.
        supervisor_id: String,
    },

    /// A child could not be started.
    #[snafu(display("Supervisor '{}' failed to start child '{}': {}", supervisor_id, child_id, reason))]
    FailedToStart {
        /// The supervisor's identifier.
        supervisor_id: String,

        /// The child that could not be started.
        child_id: String,

        /// Why the child could not be started.
        reason: String,
    },

    /// The supervisor panicked, and shut down its children.
    #[snafu(display("Supervisor '{}' panicked.", supervisor_id))]
    Panicked {
        /// The supervisor's identifier.
        supervisor_id: String,
    },

    /// The supervisor exceeded its restart limits and shut down.
    #[snafu(display(
        "Supervisor '{}' exceeded its restart limits after child '{}' failed, and was forced to shutdown.",
        supervisor_id,
        child_id
    ))]
    RestartLimitExceeded {
        /// The supervisor's identifier.
        supervisor_id: String,

        /// The child whose failure exhausted the restart budget.
        child_id: String,
    },
}

/// A running child, in the supervisor's registry.
#[derive(Clone)]
enum Child {
    Worker(Arc<dyn SupervisedWorker>),
    Supervisor(Supervisor),
}

impl Child {
    fn id(&self) -> &str {
        match self {
            Self::Worker(worker) => worker.id(),
            Self::Supervisor(supervisor) => supervisor.id(),
        }
    }

    fn instance_id(&self) -> Option<Id> {
        match self {
            Self::Worker(worker) => worker.instance_id(),
            Self::Supervisor(supervisor) => Some(supervisor.process_id),
        }
    }

    async fn terminate(&self, reason: ExitReason) {
        match self {
            Self::Worker(worker) => worker.terminate(reason).await,

            // Nested supervisors are always given as much time as they need, so that the entire subtree shuts down
            // cleanly.
            Self::Supervisor(supervisor) => {
                if let Err(e) = supervisor.stop().await {
                    debug!(supervisor_id = %supervisor.id(), error = %e, "Nested supervisor stopped with error.");
                }
            }
        }
    }
}

type Registry = Arc<RwLock<Vec<Child>>>;

enum SupervisorControl {
    Start {
        ack: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Stop,
}

/// Builds supervisors from a [`SupervisorConfig`].
///
/// The same factory can build any number of independent supervisors.
pub struct SupervisorFactory {
    config: SupervisorConfig,
}

impl SupervisorFactory {
    /// Creates a new `SupervisorFactory`.
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Creates a new supervisor.
    ///
    /// The whole tree is validated first. The supervisor process is then spawned on the current Tokio runtime, idle
    /// until [`Supervisor::start`] is called: no child exists before that.
    ///
    /// # Errors
    ///
    /// If any supervisor in the tree has no children, if sibling identifiers are not unique, or if any identifier
    /// cannot be used as a process name, an error is returned.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new_instance(&self) -> Result<Supervisor, SupervisorError> {
        self.config.validate()?;
        Supervisor::spawn(self.config.clone(), None, None)
    }
}

/// Handle to a running supervisor.
///
/// # Lifecycle
///
/// A supervisor is created idle by [`SupervisorFactory::new_instance`], and only creates its children when it receives
/// [`start`][Self::start]: each child is created in configuration order, workers by installing, starting, and
/// initializing a fresh server instance, and nested supervisors by recursively starting them.
///
/// From then on, the supervisor handles its children's failures according to its
/// [`RestartStrategy`][super::RestartStrategy], until either [`stop`][Self::stop] is called, or the restart budget
/// is exhausted. Either way, children are stopped in reverse configuration order.
///
/// # Failure propagation
///
/// Children are linked to their supervisor and nothing else: a failure is only ever seen by the supervisor that owns
/// the failed child. A nested supervisor that exhausts its own restart budget stops, and its parent sees that as a
/// single ordinary child failure, which it handles with its own strategy.
///
/// Handles are cheap to clone, and all refer to the same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    id: Arc<str>,
    process_id: Id,
    control_tx: mpsc::UnboundedSender<SupervisorControl>,
    children: Registry,
    outcome_rx: watch::Receiver<Option<Result<(), SupervisorError>>>,
}

impl Supervisor {
    fn spawn(
        config: SupervisorConfig, parent: Option<&Process>, link: Option<ExitLink>,
    ) -> Result<Self, SupervisorError> {
        let process = Process::supervisor(config.id(), parent).context(InvalidName { name: config.id() })?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let children = Registry::default();

        let handle = Self {
            id: config.id().into(),
            process_id: process.id(),
            control_tx,
            children: Arc::clone(&children),
            outcome_rx,
        };

        let supervisor_process = SupervisorProcess {
            config,
            process: process.clone(),
            children,
            control_rx,
            signals_tx,
            signals_rx,
            parent_link: link,
            outcome_tx,
        };

        debug!(supervisor_id = %handle.id, process_id = %handle.process_id, "Spawning supervisor.");
        tokio::spawn(supervisor_process.run().into_instrumented(&process));

        Ok(handle)
    }

    /// Returns the supervisor's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the supervisor's process identifier.
    pub fn process_id(&self) -> Id {
        self.process_id
    }

    /// Starts the supervisor, and waits for all of its children to be started.
    ///
    /// Failures of a worker's initialization are not reported here: they happen after the worker is started, and are
    /// handled like any other failure of the worker.
    ///
    /// # Errors
    ///
    /// If the supervisor was already started, is no longer running, or if a child could not be started, an error is
    /// returned.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control_tx.send(SupervisorControl::Start { ack: ack_tx }).is_err() {
            return NotRunning { supervisor_id: self.id() }.fail();
        }

        match ack_rx.await {
            Ok(result) => result,
            Err(_) => NotRunning { supervisor_id: self.id() }.fail(),
        }
    }

    /// Stops the supervisor, and waits for it to finish.
    ///
    /// Children are stopped in reverse configuration order. Each worker is given its graceful shutdown timeout, and
    /// each nested supervisor as much time as it needs.
    ///
    /// # Errors
    ///
    /// If the supervisor had already stopped because it exceeded its restart limits, that error is returned.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        // A supervisor that already finished has dropped its receiver, and its outcome is already known.
        let _ = self.control_tx.send(SupervisorControl::Stop);
        self.wait().await
    }

    /// Waits for the supervisor to finish.
    ///
    /// # Errors
    ///
    /// If the supervisor exceeded its restart limits, an error is returned.
    pub async fn wait(&self) -> Result<(), SupervisorError> {
        let mut outcome_rx = self.outcome_rx.clone();
        let outcome = match outcome_rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        match outcome {
            Some(result) => result,
            None => NotRunning { supervisor_id: self.id() }.fail(),
        }
    }

    /// Starts the supervisor, and stops it once `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// If the supervisor fails to start, or exceeds its restart limits before `shutdown` resolves, an error is
    /// returned.
    pub async fn run_with_shutdown<F: Future>(&self, shutdown: F) -> Result<(), SupervisorError> {
        self.start().await?;

        select! {
            _ = shutdown => {
                debug!(supervisor_id = %self.id, "Shutdown triggered, stopping supervisor.");
                self.stop().await
            },
            result = self.wait() => result,
        }
    }

    /// Returns the container of the direct child worker `id`, if it exists and runs servers of type `S`.
    ///
    /// Nested supervisors are not searched.
    pub fn server<S: GenericServer>(&self, id: &str) -> Option<GenericServerContainer<S>> {
        self.read_children().iter().find_map(|child| match child {
            Child::Worker(worker) if worker.id() == id => {
                worker.as_any().downcast_ref::<GenericServerContainer<S>>().cloned()
            }
            _ => None,
        })
    }

    /// Returns the container of the direct child worker `id`, or the result of `default` if there is none.
    ///
    /// # Errors
    ///
    /// If there is no such worker and `default` fails, its error is returned.
    pub fn server_or_else<S, F, E>(&self, id: &str, default: F) -> Result<GenericServerContainer<S>, E>
    where
        S: GenericServer,
        F: FnOnce() -> Result<GenericServerContainer<S>, E>,
    {
        match self.server(id) {
            Some(container) => Ok(container),
            None => default(),
        }
    }

    /// Returns the direct child supervisor `id`, if it exists.
    pub fn child_supervisor(&self, id: &str) -> Option<Supervisor> {
        self.read_children().iter().find_map(|child| match child {
            Child::Supervisor(supervisor) if supervisor.id() == id => Some(supervisor.clone()),
            _ => None,
        })
    }

    /// Returns the identifiers of the running direct children, in configuration order.
    pub fn child_ids(&self) -> Vec<String> {
        self.read_children().iter().map(|child| child.id().to_string()).collect()
    }

    fn read_children(&self) -> RwLockReadGuard<'_, Vec<Child>> {
        self.children.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.id)
            .field("process_id", &self.process_id)
            .finish()
    }
}

struct SupervisorProcess {
    config: SupervisorConfig,
    process: Process,
    children: Registry,
    control_rx: mpsc::UnboundedReceiver<SupervisorControl>,
    signals_tx: mpsc::UnboundedSender<ChildExit>,
    signals_rx: mpsc::UnboundedReceiver<ChildExit>,
    parent_link: Option<ExitLink>,
    outcome_tx: watch::Sender<Option<Result<(), SupervisorError>>>,
}

impl SupervisorProcess {
    async fn run(mut self) {
        let outcome = AssertUnwindSafe(self.run_inner()).catch_unwind().await;
        let (result, reason) = match outcome {
            Ok(Ok(())) => {
                debug!(supervisor_id = %self.config.id(), "Supervisor stopped.");
                (Ok(()), ExitReason::Shutdown)
            }
            Ok(Err(e)) => {
                debug!(supervisor_id = %self.config.id(), error = %e, "Supervisor stopped with error.");
                let reason = ExitReason::failed(e.clone());
                (Err(e), reason)
            }
            Err(_) => {
                error!(supervisor_id = %self.config.id(), "Supervisor panicked, shutting down all child processes.");
                self.shutdown_children().await;
                let result = Panicked {
                    supervisor_id: self.config.id(),
                }
                .fail();
                (result, ExitReason::Panicked)
            }
        };
        self.outcome_tx.send_replace(Some(result));

        if let Some(link) = &self.parent_link {
            link.notify(self.process.id(), reason);
        }
    }

    async fn run_inner(&mut self) -> Result<(), SupervisorError> {
        // Nothing happens until we are told to start.
        loop {
            match self.control_rx.recv().await {
                Some(SupervisorControl::Start { ack }) => {
                    let result = self.start_children().await;
                    let started = result.is_ok();
                    let _ = ack.send(result.clone());
                    if started {
                        break;
                    }
                    return result;
                }
                Some(SupervisorControl::Stop) | None => {
                    debug!(supervisor_id = %self.config.id(), "Supervisor stopped before starting.");
                    return Ok(());
                }
            }
        }

        let mut restart_state = RestartState::new(self.config.strategy());
        let mut control_open = true;

        loop {
            select! {
                control = self.control_rx.recv(), if control_open => match control {
                    Some(SupervisorControl::Start { ack }) => {
                        let _ = ack.send(AlreadyStarted { supervisor_id: self.config.id() }.fail());
                    }
                    Some(SupervisorControl::Stop) => {
                        debug!(supervisor_id = %self.config.id(), "Stop requested, shutting down all child processes.");
                        self.shutdown_children().await;
                        return Ok(());
                    }
                    None => {
                        // Every handle is gone, so nothing can stop us anymore: keep supervising.
                        control_open = false;
                    }
                },
                Some(exit) = self.signals_rx.recv() => {
                    if let Err(e) = self.handle_child_exit(exit, &mut restart_state).await {
                        self.shutdown_children().await;
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn start_children(&mut self) -> Result<(), SupervisorError> {
        debug!(supervisor_id = %self.config.id(), "Starting all child processes.");
        for child_idx in 0..self.config.children().len() {
            match self.create_child(child_idx).await {
                Ok(child) => self.write_children().push(child),
                Err(e) => {
                    self.shutdown_children().await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Creates child `child_idx` and starts it.
    async fn create_child(&self, child_idx: usize) -> Result<Child, SupervisorError> {
        let child_spec = &self.config.children()[child_idx];
        debug!(
            supervisor_id = %self.config.id(),
            "Starting child process #{} ({}, {}).",
            child_idx,
            child_spec.process_type(),
            child_spec.id()
        );

        match child_spec.kind() {
            ChildKind::Worker(template) => {
                let name = Name::scoped(self.process.name(), template.id())
                    .context(InvalidName { name: template.id() })?;
                let link = ExitLink::new(
                    child_idx,
                    template.id(),
                    template.lifecycle().kind(),
                    self.signals_tx.clone(),
                );
                let worker = template.create_worker(name, link);
                worker.boot().map_err(|e| SupervisorError::FailedToStart {
                    supervisor_id: self.config.id().to_string(),
                    child_id: template.id().to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Child::Worker(worker))
            }
            ChildKind::Supervisor(config) => {
                // A nested supervisor is restarted however it stops, as long as its parent is running.
                let link = ExitLink::new(child_idx, config.id(), LifeCycleKind::Permanent, self.signals_tx.clone());
                let supervisor = Supervisor::spawn(config.clone(), Some(&self.process), Some(link))?;
                if let Err(e) = supervisor.start().await {
                    let _ = supervisor.stop().await;
                    return FailedToStart {
                        supervisor_id: self.config.id(),
                        child_id: config.id(),
                        reason: e.to_string(),
                    }
                    .fail();
                }
                Ok(Child::Supervisor(supervisor))
            }
        }
    }

    async fn handle_child_exit(
        &mut self, exit: ChildExit, restart_state: &mut RestartState,
    ) -> Result<(), SupervisorError> {
        let child = match self.get_child(exit.child_idx) {
            Some(child) if child.instance_id() == Some(exit.instance) => child,
            _ => {
                debug!(supervisor_id = %self.config.id(), process_id = %exit.instance, "Ignoring exit of a replaced child process.");
                return Ok(());
            }
        };
        let child_id = child.id().to_string();

        let restarted = match restart_state.evaluate_restart() {
            RestartAction::Restart(RestartScheme::OneForOne) => {
                warn!(supervisor_id = %self.config.id(), %child_id, reason = %exit.reason, "Child process terminated, restarting.");
                self.restart_child(exit.child_idx, &exit.reason).await?;
                vec![child_id.clone()]
            }
            RestartAction::Restart(RestartScheme::AllForOne) => {
                warn!(supervisor_id = %self.config.id(), %child_id, reason = %exit.reason, "Child process terminated, restarting all processes.");
                self.restart_all_children(&exit.reason).await?
            }
            RestartAction::Escalate => {
                error!(supervisor_id = %self.config.id(), %child_id, reason = %exit.reason, "Supervisor shutting down due to restart limits.");
                return RestartLimitExceeded {
                    supervisor_id: self.config.id(),
                    child_id,
                }
                .fail();
            }
        };

        if let Some(hook) = self.config.post_restart() {
            let report = RestartReport {
                supervisor_id: self.config.id().to_string(),
                scheme: self.config.strategy().scheme(),
                failed_child: child_id,
                reason: exit.reason,
                restarted,
            };
            hook(&report);
        }

        Ok(())
    }

    /// Replaces the running instance of child `child_idx` with a fresh one.
    async fn restart_child(&mut self, child_idx: usize, reason: &ExitReason) -> Result<(), SupervisorError> {
        match self.get_child(child_idx) {
            Some(Child::Worker(worker)) => {
                worker.restart(reason);
                Ok(())
            }
            Some(Child::Supervisor(_)) | None => {
                let child = self.create_child(child_idx).await?;
                self.replace_child(child_idx, child);
                Ok(())
            }
        }
    }

    /// Stops every child, then brings every child back, all in configuration order.
    ///
    /// No replacement becomes reachable until every child has been reinitialized: workers are initialized before being
    /// installed, and all of them are installed together at the end.
    async fn restart_all_children(&mut self, reason: &ExitReason) -> Result<Vec<String>, SupervisorError> {
        let children = self.read_children().clone();
        for child in &children {
            child.terminate(ExitReason::Shutdown).await;
        }

        let child_count = self.config.children().len();
        let mut replacements = Vec::with_capacity(child_count);
        let mut failure = None;
        for child_idx in 0..child_count {
            match children.get(child_idx) {
                Some(Child::Worker(worker)) => {
                    worker.stage_restart().await;
                    replacements.push(None);
                }
                Some(Child::Supervisor(_)) | None => match self.create_child(child_idx).await {
                    Ok(child) => replacements.push(Some(child)),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                },
            }
        }

        // Whatever was prepared is installed, so that a failed restart still tears it down.
        for (child_idx, replacement) in replacements.into_iter().enumerate() {
            match (replacement, children.get(child_idx)) {
                (Some(child), _) => self.replace_child(child_idx, child),
                (None, Some(Child::Worker(worker))) => worker.commit_restart(reason),
                (None, _) => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(self.config.children().iter().map(|child| child.id().to_string()).collect()),
        }
    }

    fn replace_child(&self, child_idx: usize, child: Child) {
        let mut children = self.write_children();
        match children.get_mut(child_idx) {
            Some(slot) => *slot = child,
            None => children.push(child),
        }
    }

    /// Stops every child, in reverse configuration order.
    async fn shutdown_children(&mut self) {
        debug!(supervisor_id = %self.config.id(), "Shutting down all child processes.");
        let children = std::mem::take(&mut *self.write_children());
        for child in children.iter().rev() {
            debug!(supervisor_id = %self.config.id(), child_id = child.id(), "Stopping child process.");
            child.terminate(ExitReason::Shutdown).await;
        }
    }

    fn get_child(&self, child_idx: usize) -> Option<Child> {
        self.read_children().get(child_idx).cloned()
    }

    fn read_children(&self) -> RwLockReadGuard<'_, Vec<Child>> {
        self.children.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_children(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Child>> {
        self.children.write().unwrap_or_else(PoisonError::into_inner)
    }
}
