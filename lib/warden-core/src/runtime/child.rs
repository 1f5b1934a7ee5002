use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use serde::Deserialize;
use snafu::OptionExt as _;
use tracing::debug;
use warden_config::{ConfigurationError, GenericConfiguration};

use super::{
    container::{GenericServerContainer, SupervisedServer, SupervisedWorker},
    link::{ExitLink, ExitReason},
    process::Name,
    restart::{PostRestartHook, RestartReport, RestartStrategy},
    server::GenericServer,
    supervisor::{DuplicateChild, InvalidName, NoChildren, SupervisorError},
};

const fn default_shutdown_timeout_ms() -> u64 {
    5000
}

/// Restart disposition of a worker.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifeCycleKind {
    /// Always restarted, however the worker stopped.
    #[default]
    Permanent,

    /// Restarted only if the worker stopped abnormally.
    Transient,

    /// Never restarted.
    Temporary,
}

impl LifeCycleKind {
    /// Returns `true` if a worker with this disposition must be restarted after stopping for `reason`.
    pub fn should_restart(&self, reason: &ExitReason) -> bool {
        match self {
            Self::Permanent => true,
            Self::Transient => !reason.is_clean(),
            Self::Temporary => false,
        }
    }
}

/// Lifecycle policy of a worker.
///
/// Defaults to a permanent worker with a graceful shutdown timeout of 5 seconds. A shutdown timeout of zero skips the
/// graceful shutdown step entirely, and the worker is terminated immediately.
///
/// # Configuration
///
/// ```yaml
/// kind: transient
/// shutdown_timeout_ms: 250
/// ```
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct LifeCycle {
    #[serde(default)]
    kind: LifeCycleKind,

    #[serde(default = "default_shutdown_timeout_ms")]
    shutdown_timeout_ms: u64,
}

impl LifeCycle {
    fn with_kind(kind: LifeCycleKind) -> Self {
        Self {
            kind,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    /// Creates a permanent lifecycle.
    pub fn permanent() -> Self {
        Self::with_kind(LifeCycleKind::Permanent)
    }

    /// Creates a transient lifecycle.
    pub fn transient() -> Self {
        Self::with_kind(LifeCycleKind::Transient)
    }

    /// Creates a temporary lifecycle.
    pub fn temporary() -> Self {
        Self::with_kind(LifeCycleKind::Temporary)
    }

    /// Sets the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Loads a `LifeCycle` from the given configuration key, using the defaults if the key is absent.
    ///
    /// # Errors
    ///
    /// If the key exists but cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration, key: &str) -> Result<Self, ConfigurationError> {
        Ok(config.try_get_typed(key)?.unwrap_or_default())
    }

    /// Returns the restart disposition.
    pub fn kind(&self) -> LifeCycleKind {
        self.kind
    }

    /// Returns the graceful shutdown timeout, or `None` if the worker is terminated without a graceful shutdown.
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        if self.shutdown_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.shutdown_timeout_ms))
        }
    }
}

impl Default for LifeCycle {
    fn default() -> Self {
        Self::permanent()
    }
}

/// Describes a single supervised worker.
///
/// A worker specification holds everything the supervisor needs to create the worker's container when it starts, and
/// to create fresh server instances whenever the worker is restarted: the worker's identifier, a factory for server
/// instances, the configuration passed to [`GenericServer::init`], and the worker's lifecycle policy.
pub struct WorkerSpec<S: GenericServer> {
    id: Arc<str>,
    factory: Arc<dyn Fn() -> S + Send + Sync>,
    config: S::Config,
    lifecycle: LifeCycle,
    call_timeout: Option<Duration>,
}

impl<S: GenericServer> WorkerSpec<S> {
    /// Creates a new `WorkerSpec`.
    ///
    /// `factory` is called once when the supervisor starts, and again for every restart.
    pub fn new<I, F>(id: I, factory: F, config: S::Config) -> Self
    where
        I: AsRef<str>,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            id: id.as_ref().into(),
            factory: Arc::new(factory),
            config,
            lifecycle: LifeCycle::default(),
            call_timeout: None,
        }
    }

    /// Sets the lifecycle policy of the worker.
    pub fn with_lifecycle(mut self, lifecycle: LifeCycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Sets the default call timeout of the worker's container.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Returns the worker's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the worker's lifecycle policy.
    pub fn lifecycle(&self) -> LifeCycle {
        self.lifecycle
    }

    pub(crate) fn factory(&self) -> Arc<dyn Fn() -> S + Send + Sync> {
        Arc::clone(&self.factory)
    }

    pub(crate) fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }
}

impl<S: GenericServer> Clone for WorkerSpec<S> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            factory: Arc::clone(&self.factory),
            config: self.config.clone(),
            lifecycle: self.lifecycle,
            call_timeout: self.call_timeout,
        }
    }
}

/// A type-erased worker specification.
pub(crate) trait WorkerTemplate: Send + Sync {
    fn id(&self) -> &str;

    fn lifecycle(&self) -> LifeCycle;

    /// Creates the worker's container, linked to its supervisor. No server instance is created yet.
    fn create_worker(&self, name: Name, link: ExitLink) -> Arc<dyn SupervisedWorker>;
}

impl<S: GenericServer> WorkerTemplate for WorkerSpec<S> {
    fn id(&self) -> &str {
        &self.id
    }

    fn lifecycle(&self) -> LifeCycle {
        self.lifecycle
    }

    fn create_worker(&self, name: Name, link: ExitLink) -> Arc<dyn SupervisedWorker> {
        let container = GenericServerContainer::supervised(self, name, link);
        Arc::new(SupervisedServer::new(container, self.config.clone()))
    }
}

pub(crate) enum ChildKind {
    Worker(Arc<dyn WorkerTemplate>),
    Supervisor(SupervisorConfig),
}

/// A child of a supervisor: either a worker, or a nested supervisor.
///
/// Created implicitly from a [`WorkerSpec`] or a [`SupervisorConfig`].
pub struct ChildSpecification {
    kind: ChildKind,
}

impl ChildSpecification {
    /// Returns the child's identifier.
    pub fn id(&self) -> &str {
        match &self.kind {
            ChildKind::Worker(worker) => worker.id(),
            ChildKind::Supervisor(config) => config.id(),
        }
    }

    pub(crate) fn process_type(&self) -> &'static str {
        match &self.kind {
            ChildKind::Worker(_) => "worker",
            ChildKind::Supervisor(_) => "supervisor",
        }
    }

    pub(crate) fn kind(&self) -> &ChildKind {
        &self.kind
    }
}

impl Clone for ChildSpecification {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            ChildKind::Worker(worker) => ChildKind::Worker(Arc::clone(worker)),
            ChildKind::Supervisor(config) => ChildKind::Supervisor(config.clone()),
        };
        Self { kind }
    }
}

impl fmt::Debug for ChildSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ChildKind::Worker(worker) => f
                .debug_struct("Worker")
                .field("id", &worker.id())
                .field("lifecycle", &worker.lifecycle())
                .finish(),
            ChildKind::Supervisor(config) => fmt::Debug::fmt(config, f),
        }
    }
}

impl<S: GenericServer> From<WorkerSpec<S>> for ChildSpecification {
    fn from(spec: WorkerSpec<S>) -> Self {
        Self {
            kind: ChildKind::Worker(Arc::new(spec)),
        }
    }
}

impl From<SupervisorConfig> for ChildSpecification {
    fn from(config: SupervisorConfig) -> Self {
        Self {
            kind: ChildKind::Supervisor(config),
        }
    }
}

/// Configuration of a supervisor: its restart strategy, and its ordered children.
///
/// Children are started in the order they are added, restarted in that same order under
/// [`AllForOne`][super::RestartScheme::AllForOne], and stopped in reverse order.
#[derive(Clone)]
pub struct SupervisorConfig {
    id: Arc<str>,
    strategy: RestartStrategy,
    children: Vec<ChildSpecification>,
    post_restart: Option<PostRestartHook>,
}

impl SupervisorConfig {
    /// Creates an empty `SupervisorConfig`.
    pub fn new<I: AsRef<str>>(id: I, strategy: RestartStrategy) -> Self {
        Self {
            id: id.as_ref().into(),
            strategy,
            children: Vec::new(),
            post_restart: None,
        }
    }

    /// Adds a child.
    pub fn with_child<T: Into<ChildSpecification>>(mut self, child: T) -> Self {
        self.add_child(child);
        self
    }

    /// Adds a child.
    pub fn add_child<T: Into<ChildSpecification>>(&mut self, child: T) {
        let child = child.into();
        debug!(
            supervisor_id = %self.id,
            "Adding child #{}. ({}, {})",
            self.children.len(),
            child.process_type(),
            child.id(),
        );
        self.children.push(child);
    }

    /// Sets a hook to call after every completed restart.
    pub fn with_post_restart<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RestartReport) + Send + Sync + 'static,
    {
        self.post_restart = Some(Arc::new(hook));
        self
    }

    /// Returns the supervisor's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the restart strategy.
    pub fn strategy(&self) -> RestartStrategy {
        self.strategy
    }

    /// Returns the children, in order.
    pub fn children(&self) -> &[ChildSpecification] {
        &self.children
    }

    pub(crate) fn post_restart(&self) -> Option<&PostRestartHook> {
        self.post_restart.as_ref()
    }

    /// Checks the whole tree rooted at this configuration.
    ///
    /// Every identifier must be usable as a process name, every supervisor must have at least one child, and sibling
    /// identifiers must be unique.
    pub(crate) fn validate(&self) -> Result<(), SupervisorError> {
        Name::root(&self.id).context(InvalidName { name: &*self.id })?;

        if self.children.is_empty() {
            return NoChildren { supervisor_id: &*self.id }.fail();
        }

        let mut seen = HashSet::with_capacity(self.children.len());
        for child in &self.children {
            Name::root(child.id()).context(InvalidName { name: child.id() })?;
            if !seen.insert(child.id()) {
                return DuplicateChild {
                    supervisor_id: &*self.id,
                    child_id: child.id(),
                }
                .fail();
            }

            if let ChildKind::Supervisor(config) = &child.kind {
                config.validate()?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("children", &self.children)
            .finish()
    }
}
