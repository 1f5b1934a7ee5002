use std::{
    any::Any,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use snafu::{OptionExt as _, Snafu};
use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, warn};

use super::{
    child::{LifeCycle, WorkerSpec},
    link::{ExitLink, ExitReason},
    process::{Id, Name, Process, ProcessExt as _},
    server::{ControlMessage, Envelope, GenericServer, HotSwapHandler, Mailbox, ServerProcess},
};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Container errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ContainerError {
    /// No server instance is installed in the container yet.
    #[snafu(display("Container '{}' has no server instance installed.", container_id))]
    NotStarted {
        /// The container's identifier.
        container_id: String,
    },

    /// The server instance stopped before replying.
    #[snafu(display("Server in container '{}' stopped without replying.", container_id))]
    NoReply {
        /// The container's identifier.
        container_id: String,
    },
}

/// The server instance currently receiving messages.
struct InstalledServer<S: GenericServer> {
    process: Process,
    mailbox: Mailbox<S>,
}

/// A freshly created server instance, running but not yet installed in a container.
pub(crate) struct ServerInstance<S: GenericServer> {
    process: Process,
    mailbox: Mailbox<S>,
}

struct Inner<S: GenericServer> {
    id: Arc<str>,
    name: Name,
    factory: Arc<dyn Fn() -> S + Send + Sync>,
    lifecycle: LifeCycle,
    link: Option<ExitLink>,
    call_timeout_ms: AtomicU64,

    instance: RwLock<Option<InstalledServer<S>>>,

    // Held apart from `instance` so that the lock guarding the mailbox never requires `S: Sync`.
    pending: Mutex<Option<ServerProcess<S>>>,

    config: Mutex<Option<S::Config>>,

    // Initialized replacement waiting for `install_staged`.
    staged: Mutex<Option<ServerInstance<S>>>,
}

/// Lifecycle proxy for a single worker.
///
/// A container owns the live server instance of a worker, and is the only way to talk to it. When the worker is
/// restarted, the container swaps in a fresh instance: callers holding the container keep talking to the worker without
/// noticing the swap, aside from messages that were still queued for the old instance.
///
/// # Concurrency
///
/// Sending takes a shared lock on the current instance, while installing a new instance takes an exclusive lock. A
/// message is therefore always delivered to a fully installed instance, and a freshly installed instance always
/// receives its `Init` before any message sent through the container.
///
/// Calls that wait for a reply never hold the lock while waiting.
pub struct GenericServerContainer<S: GenericServer> {
    inner: Arc<Inner<S>>,
}

impl<S: GenericServer> GenericServerContainer<S> {
    /// Creates a standalone container with the given server factory.
    ///
    /// No server instance is installed: every call fails with [`ContainerError::NotStarted`] until the container is
    /// started by a supervisor. Workers that should actually run are declared with a [`WorkerSpec`] instead.
    pub fn new<I, F>(id: I, factory: F) -> Self
    where
        I: AsRef<str>,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let id = id.as_ref();
        let name = Name::root(id).unwrap_or_else(Name::anonymous);
        Self::from_parts(id.into(), name, Arc::new(factory), LifeCycle::default(), None, None)
    }

    pub(crate) fn supervised(spec: &WorkerSpec<S>, name: Name, link: ExitLink) -> Self {
        Self::from_parts(
            spec.id().into(),
            name,
            spec.factory(),
            spec.lifecycle(),
            Some(link),
            spec.call_timeout(),
        )
    }

    fn from_parts(
        id: Arc<str>, name: Name, factory: Arc<dyn Fn() -> S + Send + Sync>, lifecycle: LifeCycle,
        link: Option<ExitLink>, call_timeout: Option<Duration>,
    ) -> Self {
        let call_timeout = call_timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        Self {
            inner: Arc::new(Inner {
                id,
                name,
                factory,
                lifecycle,
                link,
                call_timeout_ms: AtomicU64::new(duration_to_millis(call_timeout)),
                instance: RwLock::new(None),
                pending: Mutex::new(None),
                config: Mutex::new(None),
                staged: Mutex::new(None),
            }),
        }
    }

    /// Returns the container's identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the process identifier of the installed server instance, if any.
    ///
    /// Every server instance gets a fresh identifier, so this changes whenever the worker is restarted.
    pub fn instance_id(&self) -> Option<Id> {
        self.read_instance().as_ref().map(|installed| installed.process.id())
    }

    /// Returns the default timeout used by [`call_or_else`][Self::call_or_else].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.inner.call_timeout_ms.load(Relaxed))
    }

    /// Sets the default timeout used by [`call_or_else`][Self::call_or_else].
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.call_timeout_ms.store(duration_to_millis(timeout), Relaxed);
    }

    /// Sends a message to the server without waiting for it to be handled.
    ///
    /// If the installed instance has already stopped, the message is dropped.
    ///
    /// # Errors
    ///
    /// If no server instance is installed, an error is returned.
    pub fn cast(&self, message: S::Message) -> Result<(), ContainerError> {
        self.send(Envelope::Application {
            message,
            reply_tx: None,
        })
    }

    /// Sends a message to the server and waits up to `timeout` for its reply.
    ///
    /// Returns `None` if no reply arrived in time, or if the instance stopped without replying. A message whose reply
    /// is not awaited is still handled; the late reply is dropped.
    ///
    /// # Errors
    ///
    /// If no server instance is installed, an error is returned.
    pub async fn call_timeout(
        &self, message: S::Message, timeout: Duration,
    ) -> Result<Option<S::Reply>, ContainerError> {
        let reply_rx = self.request(message)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => {
                debug!(container_id = %self.inner.id, "Server dropped call without replying.");
                Ok(None)
            }
            Err(_) => {
                debug!(container_id = %self.inner.id, ?timeout, "Call timed out.");
                Ok(None)
            }
        }
    }

    /// Sends a message to the server and waits for its reply, using the container's default timeout.
    ///
    /// If no reply arrives in time, `or_else` is called and its result is returned instead.
    ///
    /// # Errors
    ///
    /// If no server instance is installed, or if `or_else` fails, an error is returned.
    pub async fn call_or_else<F, E>(&self, message: S::Message, or_else: F) -> Result<S::Reply, E>
    where
        F: FnOnce() -> Result<S::Reply, E>,
        E: From<ContainerError>,
    {
        self.call_or_else_with_timeout(message, or_else, self.timeout()).await
    }

    /// Sends a message to the server and waits up to `timeout` for its reply.
    ///
    /// If no reply arrives in time, `or_else` is called and its result is returned instead.
    ///
    /// # Errors
    ///
    /// If no server instance is installed, or if `or_else` fails, an error is returned.
    pub async fn call_or_else_with_timeout<F, E>(
        &self, message: S::Message, or_else: F, timeout: Duration,
    ) -> Result<S::Reply, E>
    where
        F: FnOnce() -> Result<S::Reply, E>,
        E: From<ContainerError>,
    {
        match self.call_timeout(message, timeout).await? {
            Some(reply) => Ok(reply),
            None => or_else(),
        }
    }

    /// Sends a message to the server and waits for its reply, however long it takes.
    ///
    /// # Errors
    ///
    /// If no server instance is installed, or if the instance stopped without replying, an error is returned.
    pub async fn call_blocking(&self, message: S::Message) -> Result<S::Reply, ContainerError> {
        let reply_rx = self.request(message)?;
        reply_rx.await.ok().context(NoReply {
            container_id: &*self.inner.id,
        })
    }

    /// Replaces the server's application message handler with `handler`, or restores the original handler if `None`.
    ///
    /// The swap applies to every message handled after it. A restarted worker always starts with its original
    /// handler.
    ///
    /// # Errors
    ///
    /// If no server instance is installed, an error is returned.
    pub fn hotswap(&self, handler: Option<HotSwapHandler<S>>) -> Result<(), ContainerError> {
        self.send(Envelope::Control(ControlMessage::HotSwap(handler)))
    }

    /// Stops the installed server instance immediately, with the given reason.
    ///
    /// The supervisor observes the reason exactly as it would observe a crash, subject to the worker's lifecycle
    /// policy.
    ///
    /// # Errors
    ///
    /// If no server instance is installed, an error is returned.
    pub fn terminate(&self, reason: ExitReason) -> Result<(), ContainerError> {
        self.send(Envelope::Control(ControlMessage::Terminate(reason)))
    }

    /// Creates a new server instance and installs it, without running it yet.
    ///
    /// Any previously installed instance is discarded.
    pub(crate) fn instantiate(&self) {
        let mut instance = self.write_instance();
        let (mailbox, server_process) = ServerProcess::new((self.inner.factory)());
        let process = Process::named(self.inner.name.clone());
        debug!(container_id = %self.inner.id, process_id = %process.id(), "Instantiated server.");

        *self.lock_pending() = Some(server_process);
        *instance = Some(InstalledServer { process, mailbox });
    }

    /// Starts running the installed server instance.
    pub(crate) fn start(&self) -> Result<(), ContainerError> {
        let process = self
            .read_instance()
            .as_ref()
            .map(|installed| installed.process.clone())
            .context(NotStarted {
                container_id: &*self.inner.id,
            })?;
        let server_process = self.lock_pending().take().context(NotStarted {
            container_id: &*self.inner.id,
        })?;

        self.spawn(process, server_process);
        Ok(())
    }

    /// Remembers `config` and initializes the installed server instance with it.
    ///
    /// Every instance installed later by [`reconfigure`][Self::reconfigure] is initialized with the same configuration.
    pub(crate) fn initialize(&self, config: S::Config) -> Result<(), ContainerError> {
        *self.lock_config() = Some(config.clone());
        self.send(Envelope::Control(ControlMessage::Init { config, ack: None }))
    }

    /// Creates and starts a new server instance, without installing it.
    pub(crate) fn new_instance(&self) -> ServerInstance<S> {
        let (mailbox, server_process) = ServerProcess::new((self.inner.factory)());
        let process = Process::named(self.inner.name.clone());
        self.spawn(process.clone(), server_process);
        ServerInstance { process, mailbox }
    }

    /// Installs `instance` in place of the current instance, and initializes it with the remembered configuration.
    ///
    /// The replaced instance, if still running, is terminated with `reason`.
    pub(crate) fn reconfigure(&self, reason: &ExitReason, instance: ServerInstance<S>) {
        let installed = self.write_instance();
        let config = self.lock_config().clone();
        if let Some(config) = config {
            let _ = instance
                .mailbox
                .send(Envelope::Control(ControlMessage::Init { config, ack: None }));
        }

        self.install(installed, reason, instance);
    }

    /// Creates and starts a new server instance, and waits for it to be initialized with the remembered configuration,
    /// without installing it.
    ///
    /// Waiting is bounded by the container's default call timeout. An instance that fails to initialize stops, and its
    /// exit is reported once it is installed.
    pub(crate) async fn stage_instance(&self) {
        let instance = self.new_instance();
        let config = self.lock_config().clone();
        if let Some(config) = config {
            let (ack_tx, ack_rx) = oneshot::channel();
            let init = ControlMessage::Init {
                config,
                ack: Some(ack_tx),
            };
            if instance.mailbox.send(Envelope::Control(init)).is_ok() {
                match timeout(self.timeout(), ack_rx).await {
                    Ok(Ok(())) => debug!(container_id = %self.inner.id, process_id = %instance.process.id(), "Staged server initialized."),
                    Ok(Err(_)) => debug!(container_id = %self.inner.id, process_id = %instance.process.id(), "Staged server failed to initialize."),
                    Err(_) => warn!(container_id = %self.inner.id, process_id = %instance.process.id(), "Staged server did not initialize in time."),
                }
            }
        }

        let replaced = self.lock_staged().replace(instance);
        if let Some(replaced) = replaced {
            let _ = replaced
                .mailbox
                .send(Envelope::Control(ControlMessage::Terminate(ExitReason::Shutdown)));
        }
    }

    /// Installs the instance prepared by [`stage_instance`][Self::stage_instance], if any.
    ///
    /// The replaced instance, if still running, is terminated with `reason`.
    pub(crate) fn install_staged(&self, reason: &ExitReason) {
        let installed = self.write_instance();
        let staged = self.lock_staged().take();
        if let Some(instance) = staged {
            self.install(installed, reason, instance);
        }
    }

    fn install(
        &self, mut installed: std::sync::RwLockWriteGuard<'_, Option<InstalledServer<S>>>, reason: &ExitReason,
        instance: ServerInstance<S>,
    ) {
        debug!(container_id = %self.inner.id, process_id = %instance.process.id(), %reason, "Installing new server instance.");
        let replaced = installed.replace(InstalledServer {
            process: instance.process,
            mailbox: instance.mailbox,
        });
        drop(installed);

        if let Some(replaced) = replaced {
            let _ = replaced
                .mailbox
                .send(Envelope::Control(ControlMessage::Terminate(reason.clone())));
        }
    }

    /// Stops the installed server instance.
    ///
    /// When `deadline` is given, the server is first asked to shut down gracefully, and given up to `deadline` to
    /// acknowledge it. Whether or not it does, the server is then terminated with `reason`.
    pub(crate) async fn terminate_with_deadline(&self, reason: ExitReason, deadline: Option<Duration>) {
        if let Some(deadline) = deadline {
            let (ack_tx, ack_rx) = oneshot::channel();
            let shutdown = ControlMessage::Shutdown {
                reason: reason.clone(),
                ack: ack_tx,
            };
            if self.send(Envelope::Control(shutdown)).is_ok() {
                match timeout(deadline, ack_rx).await {
                    Ok(Ok(())) => debug!(container_id = %self.inner.id, "Server shut down gracefully."),
                    Ok(Err(_)) => debug!(container_id = %self.inner.id, "Server already stopped."),
                    Err(_) => {
                        warn!(container_id = %self.inner.id, ?deadline, "Server did not shut down in time, terminating.")
                    }
                }
            }
        }

        let _ = self.terminate(reason);
    }

    fn send(&self, envelope: Envelope<S>) -> Result<(), ContainerError> {
        let instance = self.read_instance();
        let installed = instance.as_ref().context(NotStarted {
            container_id: &*self.inner.id,
        })?;

        if installed.mailbox.send(envelope).is_err() {
            debug!(container_id = %self.inner.id, process_id = %installed.process.id(), "Server instance stopped, message dropped.");
        }
        Ok(())
    }

    fn request(&self, message: S::Message) -> Result<oneshot::Receiver<S::Reply>, ContainerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Envelope::Application {
            message,
            reply_tx: Some(reply_tx),
        })?;
        Ok(reply_rx)
    }

    fn spawn(&self, process: Process, server_process: ServerProcess<S>) {
        let link = self.inner.link.clone();
        let instance_id = process.id();
        let server = async move {
            let reason = server_process.run().await;
            debug!(%reason, "Server stopped.");
            if let Some(link) = link {
                link.notify(instance_id, reason);
            }
        };
        tokio::spawn(server.into_instrumented(&process));
    }

    fn read_instance(&self) -> std::sync::RwLockReadGuard<'_, Option<InstalledServer<S>>> {
        self.inner.instance.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_instance(&self) -> std::sync::RwLockWriteGuard<'_, Option<InstalledServer<S>>> {
        self.inner.instance.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<ServerProcess<S>>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, Option<S::Config>> {
        self.inner.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_staged(&self) -> std::sync::MutexGuard<'_, Option<ServerInstance<S>>> {
        self.inner.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: GenericServer> Clone for GenericServerContainer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A type-erased worker, as seen by its supervisor.
#[async_trait]
pub(crate) trait SupervisedWorker: Send + Sync {
    fn id(&self) -> &str;

    fn instance_id(&self) -> Option<Id>;

    /// Creates, starts, and initializes the first server instance.
    fn boot(&self) -> Result<(), ContainerError>;

    /// Replaces the server instance with a fresh one.
    fn restart(&self, reason: &ExitReason);

    /// Prepares an initialized replacement for the server instance, without installing it.
    async fn stage_restart(&self);

    /// Installs the replacement prepared by [`stage_restart`][Self::stage_restart].
    fn commit_restart(&self, reason: &ExitReason);

    /// Stops the server instance, honoring the worker's graceful shutdown timeout.
    async fn terminate(&self, reason: ExitReason);

    fn as_any(&self) -> &dyn Any;
}

/// A container paired with the configuration its worker was declared with.
pub(crate) struct SupervisedServer<S: GenericServer> {
    container: GenericServerContainer<S>,
    config: S::Config,
}

impl<S: GenericServer> SupervisedServer<S> {
    pub fn new(container: GenericServerContainer<S>, config: S::Config) -> Self {
        Self { container, config }
    }
}

#[async_trait]
impl<S: GenericServer> SupervisedWorker for SupervisedServer<S> {
    fn id(&self) -> &str {
        self.container.id()
    }

    fn instance_id(&self) -> Option<Id> {
        self.container.instance_id()
    }

    fn boot(&self) -> Result<(), ContainerError> {
        self.container.instantiate();
        self.container.start()?;
        self.container.initialize(self.config.clone())
    }

    fn restart(&self, reason: &ExitReason) {
        let instance = self.container.new_instance();
        self.container.reconfigure(reason, instance);
    }

    async fn stage_restart(&self) {
        self.container.stage_instance().await;
    }

    fn commit_restart(&self, reason: &ExitReason) {
        self.container.install_staged(reason);
    }

    async fn terminate(&self, reason: ExitReason) {
        let deadline = self.container.inner.lifecycle.shutdown_timeout();
        self.container.terminate_with_deadline(reason, deadline).await;
    }

    fn as_any(&self) -> &dyn Any {
        &self.container
    }
}
