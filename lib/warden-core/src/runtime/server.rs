use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt as _;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use warden_error::{ErrorContext as _, GenericError};

use super::link::ExitReason;

/// A replacement for a server's application message handler, installed with a hot-swap.
///
/// Returning `Ok(Some(reply))` answers a pending call, `Ok(None)` sends no reply, and an error fails the worker exactly
/// as an error from [`GenericServer::handle`] would.
pub type HotSwapHandler<S> = Arc<
    dyn Fn(&mut S, <S as GenericServer>::Message) -> Result<Option<<S as GenericServer>::Reply>, GenericError>
        + Send
        + Sync,
>;

/// The behavior of a supervised worker.
///
/// A server handles application messages one at a time, in the order they arrive. Around that, the runtime drives a
/// small control protocol which always takes precedence over application messages:
///
/// - `Init`: calls [`init`][Self::init] with the configuration the worker was started with. This happens once per
///   instance, before any application message, and again for every fresh instance after a restart.
/// - `HotSwap`: replaces the application message handler, or restores [`handle`][Self::handle].
/// - `Shutdown`: calls [`shutdown`][Self::shutdown] and acknowledges it.
/// - `Terminate`: stops the worker unconditionally, with the given exit reason.
///
/// An error returned from `init` or `handle`, or a panic in either, terminates the worker abnormally. Its supervisor
/// observes that as a failure.
#[async_trait]
pub trait GenericServer: Send + 'static {
    /// Application messages accepted by the server.
    type Message: Send + 'static;

    /// Replies produced for calls.
    type Reply: Send + 'static;

    /// Configuration handed to [`init`][Self::init].
    type Config: Clone + Send + Sync + 'static;

    /// Initializes the server.
    ///
    /// # Errors
    ///
    /// If initialization fails, an error is returned and the worker terminates abnormally.
    async fn init(&mut self, config: Self::Config) -> Result<(), GenericError> {
        let _ = config;
        Ok(())
    }

    /// Handles an application message, optionally producing a reply.
    ///
    /// # Errors
    ///
    /// If the message cannot be handled, an error is returned and the worker terminates abnormally.
    async fn handle(&mut self, message: Self::Message) -> Result<Option<Self::Reply>, GenericError>;

    /// Called when the server is asked to shut down gracefully, before it is discarded.
    async fn shutdown(&mut self, reason: &ExitReason) {
        let _ = reason;
    }
}

/// Reserved control messages, kept apart from application messages at the type level.
pub(crate) enum ControlMessage<S: GenericServer> {
    Init {
        config: S::Config,
        ack: Option<oneshot::Sender<()>>,
    },
    HotSwap(Option<HotSwapHandler<S>>),
    Shutdown { reason: ExitReason, ack: oneshot::Sender<()> },
    Terminate(ExitReason),
}

/// A single mailbox entry.
pub(crate) enum Envelope<S: GenericServer> {
    Control(ControlMessage<S>),
    Application {
        message: S::Message,
        reply_tx: Option<oneshot::Sender<S::Reply>>,
    },
}

pub(crate) type Mailbox<S> = mpsc::UnboundedSender<Envelope<S>>;

/// A server instance together with its mailbox, ready to be run.
pub(crate) struct ServerProcess<S: GenericServer> {
    server: S,
    mailbox_rx: mpsc::UnboundedReceiver<Envelope<S>>,
    hot_swap: Option<HotSwapHandler<S>>,
}

impl<S: GenericServer> ServerProcess<S> {
    pub fn new(server: S) -> (Mailbox<S>, Self) {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let process = Self {
            server,
            mailbox_rx,
            hot_swap: None,
        };
        (mailbox_tx, process)
    }

    /// Runs the server until it terminates, returning why it did.
    ///
    /// Panics raised by the server are caught and reported as [`ExitReason::Panicked`].
    pub async fn run(self) -> ExitReason {
        match AssertUnwindSafe(self.run_inner()).catch_unwind().await {
            Ok(reason) => reason,
            Err(_) => ExitReason::Panicked,
        }
    }

    async fn run_inner(mut self) -> ExitReason {
        while let Some(envelope) = self.mailbox_rx.recv().await {
            match envelope {
                Envelope::Control(control) => {
                    if let Some(reason) = self.handle_control(control).await {
                        return reason;
                    }
                }
                Envelope::Application { message, reply_tx } => {
                    let result = match self.hot_swap.clone() {
                        Some(handler) => handler(&mut self.server, message),
                        None => self.server.handle(message).await,
                    };

                    match result {
                        Ok(Some(reply)) => {
                            // The caller may have stopped waiting; a late reply is simply dropped.
                            if let Some(reply_tx) = reply_tx {
                                let _ = reply_tx.send(reply);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => return ExitReason::failed(e),
                    }
                }
            }
        }

        // Every sender is gone: the container replaced or dropped this instance.
        debug!("Mailbox closed, server stopping.");
        ExitReason::Normal
    }

    async fn handle_control(&mut self, control: ControlMessage<S>) -> Option<ExitReason> {
        match control {
            ControlMessage::Init { config, ack } => {
                if let Err(e) = self.server.init(config).await.error_context("Server failed to initialize.") {
                    warn!(error = %e, "Server initialization failed.");
                    return Some(ExitReason::failed(e));
                }
                debug!("Server initialized.");
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            ControlMessage::HotSwap(handler) => {
                debug!(restored = handler.is_none(), "Swapping application message handler.");
                self.hot_swap = handler;
            }
            ControlMessage::Shutdown { reason, ack } => {
                debug!(%reason, "Server shutting down gracefully.");
                self.server.shutdown(&reason).await;
                let _ = ack.send(());
            }
            ControlMessage::Terminate(reason) => {
                debug!(%reason, "Server terminated.");
                return Some(reason);
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use tokio::time::{timeout, Duration};
    use warden_error::generic_error;

    use super::*;

    /// Messages understood by [`Recorder`].
    #[derive(Debug)]
    pub enum Command {
        Ping,
        Crash,
        Panic,
        Echo(String),
        Silent,
        Slow(Duration),
        Ready,
    }

    /// Shared, ordered log of tagged events emitted by test servers.
    #[derive(Clone, Default)]
    pub struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        pub fn push(&self, event: impl Into<String>) {
            self.0.lock().unwrap().push(event.into());
        }

        pub fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        pub fn count(&self, event: &str) -> usize {
            self.0.lock().unwrap().iter().filter(|e| *e == event).count()
        }
    }

    /// A test server that records its lifecycle in an [`EventLog`].
    pub struct Recorder {
        pub tag: &'static str,
        pub log: EventLog,
        pub fail_init: bool,
        pub initialized: bool,
    }

    impl Recorder {
        pub fn new(tag: &'static str, log: &EventLog) -> Self {
            Self {
                tag,
                log: log.clone(),
                fail_init: false,
                initialized: false,
            }
        }
    }

    #[async_trait]
    impl GenericServer for Recorder {
        type Message = Command;
        type Reply = String;
        type Config = ();

        async fn init(&mut self, _: ()) -> Result<(), GenericError> {
            self.log.push(format!("{}:init", self.tag));
            if self.fail_init {
                return Err(generic_error!("{} refused to initialize", self.tag));
            }
            self.initialized = true;
            Ok(())
        }

        async fn handle(&mut self, message: Command) -> Result<Option<String>, GenericError> {
            match message {
                Command::Ping => Ok(Some("pong".to_string())),
                Command::Crash => Err(generic_error!("{} crashed", self.tag)),
                Command::Panic => panic!("{} panicked", self.tag),
                Command::Echo(s) => Ok(Some(s)),
                Command::Silent => Ok(None),
                Command::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(Some("slow".to_string()))
                }
                Command::Ready => Ok(Some(if self.initialized { "ready" } else { "uninitialized" }.to_string())),
            }
        }

        async fn shutdown(&mut self, _: &ExitReason) {
            self.log.push(format!("{}:shutdown", self.tag));
        }
    }

    fn call(mailbox: &Mailbox<Recorder>, message: Command) -> oneshot::Receiver<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = mailbox.send(Envelope::Application {
            message,
            reply_tx: Some(reply_tx),
        });
        reply_rx
    }

    #[tokio::test]
    async fn init_runs_before_application_messages() {
        let log = EventLog::default();
        let (mailbox, process) = ServerProcess::new(Recorder::new("a", &log));
        let handle = tokio::spawn(process.run());

        mailbox
            .send(Envelope::Control(ControlMessage::Init { config: (), ack: None }))
            .unwrap();
        let reply = call(&mailbox, Command::Ping).await.unwrap();
        assert_eq!(reply, "pong");
        assert_eq!(log.events(), vec!["a:init"]);

        mailbox
            .send(Envelope::Control(ControlMessage::Terminate(ExitReason::Shutdown)))
            .unwrap();
        let reason = handle.await.unwrap();
        assert!(matches!(reason, ExitReason::Shutdown));
    }

    #[tokio::test]
    async fn handler_error_fails_the_server() {
        let log = EventLog::default();
        let (mailbox, process) = ServerProcess::new(Recorder::new("a", &log));
        let handle = tokio::spawn(process.run());

        let reply_rx = call(&mailbox, Command::Crash);
        let reason = handle.await.unwrap();

        assert!(matches!(reason, ExitReason::Failed(_)));
        assert!(reply_rx.await.is_err(), "crashed call must never be answered");
    }

    #[tokio::test]
    async fn panics_are_reported_as_exit_reason() {
        let log = EventLog::default();
        let (mailbox, process) = ServerProcess::new(Recorder::new("a", &log));
        let handle = tokio::spawn(process.run());

        let _ = call(&mailbox, Command::Panic);
        assert!(matches!(handle.await.unwrap(), ExitReason::Panicked));
    }

    #[tokio::test]
    async fn init_is_acknowledged_only_on_success() {
        let log = EventLog::default();
        let (mailbox, process) = ServerProcess::new(Recorder::new("a", &log));
        let _handle = tokio::spawn(process.run());

        let (ack_tx, ack_rx) = oneshot::channel();
        mailbox
            .send(Envelope::Control(ControlMessage::Init {
                config: (),
                ack: Some(ack_tx),
            }))
            .unwrap();
        timeout(Duration::from_secs(1), ack_rx).await.unwrap().unwrap();
        assert_eq!(call(&mailbox, Command::Ready).await.unwrap(), "ready");

        let mut recorder = Recorder::new("b", &log);
        recorder.fail_init = true;
        let (mailbox, process) = ServerProcess::new(recorder);
        let handle = tokio::spawn(process.run());

        let (ack_tx, ack_rx) = oneshot::channel();
        mailbox
            .send(Envelope::Control(ControlMessage::Init {
                config: (),
                ack: Some(ack_tx),
            }))
            .unwrap();
        assert!(ack_rx.await.is_err(), "failed init must not be acknowledged");
        assert!(matches!(handle.await.unwrap(), ExitReason::Failed(_)));
    }

    #[tokio::test]
    async fn init_failure_fails_the_server() {
        let log = EventLog::default();
        let mut recorder = Recorder::new("a", &log);
        recorder.fail_init = true;
        let (mailbox, process) = ServerProcess::new(recorder);
        let handle = tokio::spawn(process.run());

        mailbox
            .send(Envelope::Control(ControlMessage::Init { config: (), ack: None }))
            .unwrap();
        assert!(matches!(handle.await.unwrap(), ExitReason::Failed(_)));
    }

    #[tokio::test]
    async fn shutdown_is_acknowledged_and_server_keeps_running() {
        let log = EventLog::default();
        let (mailbox, process) = ServerProcess::new(Recorder::new("a", &log));
        let _handle = tokio::spawn(process.run());

        let (ack_tx, ack_rx) = oneshot::channel();
        mailbox
            .send(Envelope::Control(ControlMessage::Shutdown {
                reason: ExitReason::Shutdown,
                ack: ack_tx,
            }))
            .unwrap();
        timeout(Duration::from_secs(1), ack_rx).await.unwrap().unwrap();
        assert_eq!(log.events(), vec!["a:shutdown"]);

        // Only `Terminate` stops the server.
        assert_eq!(call(&mailbox, Command::Ping).await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn hot_swap_replaces_and_restores_handler() {
        let log = EventLog::default();
        let (mailbox, process) = ServerProcess::new(Recorder::new("a", &log));
        let _handle = tokio::spawn(process.run());

        let shouting: HotSwapHandler<Recorder> = Arc::new(|_: &mut Recorder, message: Command| match message {
            Command::Echo(s) => Ok(Some(s.to_uppercase())),
            _ => Ok(Some("unsupported".to_string())),
        });

        assert_eq!(call(&mailbox, Command::Echo("hi".into())).await.unwrap(), "hi");

        mailbox
            .send(Envelope::Control(ControlMessage::HotSwap(Some(shouting))))
            .unwrap();
        assert_eq!(call(&mailbox, Command::Echo("hi".into())).await.unwrap(), "HI");
        assert_eq!(call(&mailbox, Command::Ping).await.unwrap(), "unsupported");

        mailbox.send(Envelope::Control(ControlMessage::HotSwap(None))).unwrap();
        assert_eq!(call(&mailbox, Command::Echo("hi".into())).await.unwrap(), "hi");
        assert_eq!(call(&mailbox, Command::Ping).await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn closed_mailbox_stops_server_normally() {
        let log = EventLog::default();
        let (mailbox, process) = ServerProcess::new(Recorder::new("a", &log));
        let handle = tokio::spawn(process.run());

        drop(mailbox);
        assert!(matches!(handle.await.unwrap(), ExitReason::Normal));
    }
}
