use std::{fmt, sync::Arc};

use tokio::sync::mpsc;
use tracing::debug;
use warden_error::GenericError;

use super::{child::LifeCycleKind, process::Id};

/// Why a process stopped.
#[derive(Clone, Debug)]
pub enum ExitReason {
    /// The process ran out of work and stopped on its own.
    Normal,

    /// The process was asked to stop as part of an orderly shutdown.
    Shutdown,

    /// The process failed with an error.
    Failed(Arc<GenericError>),

    /// The process panicked.
    Panicked,
}

impl ExitReason {
    /// Creates a failure reason from the given error.
    pub fn failed<E: Into<GenericError>>(error: E) -> Self {
        Self::Failed(Arc::new(error.into()))
    }

    /// Returns `true` if the process stopped without error.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Normal | Self::Shutdown)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Failed(e) => write!(f, "failed: {:#}", e),
            Self::Panicked => f.write_str("panicked"),
        }
    }
}

/// A child-failed event, delivered from a child to its supervisor and nowhere else.
#[derive(Debug)]
pub(crate) struct ChildExit {
    /// Position of the child in its supervisor's configuration.
    pub child_idx: usize,

    /// The instance that exited.
    pub instance: Id,

    pub reason: ExitReason,
}

/// The link between a child and its supervisor.
///
/// Lifecycle filtering happens here: exits that the child's lifecycle policy says must not be restarted never reach
/// the supervisor.
#[derive(Clone)]
pub(crate) struct ExitLink {
    child_idx: usize,
    child_id: Arc<str>,
    policy: LifeCycleKind,
    signals_tx: mpsc::UnboundedSender<ChildExit>,
}

impl ExitLink {
    pub fn new(
        child_idx: usize, child_id: &str, policy: LifeCycleKind, signals_tx: mpsc::UnboundedSender<ChildExit>,
    ) -> Self {
        Self {
            child_idx,
            child_id: child_id.into(),
            policy,
            signals_tx,
        }
    }

    /// Reports that `instance` exited with `reason`.
    pub fn notify(&self, instance: Id, reason: ExitReason) {
        if !self.policy.should_restart(&reason) {
            debug!(child_id = %self.child_id, process_id = %instance, %reason, policy = ?self.policy, "Child exit filtered by lifecycle policy.");
            return;
        }

        let exit = ChildExit {
            child_idx: self.child_idx,
            instance,
            reason,
        };
        if self.signals_tx.send(exit).is_err() {
            debug!(child_id = %self.child_id, process_id = %instance, "Supervisor no longer listening for child exits.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::process::{Name, Process};

    fn instance_id() -> Id {
        Process::named(Name::root("child").unwrap()).id()
    }

    #[test]
    fn clean_reasons() {
        assert!(ExitReason::Normal.is_clean());
        assert!(ExitReason::Shutdown.is_clean());
        assert!(!ExitReason::Panicked.is_clean());
        assert!(!ExitReason::failed(warden_error::generic_error!("boom")).is_clean());
    }

    #[test]
    fn permanent_forwards_every_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = ExitLink::new(2, "child", LifeCycleKind::Permanent, tx);

        link.notify(instance_id(), ExitReason::Normal);
        link.notify(instance_id(), ExitReason::Panicked);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.child_idx, 2);
        assert!(first.reason.is_clean());
        assert!(matches!(rx.try_recv().unwrap().reason, ExitReason::Panicked));
    }

    #[test]
    fn transient_drops_clean_exits() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = ExitLink::new(0, "child", LifeCycleKind::Transient, tx);

        link.notify(instance_id(), ExitReason::Shutdown);
        assert!(rx.try_recv().is_err());

        link.notify(instance_id(), ExitReason::failed(warden_error::generic_error!("boom")));
        assert!(matches!(rx.try_recv().unwrap().reason, ExitReason::Failed(_)));
    }

    #[test]
    fn temporary_drops_every_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = ExitLink::new(0, "child", LifeCycleKind::Temporary, tx);

        link.notify(instance_id(), ExitReason::Normal);
        link.notify(instance_id(), ExitReason::Panicked);
        assert!(rx.try_recv().is_err());
    }
}
