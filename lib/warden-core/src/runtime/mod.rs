//! Runtime system.
//!
//! This module contains the supervision engine: generic servers, the containers that own them, and the supervisors
//! that restart them when they fail. It is directly inspired by
//! [Erlang/OTP](https://www.erlang.org/docs/28/system/design_principles#supervision-trees).
//!
//! To quote the Erlang/OTP documentation:
//!
//! > Workers are processes that perform computations and other actual work. Supervisors are processes that monitor
//! > workers. A supervisor can restart a worker if something goes wrong. The supervision tree is a hierarchical
//! > arrangement of code into supervisors and workers, which makes it possible to design and program fault-tolerant
//! > software.
//!
//! # Processes
//!
//! Every worker instance and every supervisor runs as an independent asynchronous task on a Tokio runtime, which we
//! refer to as a **process.** Each process has a unique numerical identifier and a semi-unique, scoped name, and runs
//! inside a `tracing` span carrying both.
//!
//! # Servers and containers
//!
//! Workers implement [`GenericServer`]: they handle application messages one at a time from a mailbox, and are driven
//! through their lifecycle by a small set of reserved control messages. Client code never talks to a server instance
//! directly, but to its [`GenericServerContainer`], which survives restarts of the worker by swapping in fresh
//! instances.
//!
//! # Supervisors
//!
//! A [`Supervisor`] is built from a [`SupervisorConfig`]: a [`RestartStrategy`], and an ordered list of children, each
//! either a worker ([`WorkerSpec`]) or a nested supervisor. When a child fails, the supervisor either restarts it
//! (or, under [`RestartScheme::AllForOne`], all of its children), or, once its restart budget is exhausted, gives up
//! and fails itself. A failed nested supervisor is just another failed child to its parent, so failures are handled
//! at the lowest level of the tree that still has budget left.
//!
//! # Examples
//!
//! See the `basic_supervisor` example which shows how supervisors and workers are composed together, as well as how
//! failed workers and supervisors are restarted.

mod container;
pub use self::container::{ContainerError, GenericServerContainer};

mod link;
pub use self::link::ExitReason;

mod process;
pub use self::process::Id;

mod restart;
pub use self::restart::{PostRestartHook, RestartReport, RestartScheme, RestartStrategy};

mod server;
pub use self::server::{GenericServer, HotSwapHandler};

mod child;
pub use self::child::{ChildSpecification, LifeCycle, LifeCycleKind, SupervisorConfig, WorkerSpec};

mod supervisor;
pub use self::supervisor::{Supervisor, SupervisorError, SupervisorFactory};
