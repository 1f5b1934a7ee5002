use std::{
    fmt,
    future::Future,
    ops::Deref,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    task::{Context, Poll},
};

use pin_project::pin_project;
use tracing::{debug_span, instrument::Instrumented, Instrument as _};

static NEXT_PROCESS_ID: AtomicUsize = AtomicUsize::new(0);

/// Process identifier.
///
/// Every server instance and every supervisor gets a fresh identifier when it is created, so a restarted worker can be
/// told apart from the instance it replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Id(usize);

impl Id {
    fn next() -> Self {
        Self(NEXT_PROCESS_ID.fetch_add(1, Relaxed))
    }

    /// Returns the identifier as a plain integer.
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// Process name.
///
/// Names are scoped: a worker named `echo` under a supervisor named `root_sup` is named `root_sup.echo`. Each segment
/// only contains alphanumeric characters and underscores; anything else is replaced with an underscore.
///
/// Not guaranteed to be unique.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Name(Arc<str>);

impl Name {
    pub(crate) fn root(name: &str) -> Option<Self> {
        sanitize_segment(name).map(Self)
    }

    /// Name used for processes whose identifier cannot be turned into a valid name.
    pub(crate) fn anonymous() -> Self {
        Self("anonymous".into())
    }

    pub(crate) fn scoped(parent: &Name, name: &str) -> Option<Self> {
        let segment = sanitize_segment(name)?;
        Some(Self(format!("{}.{}", parent.0, segment).into()))
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A runtime process: an identifier paired with a name.
#[derive(Clone, Debug)]
pub(crate) struct Process {
    id: Id,
    name: Name,
}

impl Process {
    /// Creates a process for a supervisor, nested under `parent` if given.
    pub fn supervisor(name: &str, parent: Option<&Process>) -> Option<Self> {
        let name = match parent {
            Some(parent) => Name::scoped(&parent.name, name)?,
            None => Name::root(name)?,
        };
        Some(Self::named(name))
    }

    /// Creates a process with a fresh identifier and the given name.
    ///
    /// Used for every new instance of the same worker, which share a name but never an identifier.
    pub fn named(name: Name) -> Self {
        Self { id: Id::next(), name }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &Name {
        &self.name
    }
}

/// A future running as a process, wrapped in a span carrying the process identity.
#[pin_project]
pub(crate) struct InstrumentedProcess<F> {
    #[pin]
    inner: Instrumented<F>,
}

impl<F: Future> Future for InstrumentedProcess<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

/// Helper trait for running futures as instrumented processes.
pub(crate) trait ProcessExt: Future + Sized {
    fn into_instrumented(self, process: &Process) -> InstrumentedProcess<Self> {
        let span = debug_span!(
            "process",
            process_id = process.id().as_usize(),
            process_name = &**process.name(),
        );
        InstrumentedProcess {
            inner: self.instrument(span),
        }
    }
}

impl<F: Future> ProcessExt for F {}

fn is_valid_segment(name: &str) -> bool {
    name.starts_with(|c: char| c.is_alphanumeric())
        && name.ends_with(|c: char| c.is_alphanumeric())
        && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn sanitize_segment(name: &str) -> Option<Arc<str>> {
    if is_valid_segment(name) {
        return Some(name.into());
    }

    // Collapse every run of invalid characters (and underscores) into a single underscore, then trim the edges.
    let mut sanitized = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_separator && !sanitized.is_empty() {
                sanitized.push('_');
            }
            pending_separator = false;
            sanitized.push(c);
        } else {
            pending_separator = true;
        }
    }

    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_names_are_sanitized() {
        let cases = [
            ("root_sup", Some("root_sup")),
            ("echo", Some("echo")),
            ("echo.", Some("echo")),
            ("_echo_", Some("echo")),
            ("echo-server", Some("echo_server")),
            ("--echo_1", Some("echo_1")),
            ("echo server", Some("echo_server")),
            ("echo===1", Some("echo_1")),
            ("inner.echo", Some("inner_echo")),
            ("---", None),
            ("", None),
        ];

        for (input, expected) in cases {
            let name = Name::root(input);
            assert_eq!(name.as_deref(), expected, "input: {:?}", input);
        }
    }

    #[test]
    fn scoped_names_nest_under_parent() {
        let parent = Name::root("root_sup").unwrap();
        let cases = [
            ("echo", Some("root_sup.echo")),
            ("inner-sup", Some("root_sup.inner_sup")),
            ("nested.echo", Some("root_sup.nested_echo")),
            ("", None),
        ];

        for (input, expected) in cases {
            let name = Name::scoped(&parent, input);
            assert_eq!(name.as_deref(), expected, "input: {:?}", input);
        }
    }

    #[test]
    fn instances_of_the_same_name_get_distinct_ids() {
        let name = Name::root("echo").unwrap();
        let first = Process::named(name.clone());
        let second = Process::named(name);

        assert_eq!(first.name(), second.name());
        assert_ne!(first.id(), second.id());
    }
}
