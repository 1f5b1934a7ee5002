//! Core primitives for building supervised, fault-tolerant services.
#![deny(missing_docs)]

pub mod runtime;
