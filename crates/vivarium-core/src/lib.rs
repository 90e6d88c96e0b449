//! Core library for the vivarium agent runtime kernel.
//!
//! This crate contains everything the kernel daemon needs short of an
//! event loop: the binary wire protocol, the permission engine, and the
//! in-kernel services (state store, mailboxes, event bus, audit log,
//! execution log, async task manager, world simulation).
//!
//! Every service is a plain value with its own interior lock. The
//! daemon owns one instance of each and hands handlers shared
//! references; no service holds a pointer back to the kernel.

pub mod audit;
pub mod error;
pub mod events;
pub mod execution;
pub mod glob;
pub mod mailbox;
pub mod permissions;
pub mod protocol;
pub mod restart;
pub mod state;
pub mod tasks;
pub mod world;

pub use error::KernelError;
