//! The delivery core.
//!
//! A dispatch request enters at the [`courier::Courier`], which expands the
//! recipient into one queued [`queue::Job`] and one [`types::Message`] per
//! mail target. Every instance runs a pool of [`worker::DeliveryWorker`]s
//! (sized by [`generator::WorkerGenerator`]) draining the shared queue,
//! skipping users who opted out (see [`preferences`]), and
//! instance 0 additionally runs the [`gc::MessageGc`] sweep.
//!
//! [`types::Message`]: herald_common::types::Message

pub mod courier;
pub mod cryptography;
pub mod gc;
pub mod generator;
pub mod loader;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod messages;
pub mod preferences;
pub mod queue;
pub mod templates;
pub mod worker;
