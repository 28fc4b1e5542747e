//! Distributed load tests: one manager, many workers.
//!
//! The manager listens for WebSocket connections. Each worker opens one long-lived
//! connection and subscribes with its id; from then on the manager pushes [`Event`]s
//! down that connection: plan and stage changes, pings, and requests for statistics.
//! Statistics go back on separate short-lived connections, one per batch, and are
//! answered with a [`SubmitResult`].
//!
//! [`Event`]: common::Event
//! [`SubmitResult`]: common::SubmitResult

pub mod agent;
pub mod common;
pub(crate) mod manager;
pub mod supervisor;
pub mod worker;
