//! Tallier accumulates statgrams and forwards them to graphite.
//!
//! A pool of receiver workers shares one UDP socket, each parsing
//! datagrams into its own [`snapshot::Snapshot`]. On a fixed interval the
//! flush loop pulses every worker through a control rendezvous, folds the
//! collected snapshots into one, ships the result to a graphite (carbon)
//! server, and notifies an external watchdog that we are still alive. A
//! small status server exposes the tracked string frequencies read-only.
//!
//! Datagram delivery is best effort by design: UDP is lossy, nothing is
//! persisted across restarts, and senders are not authenticated.

pub mod config;
pub mod frequency;
pub mod graphite;
pub mod harold;
pub mod multilevel;
pub mod receiver;
pub mod server;
pub mod snapshot;
pub mod status;
