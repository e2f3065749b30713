//! The flush loop.
//!
//! [`Server::run`] binds the statgram socket, spins up the worker pool
//! and the status server, and then paces the daemon: every flush
//! interval it drains the workers into one folded snapshot, stamps
//! process telemetry, ships the report to graphite, pulses the harold
//! heartbeat, publishes the status view, and opens the next window.
//!
//! Graphite emission retries every second until it lands. The completed
//! snapshot is held in memory across retries, so a downstream outage
//! delays reporting without losing observations.
//!
//! ## Log events
//!
//! `listening for statgrams`: the UDP socket is bound.
//! `running`: the flush loop has started.
//! `sending snapshot with N stats to graphite`: one emission attempt.
//! `failed to send graphite report`: the attempt failed; retrying in 1s.
//! `shutdown signal received`: the loop is stopping; the status server
//! drains before `run` returns.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::graphite::{Dial, Graphite, TcpDial};
use crate::harold::{heart_monitor, Harold};
use crate::receiver::WorkerPool;
use crate::snapshot::Snapshot;
use crate::status::{Status, StringsView, STRINGS_PAGE_LIMIT};

/// How long to wait between graphite retries.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Errors produced by [`Server`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Generic IO error; binding the statgram socket is the usual source.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The daemon: receiver pool, flush loop, and egress clients.
#[derive(Debug)]
pub struct Server<D: Dial = TcpDial> {
    config: Config,
    graphite: Graphite<D>,
    harold: Option<Harold>,
}

impl<D: Dial + 'static> Server<D> {
    #[must_use]
    pub fn new(config: Config, graphite: Graphite<D>, harold: Option<Harold>) -> Self {
        Self {
            config,
            graphite,
            harold,
        }
    }

    /// Run the daemon until a shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Returns an error when startup fails: the statgram socket cannot be
    /// bound. Once the flush loop is running it only returns on shutdown,
    /// after the status server has drained its connections.
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) -> Result<(), Error> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let socket = tokio::net::UdpSocket::bind(bind_addr).await?;
        info!("listening for statgrams on {}", socket.local_addr()?);

        let string_count_intervals = self.config.string_count_intervals();
        let pool = WorkerPool::spawn_udp(
            Arc::new(socket),
            self.config.num_workers,
            &string_count_intervals,
        );

        let heartbeats = self.harold.take().map(|harold| {
            let tag = self
                .config
                .harold
                .as_ref()
                .map_or_else(|| "tallier".to_owned(), |conf| conf.tag.clone());
            heart_monitor(harold, tag)
        });

        let (view_tx, view_rx) = watch::channel(Arc::new(StringsView::default()));
        let status = Status::new(self.config.status_addr(), view_rx, shutdown.clone());
        let status_task = tokio::spawn(async move {
            if let Err(err) = status.run().await {
                error!("status server failed: {err}");
            }
        });

        info!("running");
        let flush_interval = self.config.flush_interval();
        let mut snapshot = Snapshot::new(string_count_intervals);
        snapshot.start = SystemTime::now();
        let mut ticks = tokio::time::interval(flush_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately.
        ticks.tick().await;
        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = shutdown.changed() => {
                    info!("shutdown signal received");
                    break;
                }
            }
            pool.drain_into(&mut snapshot).await;
            let next_start = SystemTime::now();
            stamp_process_telemetry(&mut snapshot);
            send_with_retry(&self.graphite, &mut snapshot).await;
            if let Some(heartbeats) = &heartbeats {
                let _ = heartbeats.send(flush_interval * 3).await;
            }
            view_tx.send_replace(Arc::new(StringsView::build(&snapshot, STRINGS_PAGE_LIMIT)));
            snapshot.flush();
            snapshot.start = next_start;
        }

        let _ = status_task.await;
        Ok(())
    }
}

/// Submit a report, retrying every [`RETRY_DELAY`] until the write lands.
/// The snapshot is held untouched across attempts.
pub async fn send_with_retry<D: Dial>(graphite: &Graphite<D>, snapshot: &mut Snapshot) {
    loop {
        info!(
            "sending snapshot with {} stats to graphite",
            snapshot.num_stats()
        );
        match graphite.send_report(snapshot).await {
            Ok(()) => return,
            Err(err) => {
                error!("failed to send graphite report: {err}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

fn stamp_process_telemetry(snapshot: &mut Snapshot) {
    // Workers that participated in this window, not the configured pool
    // size: a worker that drained away stops being counted.
    snapshot.report("tallier.num_workers", snapshot.num_children() as f64);
    snapshot.report("tallier.num_stats", snapshot.num_stats() as f64);
    stamp_memory(snapshot);
}

#[cfg(target_os = "linux")]
fn stamp_memory(snapshot: &mut Snapshot) {
    let Ok(me) = procfs::process::Process::myself() else {
        return;
    };
    let Ok(statm) = me.statm() else {
        return;
    };
    let page_size = procfs::page_size();
    snapshot.report("tallier.mem.virtual", (statm.size * page_size) as f64);
    snapshot.report("tallier.mem.resident", (statm.resident * page_size) as f64);
}

#[cfg(not(target_os = "linux"))]
fn stamp_memory(_snapshot: &mut Snapshot) {}
