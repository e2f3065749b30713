//! Receiver workers and the control rendezvous.
//!
//! Workers share one UDP read end; the kernel hands each datagram to
//! exactly one of them, so no locking is needed beyond the shared socket
//! handle. Each worker owns a parser and a [`Snapshot`] outright. The
//! flush layer collects those snapshots by pulsing a control channel: the
//! worker stamps its traffic deltas, hands the snapshot back over the
//! pulse's reply channel, and carries on with a fresh one.
//!
//! ## Log events
//!
//! `end of statgram stream`: the packet source closed; the worker drains
//! its snapshot through one last pulse and exits.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use tallier_statgram::{Parser, Statgram};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::snapshot::Snapshot;

/// Largest datagram a receiver will accept.
pub const STATGRAM_MAXSIZE: usize = 10_240;
/// How many parsed statgrams may queue between a reader and its worker.
pub const STATGRAM_CHANNEL_BUFSIZE: usize = 1024;

/// A source of datagrams. The UDP socket is the real one; tests feed
/// workers through an in-memory channel instead.
pub trait Packets: Send + 'static {
    /// Receive one datagram into `buf`, resolving to its length, or to
    /// `None` when the source is exhausted.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<Option<usize>>> + Send;
}

/// The shared UDP read end.
#[derive(Debug, Clone)]
pub struct UdpPackets(Arc<tokio::net::UdpSocket>);

impl UdpPackets {
    #[must_use]
    pub fn new(socket: Arc<tokio::net::UdpSocket>) -> Self {
        Self(socket)
    }
}

impl Packets for UdpPackets {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let (size, _peer) = self.0.recv_from(buf).await?;
        Ok(Some(size))
    }
}

/// An in-memory packet source backed by a channel. Dropping the sender
/// ends the stream, which is how tests exercise worker drain.
#[derive(Debug)]
pub struct ChannelPackets(pub mpsc::Receiver<Vec<u8>>);

impl Packets for ChannelPackets {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.0.recv().await {
            Some(datagram) => {
                let size = datagram.len().min(buf.len());
                buf[..size].copy_from_slice(&datagram[..size]);
                Ok(Some(size))
            }
            None => Ok(None),
        }
    }
}

/// Raw traffic counters shared between a reader and its worker. The
/// reader increments; the worker reads totals to stamp per-pulse deltas.
#[derive(Debug, Default)]
pub struct Traffic {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl Traffic {
    fn record(&self, bytes: u64) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total messages and bytes received so far.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (
            self.messages.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// One worker's read half: a packet source, a reusable parser, and the
/// traffic counters.
#[derive(Debug)]
pub struct Receiver<S> {
    source: S,
    parser: Parser,
    buf: Box<[u8]>,
    traffic: Arc<Traffic>,
}

impl<S: Packets> Receiver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            parser: Parser::new(),
            buf: vec![0u8; STATGRAM_MAXSIZE].into_boxed_slice(),
            traffic: Arc::new(Traffic::default()),
        }
    }

    /// The traffic counters this receiver increments.
    #[must_use]
    pub fn traffic(&self) -> Arc<Traffic> {
        Arc::clone(&self.traffic)
    }

    /// Block for one datagram and parse it into `out`, which may come back
    /// empty: parse errors are swallowed. Resolves to `false` once the
    /// source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns any error the underlying packet source reports.
    pub async fn read_once(&mut self, out: &mut Statgram) -> io::Result<bool> {
        match self.source.recv(&mut self.buf).await? {
            Some(size) => {
                self.traffic.record(size as u64);
                self.parser.parse_into(&self.buf[..size], out);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Spin off a task that reads and parses datagrams for as long as the
    /// source lasts. Returns the statgram stream plus a recycle channel:
    /// the consumer hands each spent statgram arena back through it.
    /// Exactly two arenas exist: the reader parses into one while the
    /// consumer owns the other, and once both are downstream the reader
    /// waits for an arena to come back rather than allocating. The
    /// recycle channel holds both arenas, so returning one never fails.
    #[must_use]
    pub fn into_statgrams(mut self) -> (mpsc::Receiver<Statgram>, mpsc::Sender<Statgram>) {
        let (statgram_tx, statgram_rx) = mpsc::channel(STATGRAM_CHANNEL_BUFSIZE);
        let (recycle_tx, mut recycle_rx) = mpsc::channel::<Statgram>(2);
        tokio::spawn(async move {
            let mut arenas = vec![Statgram::new(), Statgram::new()];
            loop {
                let mut arena = match arenas.pop() {
                    Some(arena) => arena,
                    None => match recycle_rx.recv().await {
                        Some(spent) => spent,
                        None => break,
                    },
                };
                match self.read_once(&mut arena).await {
                    Ok(true) => {
                        if statgram_tx.send(arena).await.is_err() {
                            break;
                        }
                    }
                    Ok(false) => break,
                    Err(err) => {
                        error!("statgram read failed: {err}");
                        break;
                    }
                }
            }
        });
        (statgram_rx, recycle_tx)
    }
}

/// One control pulse: the worker answers with its current snapshot.
#[derive(Debug)]
pub struct Pulse {
    pub reply: oneshot::Sender<Snapshot>,
}

/// Spin off a worker that accumulates statgrams from `source` into its
/// own snapshot and answers control pulses with a snapshot handoff.
///
/// Each pulse also stamps the worker's traffic since the previous pulse
/// as `tallier.messages.child_<id>` and `tallier.bytes.child_<id>`.
/// Optional notifier channels observe every processed statgram so tests
/// can rendezvous with the worker.
pub fn spawn_worker<S: Packets>(
    id: usize,
    source: S,
    string_count_intervals: Vec<Duration>,
    notifiers: Vec<mpsc::Sender<Statgram>>,
) -> mpsc::Sender<Pulse> {
    let receiver = Receiver::new(source);
    let traffic = receiver.traffic();
    let (control_tx, mut control_rx) = mpsc::channel::<Pulse>(1);
    let (mut statgrams, recycle) = receiver.into_statgrams();
    tokio::spawn(async move {
        let messages_key = format!("tallier.messages.child_{id}");
        let bytes_key = format!("tallier.bytes.child_{id}");
        let mut snapshot = Snapshot::new(string_count_intervals.clone());
        let (mut last_messages, mut last_bytes) = (0u64, 0u64);
        let mut draining = false;
        loop {
            tokio::select! {
                statgram = statgrams.recv(), if !draining => match statgram {
                    Some(statgram) => {
                        snapshot.process_statgram(&statgram);
                        for notifier in &notifiers {
                            let _ = notifier.send(statgram.clone()).await;
                        }
                        // The recycle channel is sized for every arena in
                        // existence; this only errs once the reader is gone.
                        let _ = recycle.try_send(statgram);
                    }
                    None => {
                        info!("end of statgram stream");
                        if snapshot.num_stats() == 0 {
                            break;
                        }
                        draining = true;
                    }
                },
                pulse = control_rx.recv() => match pulse {
                    Some(pulse) => {
                        let (messages, bytes) = traffic.totals();
                        snapshot.count(&messages_key, (messages - last_messages) as f64);
                        snapshot.count(&bytes_key, (bytes - last_bytes) as f64);
                        (last_messages, last_bytes) = (messages, bytes);
                        let fresh = Snapshot::new(string_count_intervals.clone());
                        let _ = pulse.reply.send(std::mem::replace(&mut snapshot, fresh));
                        if draining {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    control_tx
}

/// The fan-out/fan-in side of the control rendezvous: owns one control
/// channel per worker and folds their snapshots on demand.
#[derive(Debug)]
pub struct WorkerPool {
    controls: Vec<mpsc::Sender<Pulse>>,
}

impl WorkerPool {
    /// Spin up `num_workers` workers sharing `socket`.
    #[must_use]
    pub fn spawn_udp(
        socket: Arc<tokio::net::UdpSocket>,
        num_workers: usize,
        string_count_intervals: &[Duration],
    ) -> Self {
        let controls = (0..num_workers)
            .map(|id| {
                spawn_worker(
                    id,
                    UdpPackets::new(Arc::clone(&socket)),
                    string_count_intervals.to_vec(),
                    Vec::new(),
                )
            })
            .collect();
        Self { controls }
    }

    /// Assemble a pool from already-spawned workers.
    #[must_use]
    pub fn from_controls(controls: Vec<mpsc::Sender<Pulse>>) -> Self {
        Self { controls }
    }

    /// The number of workers this pool pulses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Pulse every worker and fold the collected snapshots into
    /// `snapshot`, then stamp its duration. Replies arrive in any order;
    /// the fold is order-insensitive up to timing concatenation, which is
    /// sorted at reporting time. Workers that have already exited are
    /// skipped.
    pub async fn drain_into(&self, snapshot: &mut Snapshot) {
        let mut replies = Vec::with_capacity(self.controls.len());
        for control in &self.controls {
            let (reply, rx) = oneshot::channel();
            if control.send(Pulse { reply }).await.is_ok() {
                replies.push(rx);
            }
        }
        for reply in join_all(replies).await {
            if let Ok(child) = reply {
                snapshot.aggregate(child);
            }
        }
        snapshot.duration = SystemTime::now()
            .duration_since(snapshot.start)
            .unwrap_or_default();
    }
}

#[cfg(test)]
mod test {
    use tallier_statgram::{Kind, Sample};

    use super::*;

    fn packet_channel() -> (mpsc::Sender<Vec<u8>>, ChannelPackets) {
        let (tx, rx) = mpsc::channel(16);
        (tx, ChannelPackets(rx))
    }

    async fn pulse(control: &mpsc::Sender<Pulse>) -> Snapshot {
        let (reply, rx) = oneshot::channel();
        control
            .send(Pulse { reply })
            .await
            .expect("worker should be running");
        rx.await.expect("worker should reply to a pulse")
    }

    #[tokio::test]
    async fn read_once_parses_one_datagram() {
        let (tx, source) = packet_channel();
        let mut receiver = Receiver::new(source);
        let mut arena = Statgram::new();

        tx.send(b"x:1|c".to_vec()).await.unwrap();
        assert!(receiver.read_once(&mut arena).await.unwrap());
        assert_eq!(
            arena,
            vec![Sample {
                key: "x".to_owned(),
                value: 1.0,
                sample_rate: 1.0,
                kind: Kind::Counter,
            }]
        );
        assert_eq!(receiver.traffic().totals(), (1, 5));

        drop(tx);
        assert!(!receiver.read_once(&mut arena).await.unwrap());
    }

    #[tokio::test]
    async fn worker_hands_over_its_snapshot_on_pulse() {
        let (tx, source) = packet_channel();
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let control = spawn_worker(7, source, Vec::new(), vec![notify_tx]);

        tx.send(b"x:1.0|c".to_vec()).await.unwrap();
        tx.send(b"x:2.0|c".to_vec()).await.unwrap();
        notify_rx.recv().await.unwrap();
        notify_rx.recv().await.unwrap();

        let snapshot = pulse(&control).await;
        assert_eq!(snapshot.counts()["x"], 3.0);
        assert_eq!(snapshot.counts()["tallier.messages.child_7"], 2.0);
        assert_eq!(
            snapshot.counts()["tallier.bytes.child_7"],
            (b"x:1.0|c".len() + b"x:2.0|c".len()) as f64
        );

        // The worker continues with a fresh snapshot and delta counters.
        let snapshot = pulse(&control).await;
        assert!(!snapshot.counts().contains_key("x"));
        assert_eq!(snapshot.counts()["tallier.messages.child_7"], 0.0);
    }

    #[tokio::test]
    async fn worker_drains_through_a_final_pulse_after_eof() {
        let (tx, source) = packet_channel();
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let control = spawn_worker(0, source, Vec::new(), vec![notify_tx]);

        tx.send(b"x:1|c".to_vec()).await.unwrap();
        notify_rx.recv().await.unwrap();
        drop(tx);

        let snapshot = pulse(&control).await;
        assert_eq!(snapshot.counts()["x"], 1.0);

        // After the drain pulse the worker is gone.
        control.closed().await;
        assert!(control.is_closed());
    }

    #[tokio::test]
    async fn pool_folds_worker_snapshots() {
        let (tx1, source1) = packet_channel();
        let (tx2, source2) = packet_channel();
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let pool = WorkerPool::from_controls(vec![
            spawn_worker(1, source1, Vec::new(), vec![notify_tx.clone()]),
            spawn_worker(2, source2, Vec::new(), vec![notify_tx]),
        ]);

        tx1.send(b"a:1|c".to_vec()).await.unwrap();
        tx2.send(b"a:2|c\nb:5|ms".to_vec()).await.unwrap();
        notify_rx.recv().await.unwrap();
        notify_rx.recv().await.unwrap();

        let mut snapshot = Snapshot::new(Vec::new());
        pool.drain_into(&mut snapshot).await;

        assert_eq!(pool.len(), 2);
        assert_eq!(snapshot.counts()["a"], 3.0);
        assert_eq!(snapshot.timings()["b"], vec![5.0]);
        assert_eq!(snapshot.counts()["tallier.messages.total"], 2.0);
        assert_eq!(snapshot.num_children(), 2);
    }
}
