//! The graphite (carbon) plaintext client.
//!
//! One TCP connection per report: dial, write every line of the
//! snapshot's report, shut the stream down. Failures surface to the flush
//! loop, which holds the snapshot and retries; nothing is dropped here.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::snapshot::Snapshot;

/// Errors produced by [`Graphite`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured address did not resolve to anything.
    #[error("unable to resolve graphite address {0:?}")]
    Resolve(String),
    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Produces one writable byte sink per report. The caller writes the
/// joined report and closes the sink; errors surface to its retry loop.
pub trait Dial: Send + Sync {
    type Conn: AsyncWrite + Unpin + Send;

    fn dial(&self, addr: SocketAddr) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// The production dialer: a plain TCP connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDial;

impl Dial for TcpDial {
    type Conn = TcpStream;

    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// A client for submitting stat reports to a graphite server.
#[derive(Debug)]
pub struct Graphite<D = TcpDial> {
    addr: SocketAddr,
    dialer: D,
}

impl Graphite<TcpDial> {
    /// Resolve `address` and build a TCP-backed client.
    ///
    /// # Errors
    ///
    /// Fails when the address does not resolve. This is a fatal startup
    /// error for the daemon.
    pub fn new(address: &str) -> Result<Self, Error> {
        let addr = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Resolve(address.to_owned()))?;
        Ok(Self {
            addr,
            dialer: TcpDial,
        })
    }
}

impl<D: Dial> Graphite<D> {
    /// Build a client around a custom dialer.
    pub fn with_dialer(addr: SocketAddr, dialer: D) -> Self {
        Self { addr, dialer }
    }

    /// Submit every stat in the snapshot over a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns an error when dialing or writing fails; the snapshot is
    /// untouched apart from its timing vectors being sorted, so the
    /// caller may retry.
    pub async fn send_report(&self, snapshot: &mut Snapshot) -> Result<(), Error> {
        let mut conn = self.dialer.dial(self.addr).await?;
        let msg = snapshot.graphite_report().concat();
        conn.write_all(msg.as_bytes()).await?;
        conn.shutdown().await?;
        Ok(())
    }
}
