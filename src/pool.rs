//! Front-end connection pool for the engine's wire protocol.
//!
//! Each front-end worker keeps a pool of established TCP connections and
//! reuses them across requests; a cold connect per request would collapse
//! throughput. A fair semaphore bounds live connections at the configured
//! maximum and queues waiters in FIFO order. Connections are dialed lazily,
//! probed for staleness on checkout, and returned to the idle set when a
//! [`PooledConn`] drops, unless an I/O error marked it broken.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::model::GrantRequest;
use crate::wire::{ClientCodec, GrantReply, WireError};

/// Why a checkout produced no connection.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,

    #[error("timed out waiting for an engine connection")]
    Timeout,

    #[error("failed to connect to engine: {0}")]
    Connect(#[source] io::Error),
}

/// One framed request/reply connection to the engine.
pub struct CertClient {
    framed: Framed<TcpStream, ClientCodec>,
}

impl CertClient {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, ClientCodec),
        })
    }

    /// Send one request and wait for its reply. The protocol is strict
    /// request/reply per connection, so replies cannot interleave.
    pub async fn grant(&mut self, request: &GrantRequest) -> Result<GrantReply, WireError> {
        self.framed.send(request).await?;
        match self.framed.next().await {
            Some(result) => result,
            None => Err(WireError::ConnectionClosed),
        }
    }

    /// Cheap liveness probe for an idle connection. Between requests the
    /// socket must be silent, so any readable byte, an EOF, or buffered
    /// leftovers mean the connection is unusable.
    fn is_stale(&self) -> bool {
        if !self.framed.read_buffer().is_empty() {
            return true;
        }
        let mut probe = [0u8; 1];
        match self.framed.get_ref().try_read(&mut probe) {
            Ok(_) => true,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

/// Pool sizing and dial target.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Engine endpoint to dial.
    pub engine: SocketAddr,
    /// Upper bound on idle plus checked-out connections.
    pub max_connections: usize,
    /// Bound on how long a checkout may wait, including the dial.
    pub checkout_timeout: Option<Duration>,
}

/// Shared handle to the worker's connection pool. Clones share one pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    engine: SocketAddr,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<CertClient>>,
    checkout_timeout: Option<Duration>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                engine: config.engine,
                permits: Arc::new(Semaphore::new(config.max_connections)),
                idle: Mutex::new(Vec::with_capacity(config.max_connections)),
                checkout_timeout: config.checkout_timeout,
            }),
        }
    }

    /// Take a ready connection: an idle one if present, a fresh dial if the
    /// pool is under its maximum, otherwise wait FIFO for a return.
    pub async fn checkout(&self) -> Result<PooledConn, PoolError> {
        match self.inner.checkout_timeout {
            Some(limit) => timeout(limit, self.checkout_inner())
                .await
                .map_err(|_| PoolError::Timeout)?,
            None => self.checkout_inner().await,
        }
    }

    async fn checkout_inner(&self) -> Result<PooledConn, PoolError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        while let Some(client) = self.inner.idle_list().pop() {
            if client.is_stale() {
                debug!("discarding stale pooled connection");
                continue;
            }
            return Ok(PooledConn::new(client, permit, &self.inner));
        }

        let client = CertClient::connect(self.inner.engine)
            .await
            .map_err(PoolError::Connect)?;
        Ok(PooledConn::new(client, permit, &self.inner))
    }

    /// Drop all idle connections and fail future checkouts. Checked-out
    /// connections close as their holders drop.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle_list().clear();
    }
}

impl PoolInner {
    fn idle_list(&self) -> MutexGuard<'_, Vec<CertClient>> {
        self.idle.lock().expect("pool idle list poisoned")
    }
}

/// A checked-out connection. Returns itself to the idle set on drop unless
/// an I/O error marked it broken, in which case dropping closes the socket
/// and frees the slot for a replacement.
pub struct PooledConn {
    client: Option<CertClient>,
    inner: Arc<PoolInner>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    fn new(client: CertClient, permit: OwnedSemaphorePermit, inner: &Arc<PoolInner>) -> Self {
        Self {
            client: Some(client),
            inner: Arc::clone(inner),
            broken: false,
            _permit: permit,
        }
    }

    pub async fn grant(&mut self, request: &GrantRequest) -> Result<GrantReply, WireError> {
        let client = self.client.as_mut().expect("connection already returned");
        match client.grant(request).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.broken = true;
                Err(err)
            }
        }
    }

    /// Keep this connection out of the idle set when it drops.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        // Return before the permit frees so the next waiter finds it idle.
        if let Some(client) = self.client.take() {
            if !self.inner.permits.is_closed() {
                self.inner.idle_list().push(client);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use tokio::net::TcpListener;
    use tokio_util::codec::Framed as ServerFramed;

    use crate::wire::EngineCodec;

    /// Minimal engine stand-in: grants sequential numbers, optionally
    /// hanging up after a fixed number of requests per connection.
    async fn stub_engine(requests_per_conn: Option<u64>) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conns = Arc::new(AtomicUsize::new(0));
        let conns_seen = Arc::clone(&conns);
        let counter = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                conns_seen.fetch_add(1, Ordering::SeqCst);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut framed = ServerFramed::new(stream, EngineCodec);
                    let mut served = 0u64;
                    while let Some(Ok(_request)) = framed.next().await {
                        let number = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if framed.send(GrantReply::Granted(number)).await.is_err() {
                            return;
                        }
                        served += 1;
                        if requests_per_conn.is_some_and(|limit| served >= limit) {
                            return; // drop the connection
                        }
                    }
                });
            }
        });

        (addr, conns)
    }

    fn request() -> GrantRequest {
        GrantRequest {
            class: "CS".to_string(),
            holder: "Alice".to_string(),
            amount: 1,
        }
    }

    fn pool(addr: SocketAddr, max: usize, timeout: Option<Duration>) -> Pool {
        Pool::new(PoolConfig {
            engine: addr,
            max_connections: max,
            checkout_timeout: timeout,
        })
    }

    #[tokio::test]
    async fn checkout_reuses_returned_connections() {
        let (addr, conns) = stub_engine(None).await;
        let pool = pool(addr, 4, None);

        for _ in 0..3 {
            let mut conn = pool.checkout().await.unwrap();
            let reply = conn.grant(&request()).await.unwrap();
            assert!(matches!(reply, GrantReply::Granted(_)));
        }
        assert_eq!(conns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiters_get_the_connection_when_it_returns() {
        let (addr, conns) = stub_engine(None).await;
        let pool = pool(addr, 1, None);

        let held = pool.checkout().await.unwrap();
        let contender = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut conn = pool.checkout().await.unwrap();
                conn.grant(&request()).await.unwrap()
            })
        };

        // The contender cannot proceed while the one slot is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(held);
        let reply = contender.await.unwrap();
        assert!(matches!(reply, GrantReply::Granted(_)));
        assert_eq!(conns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_connections_are_replaced_on_checkout() {
        // Server hangs up after each reply, so every returned connection is
        // dead by the next checkout.
        let (addr, conns) = stub_engine(Some(1)).await;
        let pool = pool(addr, 2, None);

        for _ in 0..2 {
            let mut conn = pool.checkout().await.unwrap();
            conn.grant(&request()).await.unwrap();
            drop(conn);
            // Let the server's FIN land before the next stale probe.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(conns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn request_error_marks_the_connection_broken() {
        let (addr, _conns) = stub_engine(Some(1)).await;
        let pool = pool(addr, 1, None);

        let mut conn = pool.checkout().await.unwrap();
        conn.grant(&request()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second request on the same checked-out connection hits the hangup.
        assert!(conn.grant(&request()).await.is_err());
        drop(conn);

        // The broken connection was not returned to the idle set.
        assert!(pool.inner.idle_list().is_empty());
    }

    #[tokio::test]
    async fn checkout_times_out_when_the_pool_is_exhausted() {
        let (addr, _conns) = stub_engine(None).await;
        let pool = pool(addr, 1, Some(Duration::from_millis(50)));

        let _held = pool.checkout().await.unwrap();
        let result = pool.checkout().await;
        assert!(matches!(result, Err(PoolError::Timeout)));
    }

    #[tokio::test]
    async fn checkout_surfaces_connect_failure() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool(addr, 1, None);
        assert!(matches!(
            pool.checkout().await,
            Err(PoolError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn closed_pool_rejects_checkout() {
        let (addr, _conns) = stub_engine(None).await;
        let pool = pool(addr, 1, None);
        pool.close();
        assert!(matches!(pool.checkout().await, Err(PoolError::Closed)));
    }
}
