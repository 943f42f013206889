//! Per-backend connection pooling.
//!
//! One pool per (cluster, node). Capacity is a semaphore; holders of a
//! permit reuse an idle handler or dial a new one. A handler that closed
//! itself is dropped on return instead of going back on the idle queue.

use crate::{
    backend::BackendHandler,
    message::{Cause, Protocol},
};
use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::time::FutureExt;
use tracing::warn;

#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    cluster: String,
    node: String,
    addr: String,
    proto: Protocol,
    dial_timeout: Duration,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    capacity: Arc<Semaphore>,
    idle: Mutex<Vec<BackendHandler>>,
}

impl Pool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: &str,
        node: &str,
        addr: &str,
        proto: Protocol,
        capacity: usize,
        dial_timeout: Duration,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                cluster: cluster.to_owned(),
                node: node.to_owned(),
                addr: addr.to_owned(),
                proto,
                dial_timeout,
                read_timeout,
                write_timeout,
                capacity: Arc::new(Semaphore::new(capacity.max(1))),
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Leases a handler: waits up to the dial timeout for capacity, then
    /// pops an idle connection or dials a new one.
    pub async fn acquire(&self) -> Result<PooledHandler, Cause> {
        let shared = &self.shared;
        let permit = shared
            .capacity
            .clone()
            .acquire_owned()
            .timeout(shared.dial_timeout)
            .await
            .map_err(|_| Cause::PoolExhausted)?
            .map_err(|_| Cause::PoolExhausted)?;

        let idle = shared.idle.lock().unwrap().pop();
        let handler = match idle {
            Some(handler) => handler,
            None => BackendHandler::connect(
                &shared.cluster,
                &shared.node,
                &shared.addr,
                shared.proto,
                shared.dial_timeout,
                shared.read_timeout,
                shared.write_timeout,
            )
            .await
            .map_err(|e| {
                warn!(node = %shared.node, addr = %shared.addr, "dial failed: {e}");
                Cause::Io
            })?,
        };
        Ok(PooledHandler {
            handler: Some(handler),
            pool: self.clone(),
            _permit: permit,
        })
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.shared.idle.lock().unwrap().len()
    }
}

/// Exclusive lease on a handler. Returning it to the idle queue happens on
/// drop, unless the handler closed itself.
pub struct PooledHandler {
    handler: Option<BackendHandler>,
    pool: Pool,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledHandler {
    type Target = BackendHandler;

    fn deref(&self) -> &Self::Target {
        self.handler.as_ref().unwrap()
    }
}

impl DerefMut for PooledHandler {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handler.as_mut().unwrap()
    }
}

impl Drop for PooledHandler {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take()
            && !handler.is_closed()
        {
            self.pool.shared.idle.lock().unwrap().push(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn accept_counter() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut streams = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                streams.push(stream); // keep connections open
            }
        });
        (addr, accepted)
    }

    fn pool_at(addr: std::net::SocketAddr, capacity: usize) -> Pool {
        Pool::new(
            "test",
            "node",
            &addr.to_string(),
            Protocol::Redis,
            capacity,
            Duration::from_millis(100),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn bounded_capacity_reports_busy() {
        let (addr, _) = accept_counter().await;
        let pool = pool_at(addr, 1);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await;
        assert!(matches!(second, Err(Cause::PoolExhausted)));
        drop(first);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn open_handlers_are_reused() {
        let (addr, accepted) = accept_counter().await;
        let pool = pool_at(addr, 2);
        let lease = pool.acquire().await.unwrap();
        drop(lease);
        assert_eq!(pool.idle_len(), 1);
        let _lease = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_len(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_handlers_are_discarded() {
        let (addr, accepted) = accept_counter().await;
        let pool = pool_at(addr, 1);
        let mut lease = pool.acquire().await.unwrap();
        lease.close();
        drop(lease);
        assert_eq!(pool.idle_len(), 0);
        let _lease = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dial_failure_surfaces_io() {
        // nothing listens on the freed port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let pool = pool_at(addr, 1);
        assert!(matches!(pool.acquire().await, Err(Cause::Io)));
    }
}
