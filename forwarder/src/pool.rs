//! # Connection Pool
//!
//! Per-backend pool of idle upstream TCP connections (spec §4.5). A LIFO
//! stack, capped at `MaxPooledConnections`, so the most recently released
//! connection is reused first — it is the most likely to still be warm at
//! the OS and backend level. Liveness is checked opportunistically on `get`,
//! using a zero-length non-blocking read rather than pulling in `socket2`
//! for a dedicated half-close probe.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{ForwarderError, Result};

/// Hard cap on idle connections retained per backend. Spec §3 fixes this at 50.
pub const MAX_POOLED_CONNECTIONS: usize = 50;

/// Default dial timeout for a fresh backend connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct PoolEntry {
    stream: TcpStream,
}

/// Checks whether a pooled stream is still usable without consuming any
/// application bytes from it.
///
/// A backend holding the connection open but idle leaves the socket in
/// `WouldBlock` on a zero-length read attempt — that's "alive." A `0`-byte
/// read means the peer sent FIN; anything else means the socket is in a
/// state we don't want to hand back out.
fn is_alive(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 0];
    match stream.try_read(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

/// Keyed pool of idle connections, one LIFO stack per backend `"host:port"`.
#[derive(Default)]
pub struct ConnectionPool {
    stacks: Mutex<HashMap<String, Vec<PoolEntry>>>,
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            stacks: Mutex::new(HashMap::new()),
        }
    }

    /// Takes a usable connection for `key` from the pool, discarding any
    /// dead entries encountered along the way. Returns `None` if the pool
    /// for this backend has no live idle connection.
    pub fn take(&self, key: &str) -> Option<TcpStream> {
        let mut guard = self.stacks.lock().expect("ConnectionPool lock poisoned");
        let stack = guard.get_mut(key)?;
        while let Some(entry) = stack.pop() {
            if is_alive(&entry.stream) {
                return Some(entry.stream);
            }
        }
        None
    }

    /// Returns a connection to the pool for reuse, unless it is already
    /// dead or the backend's stack is already at `MaxPooledConnections`, in
    /// which case the stream is simply dropped (closing it).
    pub fn put(&self, key: &str, stream: TcpStream) {
        if !is_alive(&stream) {
            return;
        }
        let mut guard = self.stacks.lock().expect("ConnectionPool lock poisoned");
        let stack = guard.entry(key.to_string()).or_default();
        if stack.len() >= MAX_POOLED_CONNECTIONS {
            return;
        }
        stack.push(PoolEntry { stream });
    }

    /// Dials a fresh connection to `host:port`, bounded by
    /// [`CONNECT_TIMEOUT`]. Used whenever `take` returns `None`.
    pub async fn dial(host: &str, port: u16) -> Result<TcpStream> {
        let addr = format!("{host}:{port}");
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ForwarderError::UpstreamTimeout(CONNECT_TIMEOUT))?
            .map_err(|e| ForwarderError::UpstreamUnreachable(format!("{addr}: {e}")))
    }

    /// Current count of idle (unchecked) connections held for `key`.
    pub fn idle_count(&self, key: &str) -> usize {
        self.stacks
            .lock()
            .expect("ConnectionPool lock poisoned")
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn put_then_take_returns_the_same_live_connection() {
        let pool = ConnectionPool::new();
        let (server_side, client_side) = loopback_pair().await;
        // Keep server_side alive for the duration of the test so the
        // pooled client_side stream stays in the "idle, not yet closed" state.
        let _keep_alive = server_side;

        pool.put("127.0.0.1:9999", client_side);
        assert_eq!(pool.idle_count("127.0.0.1:9999"), 1);

        let taken = pool.take("127.0.0.1:9999");
        assert!(taken.is_some());
        assert_eq!(pool.idle_count("127.0.0.1:9999"), 0);
    }

    #[tokio::test]
    async fn dead_connection_is_discarded_on_take() {
        let pool = ConnectionPool::new();
        let (server_side, client_side) = loopback_pair().await;
        drop(server_side);
        // Give the FIN a moment to arrive.
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.put("127.0.0.1:9998", client_side);
        assert!(pool.take("127.0.0.1:9998").is_none());
    }

    #[tokio::test]
    async fn pool_never_exceeds_max_pooled_connections() {
        let pool = ConnectionPool::new();
        for _ in 0..(MAX_POOLED_CONNECTIONS + 5) {
            let (server_side, client_side) = loopback_pair().await;
            std::mem::forget(server_side);
            pool.put("127.0.0.1:9997", client_side);
        }
        assert!(pool.idle_count("127.0.0.1:9997") <= MAX_POOLED_CONNECTIONS);
    }
}
