//! FastDFS Connection Management
//!
//! TCP connections to FastDFS servers with per-endpoint pooling. The pool is
//! shared by the client, the storage server's heartbeat channel to trackers,
//! and the per-peer replication senders.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::errors::{map_status_to_error, FastDFSError, Result};
use crate::protocol::{decode_header, encode_header};
use crate::types::{TrackerHeader, FDFS_MAX_BODY_SIZE, FDFS_PROTO_CMD_RESP, FDFS_PROTO_HEADER_LEN};

/// Represents a TCP connection to a FastDFS server (tracker or storage)
///
/// Each connection tracks its last usage time for idle timeout management.
/// Connections are strictly request/response; there is no pipelining.
pub struct Connection {
    stream: TcpStream,
    addr: String,
    last_used: Instant,
}

impl Connection {
    /// Creates a new connection with an established TCP stream
    pub fn new(stream: TcpStream, addr: String) -> Self {
        Self {
            stream,
            addr,
            last_used: Instant::now(),
        }
    }

    /// Transmits data to the server with a timeout
    pub async fn send(&mut self, data: &[u8], timeout_ms: u64) -> Result<()> {
        let result = timeout(
            Duration::from_millis(timeout_ms),
            self.stream.write_all(data),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => Err(FastDFSError::Network {
                operation: "write".to_string(),
                addr: self.addr.clone(),
                source: e,
            }),
            Err(_) => Err(FastDFSError::NetworkTimeout("write".to_string())),
        }
    }

    /// Reads exactly `size` bytes from the server
    ///
    /// A peer EOF mid-frame is reported with the number of bytes already read
    /// so callers can distinguish a torn frame from a clean close.
    pub async fn receive_full(&mut self, size: usize, timeout_ms: u64) -> Result<Bytes> {
        let mut buf = vec![0u8; size];
        let mut read = 0usize;

        let deadline = Duration::from_millis(timeout_ms);
        let recv = async {
            while read < size {
                let n = self.stream.read(&mut buf[read..]).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("peer closed after {} of {} bytes", read, size),
                    ));
                }
                read += n;
            }
            Ok(())
        };

        match timeout(deadline, recv).await {
            Ok(Ok(())) => {
                self.last_used = Instant::now();
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) => Err(FastDFSError::Network {
                operation: "read".to_string(),
                addr: self.addr.clone(),
                source: e,
            }),
            Err(_) => Err(FastDFSError::NetworkTimeout("read".to_string())),
        }
    }

    /// Performs one complete request/response exchange
    ///
    /// Sends `cmd` with `body`, reads the response header, maps a non-zero
    /// status to an error (draining any diagnostic body first), and returns
    /// the response body. The response command must be the reply code.
    pub async fn request(&mut self, cmd: u8, body: &[u8], timeout_ms: u64) -> Result<Bytes> {
        let header = encode_header(body.len() as u64, cmd, 0);
        self.send(&header, timeout_ms).await?;
        if !body.is_empty() {
            self.send(body, timeout_ms).await?;
        }
        self.read_response(timeout_ms).await
    }

    /// Reads one response frame, enforcing the body-size cap
    pub async fn read_response(&mut self, timeout_ms: u64) -> Result<Bytes> {
        let header = self.receive_header(timeout_ms).await?;
        if header.length > FDFS_MAX_BODY_SIZE {
            return Err(FastDFSError::InvalidResponse(format!(
                "response body of {} bytes exceeds cap",
                header.length
            )));
        }
        if header.cmd != FDFS_PROTO_CMD_RESP {
            return Err(FastDFSError::InvalidResponse(format!(
                "unexpected response command {}",
                header.cmd
            )));
        }

        let body = if header.length > 0 {
            self.receive_full(header.length as usize, timeout_ms).await?
        } else {
            Bytes::new()
        };

        if let Some(err) = map_status_to_error(header.status) {
            return Err(err);
        }
        Ok(body)
    }

    /// Reads and decodes one 10-byte header
    pub async fn receive_header(&mut self, timeout_ms: u64) -> Result<TrackerHeader> {
        let data = self.receive_full(FDFS_PROTO_HEADER_LEN, timeout_ms).await?;
        decode_header(&data)
    }

    /// Returns the timestamp of the last send or receive operation
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Returns the server address this connection is connected to
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Manages a pool of reusable connections to multiple servers
///
/// Separate LIFO pools per server address; stale connections are reaped on
/// get and on release, never on a timer.
pub struct ConnectionPool {
    addrs: Vec<String>,
    max_idle: usize,
    connect_timeout: Duration,
    idle_timeout: Duration,
    pools: Arc<Mutex<HashMap<String, Vec<Connection>>>>,
    closed: Arc<Mutex<bool>>,
}

impl ConnectionPool {
    /// Creates a new connection pool for the specified servers
    ///
    /// The pool starts empty; connections are created on-demand.
    pub fn new(
        addrs: Vec<String>,
        max_idle: usize,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let mut pools = HashMap::new();
        for addr in &addrs {
            pools.insert(addr.clone(), Vec::new());
        }

        Self {
            addrs,
            max_idle,
            connect_timeout,
            idle_timeout,
            pools: Arc::new(Mutex::new(pools)),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Retrieves a connection to `addr`, or to the first reachable configured
    /// server when `addr` is None
    ///
    /// Idle pooled connections are reused in LIFO order; stale ones are
    /// discarded on the way.
    pub async fn get(&self, addr: Option<&str>) -> Result<Connection> {
        if *self.closed.lock().await {
            return Err(FastDFSError::ClientClosed);
        }

        match addr {
            Some(a) => self.get_one(a).await,
            None => {
                if self.addrs.is_empty() {
                    return Err(FastDFSError::InvalidArgument(
                        "No addresses available".to_string(),
                    ));
                }
                let mut last_err = None;
                for a in &self.addrs {
                    match self.get_one(a).await {
                        Ok(conn) => return Ok(conn),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or(FastDFSError::NoStorageServer))
            }
        }
    }

    async fn get_one(&self, addr: &str) -> Result<Connection> {
        {
            let mut pools = self.pools.lock().await;
            let pool = pools.entry(addr.to_string()).or_default();

            while let Some(conn) = pool.pop() {
                if conn.last_used().elapsed() < self.idle_timeout {
                    return Ok(conn);
                }
                // stale, drop it
            }
        }

        self.create_connection(addr).await
    }

    /// Creates a new TCP connection to a server
    async fn create_connection(&self, addr: &str) -> Result<Connection> {
        let result = timeout(self.connect_timeout, TcpStream::connect(addr)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(Connection::new(stream, addr.to_string()))
            }
            Ok(Err(e)) => Err(FastDFSError::Network {
                operation: "connect".to_string(),
                addr: addr.to_string(),
                source: e,
            }),
            Err(_) => Err(FastDFSError::ConnectionTimeout(addr.to_string())),
        }
    }

    /// Returns a connection to the pool for reuse
    ///
    /// The connection is dropped instead when the pool is closed or full, or
    /// when the connection has been idle past the limit.
    pub async fn put(&self, conn: Connection) {
        if *self.closed.lock().await {
            return;
        }

        let addr = conn.addr().to_string();
        let mut pools = self.pools.lock().await;

        if let Some(pool) = pools.get_mut(&addr) {
            if pool.len() >= self.max_idle {
                return;
            }
            if conn.last_used().elapsed() > self.idle_timeout {
                return;
            }

            pool.push(conn);

            let now = Instant::now();
            pool.retain(|c| now.duration_since(c.last_used()) <= self.idle_timeout);
        }
    }

    /// Dynamically adds a new server address to the pool
    ///
    /// Used for storage servers discovered at runtime. No-op if already known.
    pub async fn add_addr(&self, addr: String) {
        if *self.closed.lock().await {
            return;
        }

        let mut pools = self.pools.lock().await;
        pools.entry(addr).or_default();
    }

    /// Shuts down the connection pool and closes all connections
    ///
    /// After close is called, get will return ClientClosed. Safe to call
    /// multiple times.
    pub async fn close(&self) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        let mut pools = self.pools.lock().await;
        pools.clear();
    }
}
