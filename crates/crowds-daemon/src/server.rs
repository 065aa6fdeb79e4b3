//! TCP server for accepting overlay connections.
//!
//! One accept loop per listening socket. Each accepted connection becomes a
//! task that waits for a worker permit, decodes exactly one message and
//! hands it to the node's `MessageHandler`. The worker pool bounds how many
//! connections are being handled at once; the rest queue for a permit.

use crate::transport::LineConnection;
use anyhow::{Context, Result};
use async_trait::async_trait;
use crowds_core::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Role-specific processing of one decoded message.
///
/// The connection is still open, so request/reply types can answer on it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message, conn: &mut LineConnection) -> Result<()>;
}

/// Serves a single accepted socket.
pub struct ConnectionHandler<H> {
    handler: Arc<H>,
}

impl<H: MessageHandler> ConnectionHandler<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Decode one message and dispatch it; then close.
    ///
    /// Decode failures are logged and the connection is closed without a
    /// reply.
    pub async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let mut conn = LineConnection::new(stream);
        match conn.recv().await {
            Ok(Some(message)) => {
                let message_type = message.message_type();
                debug!("Received {} from {}", message_type, peer);
                if let Err(e) = self.handler.handle(message, &mut conn).await {
                    warn!("Failed to handle {} from {}: {:#}", message_type, peer, e);
                }
            }
            Ok(None) => debug!("Connection from {} closed before sending a message", peer),
            Err(e) => warn!("Dropping connection from {}: {}", peer, e),
        }
        conn.shutdown().await;
    }
}

impl<H> Clone for ConnectionHandler<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Stops a running server's accept loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Listening socket plus its bounded worker pool.
pub struct Server {
    listener: TcpListener,
    workers: Arc<Semaphore>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind `address:port`. Port 0 picks an ephemeral port.
    pub async fn bind(address: &str, port: u16, threads: usize) -> Result<Self> {
        let listener = TcpListener::bind((address, port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", address, port))?;
        let local = listener.local_addr()?;
        info!("Listening on {} with {} worker(s)", local, threads.max(1));

        Ok(Self {
            listener,
            workers: Arc::new(Semaphore::new(threads.max(1))),
            shutdown: ShutdownHandle::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept until shut down, then wait for in-flight connections to finish.
    pub async fn run<H: MessageHandler>(self, handler: Arc<H>) -> Result<()> {
        let connections = ConnectionHandler::new(handler);
        let mut stop = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            // Reap finished connections so the set stays small.
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let workers = Arc::clone(&self.workers);
                    let connections = connections.clone();
                    tasks.spawn(async move {
                        let Ok(_permit) = workers.acquire_owned().await else {
                            return;
                        };
                        connections.serve(stream, peer).await;
                    });
                }
            }
        }

        let local = self.listener.local_addr().ok();
        drop(self.listener);
        info!("Stopped accepting on {:?}; draining {} connection(s)", local, tasks.len());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Connection task failed: {}", e);
            }
        }
        Ok(())
    }
}
