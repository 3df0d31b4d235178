//! Local TCP listener that forwards every accepted connection through SSH.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::ssh::RemoteHost;

/// Copy bytes both ways until either side finishes or fails, then shut
/// down both write halves so the peer of each side sees EOF.
pub async fn splice<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        res = tokio::io::copy(&mut a_read, &mut b_write) => {
            if let Err(e) = res {
                tracing::debug!(error = %e, "splice: local -> remote ended with error");
            }
        }
        res = tokio::io::copy(&mut b_read, &mut a_write) => {
            if let Err(e) = res {
                tracing::debug!(error = %e, "splice: remote -> local ended with error");
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}

pub struct Tunnel {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    connections: TaskTracker,
}

impl Tunnel {
    /// Bind `127.0.0.1:0` and forward each connection to
    /// `remote_host:remote_port` as seen from the SSH server.
    pub async fn open(
        remote: Arc<dyn RemoteHost>,
        remote_host: String,
        remote_port: u16,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let connections = TaskTracker::new();

        let accept_task = tokio::spawn({
            let cancel = cancel.clone();
            let connections = connections.clone();
            async move {
                loop {
                    let (stream, peer) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = listener.accept() => match result {
                            Ok(conn) => conn,
                            Err(e) => {
                                tracing::warn!(error = %e, "tunnel accept failed");
                                continue;
                            }
                        },
                    };

                    let remote = remote.clone();
                    let remote_host = remote_host.clone();
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        let opened = tokio::select! {
                            _ = cancel.cancelled() => return,
                            opened = remote.open_forward(&remote_host, remote_port) => opened,
                        };
                        let forward = match opened {
                            Ok(f) => f,
                            Err(e) => {
                                // Dropping `stream` closes just this client.
                                tracing::warn!(%peer, error = %e, "forward channel open failed");
                                return;
                            }
                        };
                        tracing::debug!(%peer, "tunnel connection opened");
                        tokio::select! {
                            _ = splice(stream, forward) => {}
                            _ = cancel.cancelled() => {}
                        }
                        tracing::debug!(%peer, "tunnel connection closed");
                    });
                }
            }
        });

        tracing::info!(addr = %local_addr, remote_port, "tunnel listening");
        Ok(Self {
            local_addr,
            cancel,
            accept_task,
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every active forward. Returns once every
    /// forwarded channel has been released.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.accept_task.await;
        self.connections.close();
        self.connections.wait().await;
        tracing::info!(addr = %self.local_addr, "tunnel closed");
    }
}
