//! Connection acceptor: one per listening port.
//!
//! Every accepted socket is handed to its own task before the next
//! `accept()`, so a slow handshake never holds up the listener. Shutdown
//! closes only the listening socket; sessions already spawned run to
//! completion on their own.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Handle to a running accept loop
#[derive(Debug)]
pub struct AcceptorHandle {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl AcceptorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close the listening socket.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(
                component = "acceptor",
                event = "acceptor.join_failed",
                acceptor = self.name,
                error = %e,
                "Accept loop ended abnormally"
            );
        }
    }
}

/// Bind `addr` and start accepting. `session` builds the per-connection
/// future for each accepted socket.
pub async fn bind<F, Fut>(
    name: &'static str,
    addr: SocketAddr,
    session: F,
) -> io::Result<AcceptorHandle>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(
        component = "acceptor",
        event = "acceptor.listening",
        acceptor = name,
        addr = %local_addr,
        "Listening"
    );

    let join = tokio::spawn(accept_loop(name, listener, shutdown_rx, session));

    Ok(AcceptorHandle {
        name,
        local_addr,
        shutdown: shutdown_tx,
        join,
    })
}

async fn accept_loop<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    session: F,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(
                                component = "acceptor",
                                event = "acceptor.nodelay_failed",
                                acceptor = name,
                                peer = %peer,
                                error = %e,
                            );
                        }
                        debug!(
                            component = "acceptor",
                            event = "acceptor.accepted",
                            acceptor = name,
                            peer = %peer,
                        );
                        tokio::spawn(session(stream, peer));
                    }
                    Err(e) => {
                        warn!(
                            component = "acceptor",
                            event = "acceptor.accept_failed",
                            acceptor = name,
                            error = %e,
                            "TCP accept failed"
                        );
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    info!(
        component = "acceptor",
        event = "acceptor.closed",
        acceptor = name,
        "Listener closed"
    );
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::sync::{mpsc, oneshot};

    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    async fn stalled_sessions_do_not_block_accepting() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let handle = bind("test", loopback(), move |stream, peer| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(peer);
                // Never finishes on its own; held open until the client leaves.
                let _hold = stream;
                futures::future::pending::<()>().await;
            }
        })
        .await
        .unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(handle.local_addr()).await.unwrap());
        }
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
                .await
                .expect("connection should be accepted")
                .unwrap();
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_listener_but_not_sessions() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let release_rx = std::sync::Mutex::new(Some(release_rx));
        let done_tx = std::sync::Mutex::new(Some(done_tx));

        let handle = bind("test", loopback(), move |_stream, _peer| {
            let release = release_rx.lock().unwrap().take();
            let done = done_tx.lock().unwrap().take();
            async move {
                if let (Some(release), Some(done)) = (release, done) {
                    let _ = release.await;
                    let _ = done.send(());
                }
            }
        })
        .await
        .unwrap();
        let addr = handle.local_addr();

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert!(TcpStream::connect(addr).await.is_err());

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("in-flight session should finish after shutdown")
            .unwrap();
    }
}
