//! Server lifecycle: TLS setup, the two acceptors, and store maintenance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::acceptor::{self, AcceptorHandle};
use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::error::StartError;
use crate::http_session::{HttpSession, RequestHandler, StaticDocument};
use crate::session_id::SessionIdGenerator;
use crate::store::ChatStore;
use crate::tls::TlsContext;
use crate::ws_session::WsSession;

pub struct Server;

/// Listeners and background tasks of a started server.
pub struct RunningServer {
    http: AcceptorHandle,
    ws: AcceptorHandle,
    maintenance: Option<Maintenance>,
}

struct Maintenance {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl Server {
    /// Bring the server up.
    ///
    /// The TLS material is loaded before any socket is bound, so a bad
    /// certificate or key leaves nothing listening.
    pub async fn start(
        config: &ServerConfig,
        store: Arc<ChatStore>,
        engine: Arc<dyn Engine>,
    ) -> Result<RunningServer, StartError> {
        let tls = TlsContext::initialize(&config.cert_path, &config.key_path)?;
        let cert_path = tls.cert_path().to_path_buf();
        let io_timeout = config.io_timeout();

        let ws = {
            let tls = tls.clone();
            let store = Arc::clone(&store);
            let ids = Arc::new(SessionIdGenerator::new());
            let addr = config.ws_addr();
            acceptor::bind("ws", addr, move |stream, peer| {
                let session = WsSession::new(
                    ids.next_id(),
                    peer,
                    Arc::clone(&store),
                    Arc::clone(&engine),
                    io_timeout,
                );
                session.run(tls.clone(), stream)
            })
            .await
            .map_err(|source| StartError::Bind {
                name: "ws",
                addr,
                source,
            })?
        };

        // The page must point at the port actually bound.
        let handler: Arc<dyn RequestHandler> =
            Arc::new(StaticDocument::chat_page(ws.local_addr().port()));
        let http_addr = config.http_addr();
        let http = match acceptor::bind("http", http_addr, move |stream, peer| {
            HttpSession::new(peer, Arc::clone(&handler), io_timeout).run(tls.clone(), stream)
        })
        .await
        {
            Ok(handle) => handle,
            Err(source) => {
                ws.shutdown().await;
                return Err(StartError::Bind {
                    name: "http",
                    addr: http_addr,
                    source,
                });
            }
        };

        info!(
            component = "server",
            event = "server.api.disabled",
            api_port = config.api_port,
            "Direct API port is configured but not served"
        );

        let maintenance = config
            .compact_interval()
            .map(|every| spawn_compaction(Arc::clone(&store), every));

        info!(
            component = "server",
            event = "server.started",
            http_addr = %http.local_addr(),
            ws_addr = %ws.local_addr(),
            cert_path = %cert_path.display(),
            io_timeout_secs = io_timeout.as_secs(),
            "Server started"
        );

        Ok(RunningServer {
            http,
            ws,
            maintenance,
        })
    }
}

impl RunningServer {
    pub fn http_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub fn ws_addr(&self) -> SocketAddr {
        self.ws.local_addr()
    }

    /// Stop maintenance and close both listeners. Sessions already running
    /// finish on their own.
    pub async fn shutdown(self) {
        if let Some(maintenance) = self.maintenance {
            let _ = maintenance.stop.send(true);
            if let Err(e) = maintenance.join.await {
                warn!(
                    component = "server",
                    event = "server.maintenance.join_failed",
                    error = %e,
                );
            }
        }
        self.http.shutdown().await;
        self.ws.shutdown().await;
        info!(
            component = "server",
            event = "server.stopped",
            "Server stopped"
        );
    }
}

fn spawn_compaction(store: Arc<ChatStore>, every: Duration) -> Maintenance {
    let (stop, mut stop_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let store = Arc::clone(&store);
                    match tokio::task::spawn_blocking(move || store.compact()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(
                            component = "server",
                            event = "server.compaction.failed",
                            error = %e,
                            "Scheduled compaction failed"
                        ),
                        Err(e) => error!(
                            component = "server",
                            event = "server.compaction.aborted",
                            error = %e,
                            "Scheduled compaction task aborted"
                        ),
                    }
                }
            }
        }
    });
    Maintenance { stop, join }
}
