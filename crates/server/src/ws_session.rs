//! WebSocket chat session.
//!
//! `TLS handshake → WS accept → (read → process → write)*`. Each text frame
//! is one chat turn: the user text is stored, handed to the engine, the reply
//! is stored, and exactly one frame goes back. A failed turn answers with an
//! error frame and the session keeps reading.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use svakla_protocol::{ChatMessage, ServerFrame, SENDER_ASSISTANT, SENDER_USER};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::error::{ProtocolError, SessionError};
use crate::session_id::unix_secs;
use crate::store::{conversation_message_id, ChatStore, StoreError};
use crate::tls::TlsContext;

/// Why a chat turn produced an error frame instead of a reply.
#[derive(Debug, Error)]
enum TurnError {
    #[error("failed to store {sender} message: {source}")]
    Store {
        sender: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("storage task aborted: {0}")]
    StoreTask(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl TurnError {
    fn stage(&self) -> &'static str {
        match self {
            TurnError::Store { sender, .. } if *sender == SENDER_USER => "store_user",
            TurnError::Store { .. } => "store_assistant",
            TurnError::StoreTask(_) => "store_task",
            TurnError::Engine(_) => "engine",
        }
    }

    /// Text shown to the client in the error frame.
    fn client_message(&self) -> String {
        match self {
            TurnError::Engine(e) => format!("The assistant could not answer: {e}"),
            _ => "Your message could not be saved. Please try again.".to_string(),
        }
    }
}

pub struct WsSession {
    id: String,
    peer: SocketAddr,
    store: Arc<ChatStore>,
    engine: Arc<dyn Engine>,
    io_timeout: Duration,
}

impl WsSession {
    pub fn new(
        id: String,
        peer: SocketAddr,
        store: Arc<ChatStore>,
        engine: Arc<dyn Engine>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            store,
            engine,
            io_timeout,
        }
    }

    pub async fn run(self, tls: TlsContext, stream: TcpStream) {
        match self.accept(&tls, stream).await {
            Ok(turns) => info!(
                component = "ws",
                event = "ws.session.closed",
                session_id = %self.id,
                peer = %self.peer,
                turns = turns,
                "WebSocket session closed"
            ),
            Err(e) => info!(
                component = "ws",
                event = "ws.session.failed",
                session_id = %self.id,
                peer = %self.peer,
                reason = e.kind(),
                error = %e,
                "WebSocket session terminated"
            ),
        }
    }

    async fn accept(&self, tls: &TlsContext, stream: TcpStream) -> Result<u64, SessionError> {
        let stream = tls.accept_handshake(stream, self.io_timeout).await?;
        self.serve(stream).await
    }

    /// Upgrade `stream` and run the chat loop. Returns the number of turns
    /// answered before the peer went away.
    pub async fn serve<S>(&self, stream: S) -> Result<u64, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ws = tokio::time::timeout(self.io_timeout, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| SessionError::Timeout {
                op: "websocket accept",
                after: self.io_timeout,
            })?
            .map_err(ProtocolError::Upgrade)?;

        info!(
            component = "ws",
            event = "ws.session.opened",
            session_id = %self.id,
            peer = %self.peer,
            "WebSocket session opened"
        );

        let mut turns = 0u64;
        loop {
            let Some(text) = self.read_turn(&mut ws).await? else {
                return Ok(turns);
            };

            let frame = self.process(text).await;
            let payload = serde_json::to_string(&frame).map_err(|e| {
                SessionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;

            tokio::time::timeout(self.io_timeout, ws.send(Message::text(payload)))
                .await
                .map_err(|_| SessionError::Timeout {
                    op: "write",
                    after: self.io_timeout,
                })??;
            turns += 1;
        }
    }

    /// Next chat turn's text, or `None` once the peer has closed.
    async fn read_turn<S>(&self, ws: &mut WebSocketStream<S>) -> Result<Option<String>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let next = tokio::time::timeout(self.io_timeout, ws.next())
                .await
                .map_err(|_| SessionError::Timeout {
                    op: "read",
                    after: self.io_timeout,
                })?;

            match next {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) => {
                    // Flush the close reply queued by the transport.
                    if let Err(e) = ws.close(None).await {
                        debug!(
                            component = "ws",
                            event = "ws.close.flush_failed",
                            session_id = %self.id,
                            error = %e,
                        );
                    }
                    return Ok(None);
                }
                Some(Ok(Message::Binary(_))) => {
                    return Err(ProtocolError::UnsupportedFrame("binary").into());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(
                    tungstenite::Error::ConnectionClosed
                    | tungstenite::Error::AlreadyClosed
                    | tungstenite::Error::Protocol(
                        tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
                    ),
                )) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// One chat turn. Never fails: problems become an error frame.
    async fn process(&self, text: String) -> ServerFrame {
        match self.answer(text).await {
            Ok(reply) => ServerFrame::message(&self.id, reply),
            Err(e) => {
                warn!(
                    component = "ws",
                    event = "ws.turn.failed",
                    session_id = %self.id,
                    peer = %self.peer,
                    stage = e.stage(),
                    error = %e,
                    "Chat turn failed"
                );
                ServerFrame::error(&self.id, e.client_message())
            }
        }
    }

    async fn answer(&self, text: String) -> Result<String, TurnError> {
        // The user message stays stored even if the engine fails below.
        let user_id = self.persist(SENDER_USER, text.clone()).await?;
        debug!(
            component = "ws",
            event = "ws.turn.user_stored",
            session_id = %self.id,
            message_id = %user_id,
        );

        let engine = Arc::clone(&self.engine);
        let reply = tokio::spawn(async move { engine.process(&text).await })
            .await
            .map_err(|e| EngineError::Aborted(e.to_string()))??;

        let reply_id = self.persist(SENDER_ASSISTANT, reply.clone()).await?;
        debug!(
            component = "ws",
            event = "ws.turn.assistant_stored",
            session_id = %self.id,
            message_id = %reply_id,
        );
        Ok(reply)
    }

    async fn persist(&self, sender: &'static str, content: String) -> Result<String, TurnError> {
        let store = Arc::clone(&self.store);
        let session_id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            let id = conversation_message_id(&session_id)?;
            let message = ChatMessage::new(id.clone(), sender, content, unix_secs() as i64);
            store.put(&message)?;
            Ok::<_, StoreError>(id)
        })
        .await
        .map_err(|e| TurnError::StoreTask(e.to_string()))?
        .map_err(|source| TurnError::Store { sender, source })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::BoxFuture;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::WebSocketStream;

    use super::*;
    use crate::engine::EchoEngine;
    use crate::store::conversation_prefix;

    struct Shouting;

    impl Engine for Shouting {
        fn name(&self) -> &str {
            "shouting"
        }

        fn process<'a>(&'a self, input: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
            Box::pin(async move { Ok(input.to_uppercase()) })
        }
    }

    struct Broken;

    impl Engine for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn process<'a>(&'a self, _input: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
            Box::pin(async move { Err::<String, _>(EngineError::Timeout(120)) })
        }
    }

    struct Panicking;

    impl Engine for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn process<'a>(&'a self, _input: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
            Box::pin(async move {
                let weights: Option<&str> = None;
                Ok(weights.expect("model weights missing").to_string())
            })
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Engine for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn process<'a>(&'a self, input: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(input.to_string()) })
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 40001))
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        store: Arc<ChatStore>,
        client: WebSocketStream<DuplexStream>,
        task: JoinHandle<Result<u64, SessionError>>,
    }

    async fn start(id: &str, engine: Arc<dyn Engine>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ChatStore::open(tmp.path().join("chat")).unwrap());
        start_with_store(tmp, store, id, engine).await
    }

    async fn start_with_store(
        tmp: tempfile::TempDir,
        store: Arc<ChatStore>,
        id: &str,
        engine: Arc<dyn Engine>,
    ) -> Harness {
        let (client_io, server_io) = duplex(64 * 1024);
        let session = WsSession::new(
            id.to_string(),
            peer(),
            Arc::clone(&store),
            engine,
            Duration::from_secs(5),
        );
        let task = tokio::spawn(async move { session.serve(server_io).await });
        let (client, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
            .await
            .unwrap();
        Harness {
            _tmp: tmp,
            store,
            client,
            task,
        }
    }

    async fn next_frame(client: &mut WebSocketStream<DuplexStream>) -> ServerFrame {
        loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn turn_stores_both_sides_and_replies_once() {
        let mut h = start("1700000000-1", Arc::new(Shouting)).await;

        h.client.send(Message::text("hello")).await.unwrap();
        let frame = next_frame(&mut h.client).await;
        assert_eq!(frame, ServerFrame::message("1700000000-1", "HELLO"));

        let stored = h.store.scan(&conversation_prefix("1700000000-1")).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].sender, SENDER_USER);
        assert_eq!(stored[0].content, "hello");
        assert_eq!(stored[1].sender, SENDER_ASSISTANT);
        assert_eq!(stored[1].content, "HELLO");
        assert!(stored.iter().all(|m| m.id.starts_with("1700000000-1:")));

        h.client.close(None).await.unwrap();
        assert_eq!(h.task.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn session_loops_over_turns() {
        let mut h = start("1700000000-2", Arc::new(EchoEngine)).await;

        for text in ["one", "two", "three"] {
            h.client.send(Message::text(text)).await.unwrap();
            assert_eq!(next_frame(&mut h.client).await.content(), text);
        }
        assert_eq!(h.store.scan("1700000000-2:").unwrap().len(), 6);

        h.client.close(None).await.unwrap();
        assert_eq!(h.task.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn engine_failure_sends_error_and_keeps_user_message() {
        let mut h = start("1700000000-3", Arc::new(Broken)).await;

        h.client.send(Message::text("hello")).await.unwrap();
        let frame = next_frame(&mut h.client).await;
        assert!(frame.is_error());
        assert_eq!(frame.session_id(), "1700000000-3");

        let stored = h.store.scan("1700000000-3:").unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_from_user());

        // The session survives a failed turn.
        h.client.send(Message::text("again")).await.unwrap();
        assert!(next_frame(&mut h.client).await.is_error());
        h.client.close(None).await.unwrap();
        assert_eq!(h.task.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn engine_panic_becomes_error_frame() {
        let mut h = start("1700000000-4", Arc::new(Panicking)).await;

        h.client.send(Message::text("hello")).await.unwrap();
        let frame = next_frame(&mut h.client).await;
        assert!(frame.is_error());

        h.client.close(None).await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn store_failure_skips_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ChatStore::open(tmp.path().join("chat")).unwrap());
        store.close();
        let engine = Arc::new(Counting::default());
        let mut h =
            start_with_store(tmp, store, "1700000000-5", Arc::clone(&engine) as Arc<dyn Engine>)
                .await;

        h.client.send(Message::text("hello")).await.unwrap();
        let frame = next_frame(&mut h.client).await;
        assert!(frame.is_error());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);

        h.client.close(None).await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn binary_frame_ends_session() {
        let mut h = start("1700000000-6", Arc::new(EchoEngine)).await;

        h.client
            .send(Message::binary(vec![0u8, 1, 2]))
            .await
            .unwrap();
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::UnsupportedFrame("binary"))
        ));
    }

    #[tokio::test]
    async fn dropped_peer_ends_session_quietly() {
        let h = start("1700000000-7", Arc::new(EchoEngine)).await;
        drop(h.client);
        assert_eq!(h.task.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn non_websocket_peer_fails_upgrade() {
        use tokio::io::AsyncWriteExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ChatStore::open(tmp.path().join("chat")).unwrap());
        let (mut client, server_io) = duplex(4096);
        let session = WsSession::new(
            "1700000000-8".into(),
            peer(),
            store,
            Arc::new(EchoEngine),
            Duration::from_secs(5),
        );
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let err = session.serve(server_io).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::Upgrade(_))
        ));
    }

    #[tokio::test]
    async fn silent_peer_ends_session_with_handshake_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = crate::tls::testing::write_self_signed(tmp.path());
        let tls = TlsContext::initialize(&cert.cert_path, &cert.key_path).unwrap();
        let store = Arc::new(ChatStore::open(tmp.path().join("chat")).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let session = WsSession::new(
            "1700000000-9".into(),
            peer(),
            Arc::clone(&store),
            Arc::new(EchoEngine),
            Duration::from_millis(100),
        );
        let err = session.accept(&tls, stream).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(crate::error::HandshakeError::Timeout(_))
        ));
        assert_eq!(err.kind(), "handshake");
        assert_eq!(store.count().unwrap(), 0);
    }
}
