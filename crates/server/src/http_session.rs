//! HTTP session: one TLS connection serving the fixed document.
//!
//! After the handshake the session loops `Read → Dispatch → Write` and
//! either goes back to `Read` (keep-alive) or to `Shutdown`. Exactly one
//! I/O operation is in flight at a time; each is bounded by the I/O timeout.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::error::{ProtocolError, SessionError};
use crate::tls::TlsContext;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_HEADERS: usize = 64;
const SERVER_NAME: &str = "svakla";
const CHAT_PAGE: &str = include_str!("../assets/index.html");

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn connection_has(&self, token: &str) -> bool {
        self.header("connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// HTTP/1.1 keeps the connection unless told to close; HTTP/1.0 only
    /// when asked to.
    pub fn wants_keep_alive(&self) -> bool {
        if self.version >= 1 {
            !self.connection_has("close")
        } else {
            self.connection_has("keep-alive")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn html(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            reason: "OK",
            content_type: "text/html; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn internal_error(detail: &str) -> Self {
        Self {
            status: 500,
            reason: "Internal Server Error",
            content_type: "text/html; charset=utf-8",
            body: Bytes::from(format!(
                "<html><body><h1>500 Internal Server Error</h1><p>{}</p></body></html>",
                escape_html(detail)
            )),
        }
    }

    fn encode_head(&self, keep_alive: bool) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\nServer: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
            self.status,
            self.reason,
            SERVER_NAME,
            self.content_type,
            self.body.len(),
            if keep_alive { "keep-alive" } else { "close" },
        )
        .into_bytes()
    }
}

/// Produces the response for a parsed request. Must not fail; problems are
/// rendered into the response itself.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

/// Serves the same HTML document for every request.
pub struct StaticDocument {
    body: Bytes,
}

impl StaticDocument {
    pub fn new(html: impl Into<Bytes>) -> Self {
        Self { body: html.into() }
    }

    /// The chat page, pointed at the WebSocket port.
    pub fn chat_page(ws_port: u16) -> Self {
        Self::new(CHAT_PAGE.replace("{{WS_PORT}}", &ws_port.to_string()))
    }
}

impl RequestHandler for StaticDocument {
    fn handle(&self, _request: &HttpRequest) -> HttpResponse {
        HttpResponse::html(self.body.clone())
    }
}

enum HttpState {
    Read,
    Dispatch(HttpRequest),
    Write {
        response: HttpResponse,
        keep_alive: bool,
        head_only: bool,
    },
    Shutdown,
}

pub struct HttpSession {
    peer: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    io_timeout: Duration,
}

impl HttpSession {
    pub fn new(peer: SocketAddr, handler: Arc<dyn RequestHandler>, io_timeout: Duration) -> Self {
        Self {
            peer,
            handler,
            io_timeout,
        }
    }

    /// Handshake, then serve until close, error, or timeout.
    pub async fn run(self, tls: TlsContext, stream: TcpStream) {
        match self.accept(&tls, stream).await {
            Ok(served) => debug!(
                component = "http",
                event = "http.session.closed",
                peer = %self.peer,
                requests = served,
            ),
            Err(e) => info!(
                component = "http",
                event = "http.session.failed",
                peer = %self.peer,
                reason = e.kind(),
                error = %e,
                "HTTP session terminated"
            ),
        }
    }

    async fn accept(&self, tls: &TlsContext, stream: TcpStream) -> Result<u64, SessionError> {
        let stream = tls.accept_handshake(stream, self.io_timeout).await?;
        self.serve(stream).await
    }

    /// Run the request loop over an established stream. Returns the number
    /// of responses written.
    pub async fn serve<S>(&self, mut stream: S) -> Result<u64, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4096);
        let mut served = 0u64;
        let mut state = HttpState::Read;

        loop {
            state = match state {
                HttpState::Read => {
                    let read = tokio::time::timeout(
                        self.io_timeout,
                        read_request(&mut stream, &mut buf),
                    )
                    .await
                    .map_err(|_| SessionError::Timeout {
                        op: "read",
                        after: self.io_timeout,
                    })??;
                    match read {
                        Some(request) => HttpState::Dispatch(request),
                        None => HttpState::Shutdown,
                    }
                }
                HttpState::Dispatch(request) => {
                    let keep_alive = request.wants_keep_alive();
                    let head_only = request.method.eq_ignore_ascii_case("HEAD");
                    let response = self.dispatch(&request);
                    debug!(
                        component = "http",
                        event = "http.request",
                        peer = %self.peer,
                        method = %request.method,
                        path = %request.path,
                        body_len = request.body.len(),
                        status = response.status,
                        keep_alive = keep_alive,
                    );
                    HttpState::Write {
                        response,
                        keep_alive,
                        head_only,
                    }
                }
                HttpState::Write {
                    response,
                    keep_alive,
                    head_only,
                } => {
                    tokio::time::timeout(
                        self.io_timeout,
                        write_response(&mut stream, &response, keep_alive, head_only),
                    )
                    .await
                    .map_err(|_| SessionError::Timeout {
                        op: "write",
                        after: self.io_timeout,
                    })??;
                    served += 1;
                    if keep_alive {
                        HttpState::Read
                    } else {
                        HttpState::Shutdown
                    }
                }
                HttpState::Shutdown => {
                    match tokio::time::timeout(self.io_timeout, stream.shutdown()).await {
                        Ok(Ok(())) => {}
                        // The peer may already be gone; that is the normal end.
                        Ok(Err(e)) => debug!(
                            component = "http",
                            event = "http.shutdown.error",
                            peer = %self.peer,
                            error = %e,
                        ),
                        Err(_) => debug!(
                            component = "http",
                            event = "http.shutdown.timeout",
                            peer = %self.peer,
                        ),
                    }
                    return Ok(served);
                }
            };
        }
    }

    fn dispatch(&self, request: &HttpRequest) -> HttpResponse {
        match catch_unwind(AssertUnwindSafe(|| self.handler.handle(request))) {
            Ok(response) => response,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "request handler failed".to_string());
                error!(
                    component = "http",
                    event = "http.handler.panicked",
                    peer = %self.peer,
                    path = %request.path,
                    detail = %detail,
                    "Request handler panicked"
                );
                HttpResponse::internal_error(&detail)
            }
        }
    }
}

/// Buffer one complete request. `Ok(None)` means the peer closed the stream
/// before a full request arrived. Bytes beyond the request stay in `buf`.
async fn read_request<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Option<HttpRequest>, SessionError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((head_len, mut request, body_len)) = parse_head(buf)? {
            while buf.len() < head_len + body_len {
                if !fill(stream, buf).await? {
                    return Ok(None);
                }
            }
            buf.advance(head_len);
            request.body = buf.split_to(body_len).freeze();
            return Ok(Some(request));
        }

        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ProtocolError::HeadTooLarge(MAX_HEAD_BYTES).into());
        }
        if !fill(stream, buf).await? {
            if !buf.is_empty() {
                debug!(
                    component = "http",
                    event = "http.read.partial_eof",
                    buffered = buf.len(),
                );
            }
            return Ok(None);
        }
    }
}

/// Read more bytes; `false` on end of stream.
async fn fill<S>(stream: &mut S, buf: &mut BytesMut) -> Result<bool, SessionError>
where
    S: AsyncRead + Unpin,
{
    match stream.read_buf(buf).await {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        // TLS peers that drop TCP without close_notify surface as UnexpectedEof.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(usize, HttpRequest, usize)>, SessionError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let head_len = match parsed.parse(buf).map_err(ProtocolError::from)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    let body_len = match headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
    {
        Some((_, v)) => v
            .parse::<usize>()
            .map_err(|_| ProtocolError::InvalidContentLength)?,
        None => 0,
    };
    if body_len > MAX_BODY_BYTES {
        return Err(ProtocolError::BodyTooLarge(MAX_BODY_BYTES).into());
    }

    let request = HttpRequest {
        method: parsed.method.unwrap_or("GET").to_string(),
        path: parsed.path.unwrap_or("/").to_string(),
        version: parsed.version.unwrap_or(1),
        headers,
        body: Bytes::new(),
    };
    Ok(Some((head_len, request, body_len)))
}

async fn write_response<S>(
    stream: &mut S,
    response: &HttpResponse,
    keep_alive: bool,
    head_only: bool,
) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&response.encode_head(keep_alive)).await?;
    if !head_only {
        stream.write_all(&response.body).await?;
    }
    stream.flush().await?;
    Ok(())
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
