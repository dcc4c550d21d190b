//! Tunnel establishment over upstream HTTP proxies.
//!
//! A tunnel is negotiated on one dialed transport: the negotiated TLS
//! ALPN steers the flow into a plain HTTP/1.1 `CONNECT` exchange or an
//! HTTP/2 `CONNECT` stream. Successful HTTP/2 negotiations leave the
//! multiplexed client in a per-destination cache so later sessions to
//! the same upstream reuse the connection.

use base64::Engine;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::dial::{Dialer, TransportStream};
use crate::error::{Error, Result};
use crate::rewrite::{
    apply_t5_rewrite, BRANDED_USER_AGENT, T5_AUTH_HEADER, T5_AUTH_SENTINEL, WAP_GATEWAY_ADDR,
    WAP_GATEWAY_HOST,
};
use crate::upstream::{Destination, UserCredential};

/// Upper bound on the proxy response head.
const MAX_RESPONSE_HEAD: usize = 8192;

/// A `CONNECT` request under construction.
///
/// Kept as raw name/value pairs rather than an `http::HeaderMap` so the
/// HTTP/1.1 serialization preserves the exact header casing the
/// text-level rewrite matches on.
#[derive(Debug, Clone)]
pub(crate) struct ConnectRequest {
    /// URL host; becomes `:authority` on HTTP/2.
    authority: String,
    /// `Host:` header value.
    host: String,
    /// Overrides the HTTP/1.1 request-URI when set.
    opaque: Option<String>,
    headers: Vec<(String, String)>,
}

impl ConnectRequest {
    fn new(target: &str) -> Self {
        Self {
            authority: target.to_string(),
            host: target.to_string(),
            opaque: None,
            headers: Vec::new(),
        }
    }

    fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (existing, v) in &mut self.headers {
            if existing.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn has_t5_sentinel(&self) -> bool {
        self.header(T5_AUTH_HEADER) == Some(T5_AUTH_SENTINEL)
    }

    /// Serializes the request for the HTTP/1.1 wire.
    fn serialize_http1(&self) -> String {
        let request_uri = self.opaque.as_deref().unwrap_or(&self.authority);
        let mut out = format!("CONNECT {} HTTP/1.1\r\n", request_uri);
        out.push_str(&format!("Host: {}\r\n", self.host));
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("\r\n");
        out
    }

    /// Converts to the request shape the h2 client sends.
    fn to_h2_request(&self) -> Result<Request<()>> {
        let mut builder = Request::builder()
            .method(Method::CONNECT)
            .uri(self.authority.as_str());
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(())
            .map_err(|e| Error::Http2(format!("failed to build CONNECT request: {}", e)))
    }
}

/// Builds the `CONNECT` request for one negotiation attempt.
pub(crate) fn build_connect_request(
    upstream: &Destination,
    target: &str,
    user: Option<&UserCredential>,
) -> ConnectRequest {
    let mut req = ConnectRequest::new(target);

    if let Some(user) = user {
        let auth = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user.username, user.password));
        req.set_header("Proxy-Authorization", format!("Basic {}", auth));
    }

    if upstream.host == WAP_GATEWAY_ADDR {
        // The WAP gateway routes on an opaque request-URI and a fixed
        // Host; no branded headers on this branch.
        req.opaque = Some(format!("{}:Host:{}", req.host, WAP_GATEWAY_HOST));
        req.authority = WAP_GATEWAY_HOST.to_string();
        req.host = WAP_GATEWAY_HOST.to_string();
    } else {
        req.set_header("User-Agent", BRANDED_USER_AGENT);
        req.set_header(T5_AUTH_HEADER, T5_AUTH_SENTINEL);
    }

    req
}

/// An established tunnel to the target through an upstream proxy.
///
/// The variant matters to the caller: for `Http1` the first payload
/// still has to be written onto the stream, while `Http2` has already
/// carried it in the request body.
pub enum Tunnel {
    Http1(Http1Tunnel),
    Http2(Http2Tunnel),
}

impl Tunnel {
    /// Whether the first payload was already consumed during negotiation.
    pub fn first_payload_sent(&self) -> bool {
        matches!(self, Tunnel::Http2(_))
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Http1(t) => Pin::new(t).poll_read(cx, buf),
            Tunnel::Http2(t) => Pin::new(t).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Tunnel::Http1(t) => Pin::new(t).poll_write(cx, buf),
            Tunnel::Http2(t) => Pin::new(t).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Http1(t) => Pin::new(t).poll_flush(cx),
            Tunnel::Http2(t) => Pin::new(t).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Http1(t) => Pin::new(t).poll_shutdown(cx),
            Tunnel::Http2(t) => Pin::new(t).poll_shutdown(cx),
        }
    }
}

/// Raw transport after a successful HTTP/1.1 `CONNECT`.
///
/// Bytes the upstream sent immediately after its response head (the
/// target may speak first) are retained and served before the stream.
pub struct Http1Tunnel {
    leftover: Bytes,
    stream: Box<dyn TransportStream>,
}

impl AsyncRead for Http1Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Http1Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

fn h2_io_error(err: h2::Error) -> io::Error {
    io::Error::other(err)
}

/// A tunnel running as one HTTP/2 `CONNECT` stream.
///
/// Reads come from the response body, writes go into the request body
/// stream; shutting down the write half sends the end-of-stream frame.
pub struct Http2Tunnel {
    send: h2::SendStream<Bytes>,
    recv: h2::RecvStream,
    recv_buf: Bytes,
    recv_done: bool,
}

impl Http2Tunnel {
    fn new(send: h2::SendStream<Bytes>, recv: h2::RecvStream) -> Self {
        Self {
            send,
            recv,
            recv_buf: Bytes::new(),
            recv_done: false,
        }
    }
}

impl AsyncRead for Http2Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.recv_done {
            return Poll::Ready(Ok(()));
        }
        if this.recv_buf.is_empty() {
            match this.recv.poll_data(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(bytes))) => this.recv_buf = bytes,
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(h2_io_error(err))),
                Poll::Ready(None) => {
                    this.recv_done = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
        let n = this.recv_buf.len().min(buf.remaining());
        if n > 0 {
            buf.put_slice(&this.recv_buf.split_to(n));
            let _ = this.recv.flow_control().release_capacity(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Http2Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.send.reserve_capacity(buf.len());
        loop {
            match this.send.poll_capacity(cx) {
                Poll::Ready(Some(Ok(0))) => continue,
                Poll::Ready(Some(Ok(cap))) => {
                    let n = cap.min(buf.len());
                    this.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_io_error)?;
                    return Poll::Ready(Ok(n));
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(h2_io_error(err))),
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "h2 stream closed",
                    )))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the connection driver task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Tolerates repeated shutdown once the stream is reset.
        let _ = self.get_mut().send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

/// Per-destination cache of live multiplexed HTTP/2 clients.
///
/// At most one entry per upstream destination; a new successful
/// negotiation overwrites the slot. The connection driver task owns the
/// underlying transport, so dropping the last handle tears it down.
struct H2Cache {
    entries: Mutex<HashMap<Destination, h2::client::SendRequest<Bytes>>>,
}

impl H2Cache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, dest: &Destination) -> Option<h2::client::SendRequest<Bytes>> {
        self.entries.lock().unwrap().get(dest).cloned()
    }

    fn insert(&self, dest: Destination, client: h2::client::SendRequest<Bytes>) {
        self.entries.lock().unwrap().insert(dest, client);
    }
}

/// Negotiates tunnels and owns the HTTP/2 connection cache.
pub struct Negotiator {
    h2_cache: H2Cache,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            h2_cache: H2Cache::new(),
        }
    }

    /// Establishes a tunnel to `target` through `upstream`.
    ///
    /// `first_payload` is consumed here only on the HTTP/2 path, where
    /// it rides in the request body; on HTTP/1.1 the caller writes it
    /// after the `CONNECT` succeeds.
    pub async fn negotiate(
        &self,
        upstream: &Destination,
        target: &str,
        user: Option<&UserCredential>,
        dialer: &dyn Dialer,
        first_payload: Bytes,
    ) -> Result<Tunnel> {
        let req = build_connect_request(upstream, target, user);

        // Reuse a cached multiplexed client when it can still take a
        // new request. A failure past the readiness probe is returned
        // as-is; staleness is only detected here, never evicted.
        if let Some(cached) = self.h2_cache.get(upstream) {
            match cached.ready().await {
                Ok(client) => {
                    tracing::debug!(%upstream, "reusing cached HTTP/2 connection");
                    return connect_http2(client, &req, first_payload).await;
                }
                Err(err) => {
                    tracing::debug!(%upstream, error = %err, "cached HTTP/2 connection exhausted");
                }
            }
        }

        let dialed = dialer.dial(upstream).await?;
        let alpn = dialed.alpn.as_deref().unwrap_or("");

        match alpn {
            "" | "http/1.1" => connect_http1(dialed.stream, req).await,
            "h2" => {
                let (client, connection) = h2::client::handshake(dialed.stream).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::debug!(error = %err, "HTTP/2 connection terminated");
                    }
                });
                let client = client.ready().await?;
                let cache_handle = client.clone();

                let tunnel = connect_http2(client, &req, first_payload).await?;
                self.h2_cache.insert(upstream.clone(), cache_handle);
                Ok(tunnel)
            }
            other => Err(Error::UnsupportedAlpn(other.to_string())),
        }
    }
}

/// HTTP/1.1 sub-flow: write the serialized request, expect a 200 head.
async fn connect_http1(mut stream: Box<dyn TransportStream>, mut req: ConnectRequest) -> Result<Tunnel> {
    req.set_header("Proxy-Connection", "Keep-Alive");

    let serialized = req.serialize_http1();
    let wire = if req.has_t5_sentinel() {
        apply_t5_rewrite(&serialized)
    } else {
        serialized
    };
    stream.write_all(wire.as_bytes()).await?;

    let (head, leftover) = read_response_head(&mut stream).await?;
    let status = parse_response_status(&head)?;
    if status != StatusCode::OK {
        return Err(Error::ProxyStatus(format_status(status)));
    }

    Ok(Tunnel::Http1(Http1Tunnel { leftover, stream }))
}

/// HTTP/2 sub-flow: issue the `CONNECT` stream, writing the first
/// payload into the request body concurrently with the round-trip.
///
/// The body writer is joined before the response status is inspected.
async fn connect_http2(
    mut client: h2::client::SendRequest<Bytes>,
    req: &ConnectRequest,
    first_payload: Bytes,
) -> Result<Tunnel> {
    let request = req.to_h2_request()?;
    let (response, send_stream) = client.send_request(request, false)?;

    let writer = tokio::spawn(write_body(send_stream, first_payload));

    let response = match response.await {
        Ok(response) => response,
        Err(err) => {
            writer.abort();
            return Err(err.into());
        }
    };

    let send_stream = writer
        .await
        .map_err(|e| Error::Http2(format!("body writer failed: {}", e)))??;

    if response.status() != StatusCode::OK {
        return Err(Error::ProxyStatus(format_status(response.status())));
    }

    Ok(Tunnel::Http2(Http2Tunnel::new(
        send_stream,
        response.into_body(),
    )))
}

/// Writes the first payload into the request body stream and returns
/// the stream for the tunnel's write half.
async fn write_body(
    mut send_stream: h2::SendStream<Bytes>,
    payload: Bytes,
) -> Result<h2::SendStream<Bytes>> {
    let mut remaining = payload;
    while !remaining.is_empty() {
        send_stream.reserve_capacity(remaining.len());
        let assigned = poll_fn(|cx| send_stream.poll_capacity(cx)).await;
        match assigned {
            Some(Ok(0)) => continue,
            Some(Ok(cap)) => {
                let chunk = remaining.split_to(cap.min(remaining.len()));
                send_stream.send_data(chunk, false)?;
            }
            Some(Err(err)) => return Err(err.into()),
            None => return Err(Error::Http2("stream closed before body was sent".to_string())),
        }
    }
    Ok(send_stream)
}

/// Reads the HTTP/1 response head, bounded by [`MAX_RESPONSE_HEAD`].
///
/// Returns the head bytes and whatever tunnel bytes arrived after it.
async fn read_response_head(
    stream: &mut Box<dyn TransportStream>,
) -> Result<(Vec<u8>, Bytes)> {
    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::InvalidResponse(
                "connection closed before response head".to_string(),
            ));
        }
        head.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&head) {
            let leftover = Bytes::copy_from_slice(&head[pos..]);
            head.truncate(pos);
            return Ok((head, leftover));
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(Error::InvalidResponse(
                "response head exceeds limit".to_string(),
            ));
        }
    }
}

/// Returns the offset just past the `\r\n\r\n` terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_response_status(head: &[u8]) -> Result<StatusCode> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) | Ok(httparse::Status::Partial) => {}
        Err(err) => {
            return Err(Error::InvalidResponse(format!(
                "malformed response head: {}",
                err
            )))
        }
    }
    let code = response
        .code
        .ok_or_else(|| Error::InvalidResponse("missing status code".to_string()))?;
    StatusCode::from_u16(code)
        .map_err(|_| Error::InvalidResponse(format!("invalid status code {}", code)))
}

/// Formats a status the way it appears on a status line: `code reason`.
fn format_status(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}
