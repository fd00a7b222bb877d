//! Completion of the HTTP/1.1 opening handshake.
//!
//! The framing engine starts from a byte stream whose handshake is already
//! done; this module is the piece that gets it there when the server is built
//! on hyper. [`upgrade`] validates the client's upgrade request, produces the
//! `101 Switching Protocols` response to send back, and returns an
//! [`UpgradeFut`] that resolves to the connection once hyper has switched
//! protocols.
//!
//! ```no_run
//! use hyper::{body::Incoming, Request, Response};
//! use wsframe::upgrade::{self, HttpResponse, Options};
//!
//! async fn handler(mut request: Request<Incoming>) -> HttpResponse {
//!     let (response, fut) = match upgrade::upgrade(&mut request, Options::default()) {
//!         Ok(upgraded) => upgraded,
//!         Err(err) => return upgrade::reject(&err),
//!     };
//!
//!     tokio::spawn(async move {
//!         if let Ok(ws) = fut.await {
//!             // drive the connection
//!             let _ = ws;
//!         }
//!     });
//!
//!     response
//! }
//! ```
//!
//! Servers that hijack the socket themselves can skip this module and call
//! [`WebSocket::server`](crate::WebSocket::server) with the client key
//! instead.

use std::{
    borrow::BorrowMut,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    header,
    upgrade::{OnUpgrade, Upgraded},
    HeaderMap, Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use sha1::{Digest, Sha1};

use crate::{conn::WebSocket, Result, WebSocketError, DEFAULT_WRITE_BUFFER_SIZE};

/// Globally unique identifier appended to the client key when computing
/// `Sec-WebSocket-Accept` (RFC 6455 Section 1.3).
const KEY_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A connection produced by the hyper upgrade path.
pub type HttpWebSocket = WebSocket<TokioIo<Upgraded>>;

/// The empty-bodied HTTP response sent back during the upgrade.
pub type HttpResponse = Response<Empty<Bytes>>;

/// Configuration for accepting a connection.
#[derive(Clone, Default)]
pub struct Options {
    /// Outbound buffer size hint. Messages larger than this are fragmented.
    ///
    /// Default: [`DEFAULT_WRITE_BUFFER_SIZE`].
    pub write_buf_size: Option<usize>,

    /// Subprotocol chosen by the application, echoed to the client in the
    /// `Sec-WebSocket-Protocol` response header.
    ///
    /// Selecting a value from the client's offer is left to the caller; the
    /// engine does not interpret subprotocols.
    pub protocol: Option<String>,
}

impl Options {
    /// Sets the outbound buffer size hint.
    pub fn with_write_buf_size(self, size: usize) -> Self {
        Self {
            write_buf_size: Some(size),
            ..self
        }
    }

    /// Sets the subprotocol to confirm to the client.
    pub fn with_protocol(self, protocol: impl Into<String>) -> Self {
        Self {
            protocol: Some(protocol.into()),
            ..self
        }
    }
}

/// Returns `true` when the request asks for a WebSocket upgrade, meaning its
/// `Connection` header contains the token `upgrade` and its `Upgrade` header
/// the token `websocket`.
///
/// Useful for routing; [`upgrade`] performs the same checks (and more) and
/// reports which one failed.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    header_contains_token(request.headers(), header::CONNECTION, "upgrade")
        && header_contains_token(request.headers(), header::UPGRADE, "websocket")
}

/// Looks for `token` in a comma-separated header value, ASCII
/// case-insensitively, across all values of the header.
fn header_contains_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|value| {
                value
                    .split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}

/// Validates a WebSocket upgrade request and prepares the protocol switch.
///
/// Checks, in order: the method is `GET`; `Sec-WebSocket-Version` is `13`;
/// the `Connection` header contains the token `upgrade`; the `Upgrade` header
/// contains the token `websocket`; and `Sec-WebSocket-Key` is present. The
/// first failing check is returned as the error, and [`reject`] maps it to
/// the matching HTTP error response.
///
/// # Returns
/// A tuple of:
/// - the `101 Switching Protocols` response to send to the client, carrying
///   the computed `Sec-WebSocket-Accept` value;
/// - an [`UpgradeFut`] that resolves to the connection after the response has
///   been sent and hyper has released the underlying stream.
pub fn upgrade<B>(
    mut request: impl BorrowMut<Request<B>>,
    options: Options,
) -> Result<(HttpResponse, UpgradeFut)> {
    let request = request.borrow_mut();

    if request.method() != Method::GET {
        return Err(WebSocketError::InvalidMethod);
    }

    if request
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes())
        != Some(b"13")
    {
        return Err(WebSocketError::InvalidSecWebsocketVersion);
    }

    if !header_contains_token(request.headers(), header::CONNECTION, "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    if !header_contains_token(request.headers(), header::UPGRADE, "websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    let key = request
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(key.as_bytes()));
    if let Some(protocol) = options.protocol.as_deref() {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    let response = builder
        .body(Empty::new())
        .expect("bug: failed to build response");

    let fut = UpgradeFut {
        inner: hyper::upgrade::on(request),
        write_buf_size: options
            .write_buf_size
            .unwrap_or(DEFAULT_WRITE_BUFFER_SIZE),
    };

    Ok((response, fut))
}

/// Builds the HTTP error response for a failed handshake check: 405 for a
/// non-`GET` method, 400 for everything else.
pub fn reject(err: &WebSocketError) -> HttpResponse {
    let status = match err {
        WebSocketError::InvalidMethod => StatusCode::METHOD_NOT_ALLOWED,
        _ => StatusCode::BAD_REQUEST,
    };
    Response::builder()
        .status(status)
        .body(Empty::new())
        .expect("bug: failed to build response")
}

/// Computes `Sec-WebSocket-Accept`: the base64 of the SHA-1 digest of the
/// client key concatenated with the protocol GUID.
pub(crate) fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(KEY_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Future that completes the protocol switch and yields the connection.
///
/// The associated `101` response must be sent to the client before this
/// future can complete, because hyper hands over the stream only after the
/// response has gone out.
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: OnUpgrade,
    write_buf_size: usize,
}

impl Future for UpgradeFut {
    type Output = hyper::Result<HttpWebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = match this.inner.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(upgraded) => upgraded?,
        };

        // Hyper replays any bytes it read past the handshake through the
        // upgraded stream, so no separate pre-read buffer is needed here.
        Poll::Ready(Ok(WebSocket::from_upgraded(
            TokioIo::new(upgraded),
            Bytes::new(),
            *this.write_buf_size,
        )))
    }
}
