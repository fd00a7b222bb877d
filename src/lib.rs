//! Server-side WebSocket protocol engine implementing the
//! [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455) wire format.
//!
//! `wsframe` turns a pre-established, full-duplex byte stream that has
//! already completed its opening handshake into a bidirectional sequence of
//! logical messages. It handles frame parsing and construction, payload
//! masking, message fragmentation and reassembly, and answers Ping and Close
//! control traffic inline. Messages are streamed: inbound payloads are read
//! incrementally through a [`MessageReader`] and outbound payloads are
//! fragmented through a [`MessageWriter`] bounded by an internal buffer, so a
//! message never has to fit in memory at once.
//!
//! The engine is server-role only: inbound frames must be masked and outbound
//! frames never are. Extensions are not negotiated, so the reserved header
//! bits must be zero on every inbound frame.
//!
//! # Accepting connections
//!
//! The usual entry point is [`upgrade::upgrade`], which validates an HTTP/1.1
//! upgrade request and produces the `101 Switching Protocols` response
//! together with a future resolving to the connection:
//!
//! ```no_run
//! use hyper::{body::Incoming, Request};
//! use wsframe::{upgrade, OpCode};
//!
//! async fn serve(mut request: Request<Incoming>) -> wsframe::Result<upgrade::HttpResponse> {
//!     let (response, fut) = upgrade::upgrade(&mut request, upgrade::Options::default())?;
//!
//!     tokio::spawn(async move {
//!         let Ok(mut ws) = fut.await else { return };
//!         while let Ok(Some((op, mut reader))) = ws.next_reader().await {
//!             let mut message = Vec::new();
//!             if reader.read_to_end(&mut message).await.is_err() {
//!                 break;
//!             }
//!             if op == OpCode::Text || op == OpCode::Binary {
//!                 let _ = ws.write_message(op, &message).await;
//!             }
//!         }
//!     });
//!
//!     Ok(response)
//! }
//! ```
//!
//! Servers that take over the socket themselves can instead call
//! [`WebSocket::server`], which writes the `101` response and returns the
//! connection in one step.
//!
//! # Concurrency
//!
//! [`WebSocket::split`] separates the connection into a [`ReadHalf`] and a
//! [`WriteHalf`] so one task can read while another writes. All outbound
//! bytes, including the Pong and Close echoes issued by the read path, are
//! serialised through a single internal lock; frames therefore appear
//! atomically on the wire and control frames may interleave between data
//! frames but never split one.

use std::{io, sync::Arc};

use thiserror::Error;

pub mod close;
mod conn;
pub mod frame;
mod mask;
pub mod upgrade;

pub use close::CloseCode;
pub use conn::{
    MessageReader, MessageWriter, ReadHalf, WebSocket, WriteHalf, DEFAULT_WRITE_BUFFER_SIZE,
};
pub use frame::OpCode;
pub use upgrade::{HttpWebSocket, Options, UpgradeFut};

/// A result type for WebSocket operations, using `WebSocketError` as the
/// error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into four groups: protocol violations by the peer,
/// misuse of the local write API, handshake validation failures, and
/// transport-level I/O errors.
///
/// The enum is `Clone` because errors detected on the read path are latched:
/// once reading has failed, every later read on the same connection returns
/// the same error without touching the transport. I/O errors are shared
/// behind an `Arc` to keep that cheap.
#[derive(Error, Debug, Clone)]
pub enum WebSocketError {
    /// The peer violated a framing rule, such as setting reserved bits,
    /// sending an unmasked frame, fragmenting a control frame, or starting a
    /// new data message before finishing the previous one. A
    /// `Close(1002, message)` is sent best-effort before this surfaces.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A write was attempted after a Close frame had been sent. No bytes are
    /// emitted once the connection is closing.
    #[error("close sent")]
    CloseSent,

    /// A message writer outlived its message, either because `close` was
    /// already called on it or because a control-frame flush reset the
    /// writer state.
    #[error("closed writer")]
    ClosedWriter,

    /// The opcode passed to `next_writer` or `write_message` cannot start a
    /// message (only Text, Binary, Close and Ping are accepted), or the
    /// opcode passed to `write_control` is not a control opcode.
    #[error("bad opcode")]
    BadOpcode,

    /// A buffered Close or Ping frame was flushed without FIN or with more
    /// than 125 payload bytes. The writer state is reset.
    #[error("invalid control frame")]
    InvalidControlFrame,

    /// A control payload handed to `write_control` or `send_close` exceeds
    /// the 125-byte limit of RFC 6455 Section 5.5.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooBig,

    /// The peer sent a Close frame with a status code other than 1000
    /// (normal) or 1001 (going away).
    #[error("peer sent close {code}: {reason}")]
    PeerClose {
        /// Status code decoded from the first two payload bytes.
        code: CloseCode,
        /// Remaining payload bytes decoded as UTF-8, lossily.
        reason: String,
    },

    /// The transport ended in the middle of a frame header or payload.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The handshake request used a method other than `GET`. Rejected with
    /// HTTP status 405.
    #[error("handshake method must be GET")]
    InvalidMethod,

    /// The `Sec-WebSocket-Version` header is missing or not `13`.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// The `Connection` header does not contain the token `upgrade`.
    #[error("Connection header must contain \"upgrade\"")]
    InvalidConnectionHeader,

    /// The `Upgrade` header does not contain the token `websocket`.
    #[error("Upgrade header must contain \"websocket\"")]
    InvalidUpgradeHeader,

    /// The handshake request is missing the `Sec-WebSocket-Key` header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// Any other I/O error from the byte stream, such as a connection reset
    /// or a transport deadline expiring.
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl From<io::Error> for WebSocketError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof
        } else {
            Self::Io(Arc::new(err))
        }
    }
}
