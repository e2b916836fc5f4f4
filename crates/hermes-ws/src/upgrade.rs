//! WebSocket HTTP upgrade handling.
//!
//! Validates RFC 6455 upgrade requests, builds the `101 Switching Protocols`
//! response and wraps the upgraded I/O stream in a [`WebSocket`]. No
//! sub-protocol is ever negotiated: `Sec-WebSocket-Protocol` is ignored.

use base64::Engine;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, instrument};

use crate::config::WebSocketConfig;
use crate::connection::WebSocket;
use crate::error::{WsError, WsResult};

/// The WebSocket magic GUID used in the handshake.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Check if a request is a WebSocket upgrade request.
///
/// A valid WebSocket upgrade request must have:
/// - `Connection: Upgrade` header
/// - `Upgrade: websocket` header
/// - `Sec-WebSocket-Key` header
/// - `Sec-WebSocket-Version: 13` header
pub fn is_websocket_request<B>(request: &Request<B>) -> bool {
    validate_upgrade_request(request).is_ok()
}

fn header_str<'a, B>(request: &'a Request<B>, name: &header::HeaderName) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

fn has_upgrade_header<B>(request: &Request<B>) -> bool {
    header_str(request, &header::CONNECTION)
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false)
}

fn has_websocket_upgrade<B>(request: &Request<B>) -> bool {
    header_str(request, &header::UPGRADE)
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn has_websocket_version<B>(request: &Request<B>) -> bool {
    header_str(request, &header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.trim() == "13")
        .unwrap_or(false)
}

/// Compute the Sec-WebSocket-Accept value from the key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validate a WebSocket upgrade request.
///
/// Returns the accept key if valid, or an error describing why it's invalid.
#[instrument(skip(request), fields(path = %request.uri().path()))]
pub fn validate_upgrade_request<B>(request: &Request<B>) -> WsResult<String> {
    if request.method() != http::Method::GET {
        return Err(WsError::not_websocket("upgrade requires the GET method"));
    }

    if !has_upgrade_header(request) {
        return Err(WsError::not_websocket("missing Connection: Upgrade header"));
    }

    if !has_websocket_upgrade(request) {
        return Err(WsError::not_websocket("missing Upgrade: websocket header"));
    }

    let key = header_str(request, &header::SEC_WEBSOCKET_KEY)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| WsError::not_websocket("missing Sec-WebSocket-Key header"))?;

    if !has_websocket_version(request) {
        return Err(WsError::not_websocket(
            "missing or invalid Sec-WebSocket-Version header (must be 13)",
        ));
    }

    Ok(compute_accept_key(key))
}

/// Build a plain-text response with the given status.
pub fn text_response(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn switching_protocols_response(accept_key: &str) -> WsResult<Response<Full<Bytes>>> {
    let accept = HeaderValue::from_str(accept_key)
        .map_err(|e| WsError::handshake_failed(e.to_string()))?;

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    Ok(response)
}

/// A WebSocket upgrade result.
pub struct WebSocketUpgrade {
    /// The response to send to the client.
    pub response: Response<Full<Bytes>>,
    /// Whether the upgrade was accepted.
    pub success: bool,
}

/// Prepare a WebSocket upgrade.
///
/// On success the response is `101 Switching Protocols` and the caller must
/// finish with [`complete_upgrade`] once the HTTP layer hands over the I/O
/// stream. Invalid requests get `400 Bad Request`.
pub fn prepare_upgrade<B>(request: &Request<B>) -> WebSocketUpgrade {
    let result = validate_upgrade_request(request).and_then(|key| switching_protocols_response(&key));
    match result {
        Ok(response) => WebSocketUpgrade {
            response,
            success: true,
        },
        Err(e) => {
            debug!("WebSocket upgrade validation failed: {}", e);
            WebSocketUpgrade {
                response: text_response(StatusCode::BAD_REQUEST, e.to_string()),
                success: false,
            }
        }
    }
}

/// Complete a WebSocket upgrade.
///
/// Wraps the upgraded stream, applying the protocol limits from `config`.
pub async fn complete_upgrade<S>(stream: S, config: WebSocketConfig) -> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws_stream = WebSocketStream::from_raw_socket(
        stream,
        tungstenite::protocol::Role::Server,
        Some(config.to_protocol_config()),
    )
    .await;

    WebSocket::new(ws_stream, config)
}
