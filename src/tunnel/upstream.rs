//! Upstream side of a tunnel: URL construction and the tungstenite connect.

use std::time::Duration;

use axum::http::HeaderValue;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header::SEC_WEBSOCKET_PROTOCOL, uri::InvalidUri, Uri},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use url::{form_urlencoded, Url};

use crate::config::Credential;
use crate::error::TunnelError;
use crate::tunnel::frame::{CloseInfo, Frame, FrameSink, FrameStream, Inbound, Outbound};

/// Build the upstream WebSocket URL for a tunnel.
///
/// `rest` is the raw path and query left after removing the proxy prefix.
/// Query pairs are kept as the client sent them, except any pair named
/// `param`, which is replaced by the credential appended last. The result is
/// a raw [`Uri`]: path and query bytes are never normalized or re-encoded.
pub fn upstream_ws_url(
    ws_base: &Url,
    rest: &str,
    param: &str,
    credential: &Credential,
) -> Result<Uri, InvalidUri> {
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let mut target = String::from(ws_base.as_str().trim_end_matches('/'));
    target.push_str(path);

    let mut pairs: Vec<&str> = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some(param))
        .collect();
    let credential_pair = format!(
        "{}={}",
        param,
        form_urlencoded::byte_serialize(credential.expose().as_bytes()).collect::<String>()
    );
    pairs.push(&credential_pair);

    target.push('?');
    target.push_str(&pairs.join("&"));
    Uri::try_from(target)
}

/// Open the upstream socket, bounded by `timeout`, and adapt it to the
/// relay's frame types.
pub async fn connect(
    uri: Uri,
    protocol: Option<HeaderValue>,
    timeout: Duration,
) -> Result<(FrameSink, FrameStream), TunnelError> {
    let path = uri.path().to_owned();
    let mut request = uri.into_client_request()?;
    if let Some(protocol) = protocol {
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }

    let (socket, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| TunnelError::ConnectTimeout(timeout))??;
    tracing::debug!(
        status = %response.status(),
        path = %path,
        "Upstream WebSocket handshake complete"
    );

    let (write, read) = socket.split();
    let sink = write
        .sink_map_err(|err| TunnelError::Upstream(err.to_string()))
        .with(|out: Outbound| futures_util::future::ready(Ok::<_, TunnelError>(to_message(out))));
    let stream = read.filter_map(|item| futures_util::future::ready(from_message(item)));

    Ok((Box::pin(sink), Box::pin(stream)))
}

fn to_message(out: Outbound) -> Message {
    match out {
        Outbound::Frame(Frame::Text(text)) => Message::text(text),
        Outbound::Frame(Frame::Binary(data)) => Message::Binary(data),
        Outbound::Close(info) => Message::Close(info.map(|info| CloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

/// Ping, pong and raw frames are handled by tungstenite and not relayed.
fn from_message(item: Result<Message, tungstenite::Error>) -> Option<Inbound> {
    match item {
        Ok(Message::Text(text)) => Some(Inbound::Frame(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(data)) => Some(Inbound::Frame(Frame::Binary(data))),
        Ok(Message::Close(frame)) => Some(Inbound::Close(
            frame.map(|f| CloseInfo::new(u16::from(f.code), f.reason.as_str())),
        )),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(tungstenite::Error::ConnectionClosed) => Some(Inbound::Close(None)),
        Err(err) => Some(Inbound::Error(err.to_string())),
    }
}
