//! Plain `ws://` link to the capture endpoint.
//!
//! [`open`] performs the upgrade and splits the socket into a
//! [`LinkSender`] for lifecycle commands and a [`LinkReceiver`] yielding
//! packet frames, so the transport task can drive both from one
//! `tokio::select!`. No extensions are negotiated, so frames are never
//! compressed. Control frames never reach the caller; tungstenite answers
//! pings itself.

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer's close frame carried none.
const NO_STATUS_CODE: u16 = 1005;

/// Data-bearing frame from the capture endpoint.
#[derive(Debug, PartialEq)]
pub enum Frame {
    /// Text frame, normally one packet as JSON.
    Text(String),
    /// Binary frame; the pipeline accepts it if it holds UTF-8 JSON.
    Binary(Vec<u8>),
    /// The peer closed the connection.
    Closed {
        /// Close code, 1005 when none was sent.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Sending side of an open link.
#[derive(Debug)]
pub struct LinkSender {
    sink: SplitSink<Socket, Message>,
}

impl LinkSender {
    /// Send one command string as a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn command(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::Text(text.to_string()))
            .await
            .with_context(|| format!("failed to send command '{text}'"))
    }

    /// Start the close handshake and flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame cannot be written.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.sink.close().await.context("failed to close link")
    }
}

/// Receiving side of an open link.
#[derive(Debug)]
pub struct LinkReceiver {
    stream: SplitStream<Socket>,
}

impl LinkReceiver {
    /// Next data frame. `None` once the socket is gone.
    pub async fn next_frame(&mut self) -> Option<Result<Frame>> {
        while let Some(message) = self.stream.next().await {
            let frame = match message {
                Ok(Message::Text(text)) => Frame::Text(text.to_string()),
                Ok(Message::Binary(data)) => Frame::Binary(data.to_vec()),
                Ok(Message::Close(close)) => {
                    let (code, reason) = close.map_or_else(
                        || (NO_STATUS_CODE, String::new()),
                        |c| (c.code.into(), c.reason.to_string()),
                    );
                    Frame::Closed { code, reason }
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => return Some(Err(anyhow::Error::new(e).context("link read failed"))),
            };
            return Some(Ok(frame));
        }
        None
    }
}

/// Open a link to `url`.
///
/// Returns both halves and the HTTP status of the upgrade response.
///
/// # Errors
///
/// Returns an error if `url` is not a WebSocket URL or the upgrade fails.
pub async fn open(url: &str) -> Result<(LinkSender, LinkReceiver, u16)> {
    let request = url
        .into_client_request()
        .with_context(|| format!("not a WebSocket URL: {url}"))?;

    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("could not reach {url}"))?;
    let (sink, stream) = socket.split();

    Ok((
        LinkSender { sink },
        LinkReceiver { stream },
        response.status().as_u16(),
    ))
}
