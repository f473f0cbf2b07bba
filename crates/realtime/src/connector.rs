//! Transport seam for the realtime channel
//!
//! A `Connector` turns a URL into a `Link`: a pair of channels carrying text
//! frames and close notifications. The driver never touches sockets directly,
//! so tests swap in an in-process connector and drive the remote end by hand.
//!
//! `WsConnector` is the websocket implementation. Each link gets its own pump
//! task that owns the socket; dropping the `Link` closes it.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::state::{ABNORMAL_CLOSURE, NO_STATUS, NORMAL_CLOSURE};

/// Frames from the driver to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Frames from the peer to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed { code: u16, reason: String },
}

/// Driver side of one connection.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Transport side of one connection.
#[derive(Debug)]
pub struct Remote {
    /// Frames the driver wants sent
    pub incoming: mpsc::UnboundedReceiver<Outbound>,
    /// Frames received from the peer
    pub outgoing: mpsc::UnboundedSender<Inbound>,
}

impl Link {
    /// A connected link/remote pair.
    pub fn channel() -> (Link, Remote) {
        let (outbound, incoming) = mpsc::unbounded_channel();
        let (outgoing, inbound) = mpsc::unbounded_channel();
        (Link { outbound, inbound }, Remote { incoming, outgoing })
    }

    /// Ask the transport to close with `code`. Ignored if already closed.
    pub fn close(self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Future returned by `Connector::connect`.
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Link>> + Send>>;

/// Opens links to the realtime endpoint.
///
/// Uses a boxed `'static` future so the driver can hold a pending connect
/// alongside its other timers without borrowing the connector.
pub trait Connector: Send + Sync {
    fn connect(&self, url: Url) -> ConnectFuture;
}

/// Websocket connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> ConnectFuture {
        Box::pin(async move {
            let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| Error::Connect(e.to_string()))?;
            debug!(status = response.status().as_u16(), "websocket handshake complete");

            let (link, remote) = Link::channel();
            tokio::spawn(pump(stream, remote));
            Ok(link)
        })
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Move frames between the socket and the link until either side closes.
async fn pump(stream: Socket, mut remote: Remote) {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            outbound = remote.incoming.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "websocket send failed");
                        let _ = remote.outgoing.send(Inbound::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    close(&mut sink, code, reason).await;
                    break;
                }
                // Link dropped by the driver
                None => {
                    close(&mut sink, NORMAL_CLOSURE, String::new()).await;
                    break;
                }
            },
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if remote.outgoing.send(Inbound::Text(text)).is_err() {
                        close(&mut sink, NORMAL_CLOSURE, String::new()).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NO_STATUS, String::new()));
                    debug!(code, reason = %reason, "websocket closed by peer");
                    let _ = remote.outgoing.send(Inbound::Closed { code, reason });
                    break;
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    let _ = remote.outgoing.send(Inbound::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: e.to_string(),
                    });
                    break;
                }
                None => {
                    let _ = remote.outgoing.send(Inbound::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".into(),
                    });
                    break;
                }
            }
        }
    }
}

async fn close<S>(sink: &mut S, code: u16, reason: String)
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "websocket close frame not sent");
    }
}
