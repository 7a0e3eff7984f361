//! WebSocket plumbing for a single relay.
//!
//! A [`RelaySocket`] is a cheap handle: writes go into an unbounded channel and a spawned
//! connection task owns the actual stream. Everything the task observes is reported as a
//! [`SocketEvent`] on a shared channel so the receiving side never blocks socket I/O.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::Error;

pub type SocketId = u64;

/// What a connection task reports back to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected {
        socket_id: SocketId,
        url: String,
    },
    Text {
        socket_id: SocketId,
        url: String,
        text: String,
    },
    Disconnected {
        socket_id: SocketId,
        url: String,
    },
    Error {
        socket_id: SocketId,
        url: String,
        error: String,
    },
}

/// Write handle for one relay connection.
#[derive(Debug, Clone)]
pub struct RelaySocket {
    id: SocketId,
    url: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl RelaySocket {
    pub(crate) fn new(id: SocketId, url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id,
                url: url.into(),
                outbound,
            },
            receiver,
        )
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queues a text frame. Returns false once the connection task has gone away.
    pub fn send(&self, frame: String) -> bool {
        if self.outbound.send(frame).is_err() {
            debug!(relay = %self.url, "Dropped frame for closed socket");
            return false;
        }
        true
    }
}

/// Normalizes a relay address and checks it is a websocket URL.
pub fn parse_relay_url(value: &str) -> Result<String, Error> {
    let url = Url::parse(value.trim()).map_err(|_| Error::InvalidRelayUrl(value.to_string()))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(Error::InvalidRelayUrl(value.to_string()));
    }
    if url.host_str().is_none() {
        return Err(Error::InvalidRelayUrl(value.to_string()));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Spawns the task that connects to `url` and pumps frames both ways until the relay
/// disconnects, the handle is dropped, or `cancel` fires.
pub fn spawn_connection(
    socket_id: SocketId,
    url: String,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SocketEvent>,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) =
            run_connection(socket_id, &url, outbound, &events, connect_timeout, cancel).await
        {
            let _ = events.send(SocketEvent::Error {
                socket_id,
                url,
                error: err.to_string(),
            });
        }
    })
}

async fn run_connection(
    socket_id: SocketId,
    url: &str,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<SocketEvent>,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let (stream, _) = tokio::time::timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| Error::Timeout)??;
    let _ = events.send(SocketEvent::Connected {
        socket_id,
        url: url.to_string(),
    });

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            frame = outbound.recv() => match frame {
                Some(text) => write.send(Message::Text(text.into())).await?,
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Text {
                        socket_id,
                        url: url.to_string(),
                        text: text.to_string(),
                    });
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(SocketEvent::Text {
                            socket_id,
                            url: url.to_string(),
                            text,
                        });
                    }
                    Err(_) => warn!(relay = %url, "Ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            },
        }
    }

    let _ = events.send(SocketEvent::Disconnected {
        socket_id,
        url: url.to_string(),
    });
    Ok(())
}

/// Opens a throwaway connection, writes one frame and disconnects. The whole exchange is
/// bounded by `timeout`.
pub async fn send_once(url: &str, frame: String, timeout: Duration) -> Result<(), Error> {
    tokio::time::timeout(timeout, async {
        let (mut stream, _) = connect_async(url).await?;
        stream.send(Message::Text(frame.into())).await?;
        let _ = stream.close(None).await;
        Ok::<(), Error>(())
    })
    .await
    .map_err(|_| Error::Timeout)?
}
