//! Signaling transports. They only move [`SignalMessage`]s in order; rooms,
//! presence and authentication belong to whatever relays them.

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tandem_common::SignalMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// One end of an ordered, bidirectional signaling path.
pub struct SignalChannel {
    pub outgoing: mpsc::UnboundedSender<SignalMessage>,
    pub incoming: mpsc::UnboundedReceiver<SignalMessage>,
}

/// Two connected in-memory ends, for calls inside one process.
pub fn channel_pair() -> (SignalChannel, SignalChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        SignalChannel {
            outgoing: a_tx,
            incoming: a_rx,
        },
        SignalChannel {
            outgoing: b_tx,
            incoming: b_rx,
        },
    )
}

/// JSON signaling over a WebSocket relay.
pub struct SignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let url = url::Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(anyhow!("signaling url must be ws:// or wss://, got {url}"));
        }
        let (ws, _) = connect_async(url.as_str()).await?;
        debug!("signaling connected to {}", url);
        Ok(Self { ws })
    }

    pub async fn send(&mut self, msg: &SignalMessage) -> Result<()> {
        let text = msg.to_json()?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next message from the relay. Frames that are not signaling JSON are
    /// skipped.
    pub async fn recv(&mut self) -> Result<SignalMessage> {
        while let Some(msg) = self.ws.next().await {
            if let Some(signal) = parse_frame(msg?) {
                return Ok(signal);
            }
        }
        Err(anyhow!("signaling connection closed"))
    }

    /// Pump the socket from two tasks and expose it as a [`SignalChannel`].
    /// The tasks end when the socket closes or the channel is dropped.
    pub fn into_channel(self) -> SignalChannel {
        let (mut sink, mut stream) = self.ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("unserializable signal: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("signaling send failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("signaling receive failed: {}", e);
                        break;
                    }
                };
                if let Some(signal) = parse_frame(msg) {
                    if in_tx.send(signal).is_err() {
                        break;
                    }
                }
            }
            debug!("signaling stream ended");
        });

        SignalChannel {
            outgoing: out_tx,
            incoming: in_rx,
        }
    }
}

fn parse_frame(msg: Message) -> Option<SignalMessage> {
    match msg {
        Message::Text(text) => match SignalMessage::from_json(text.as_str()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                debug!("ignoring malformed signal: {}", e);
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pair_preserves_order() {
        let (a, mut b) = channel_pair();
        a.outgoing
            .send(SignalMessage::Offer { sdp: "v=0".into() })
            .unwrap();
        a.outgoing.send(SignalMessage::Bye).unwrap();
        assert_eq!(
            b.incoming.recv().await,
            Some(SignalMessage::Offer { sdp: "v=0".into() })
        );
        assert_eq!(b.incoming.recv().await, Some(SignalMessage::Bye));
    }

    #[tokio::test]
    async fn websocket_round_trip_through_echo_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Garbage first, then echo everything back.
            ws.send(Message::Text("not json".into())).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        });

        let client = SignalingClient::connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        let mut channel = client.into_channel();
        channel
            .outgoing
            .send(SignalMessage::Answer { sdp: "v=0".into() })
            .unwrap();
        assert_eq!(
            channel.incoming.recv().await,
            Some(SignalMessage::Answer { sdp: "v=0".into() })
        );
    }

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        assert!(SignalingClient::connect("http://127.0.0.1:1").await.is_err());
    }
}
