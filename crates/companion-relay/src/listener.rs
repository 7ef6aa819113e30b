// WebSocket subscriber for the relay, used by the `listen` command and tests
// to watch what a front end would receive.

use futures_util::stream::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use companion_core::protocol::RelayMessage;

/// Events emitted by the listener to its consumer.
#[derive(Debug, PartialEq)]
pub enum WsEvent {
    /// The WebSocket handshake with the relay succeeded.
    Connected { url: String },
    /// A well-formed relay command arrived.
    Message(RelayMessage),
    /// A text frame that is not a relay command (raw string).
    Raw(String),
    /// The relay closed the connection or the socket failed.
    Disconnected,
}

/// Connect to the relay at `url` and forward every frame through `tx` until
/// the connection ends or the receiver is dropped.
pub async fn listen(url: &str, tx: mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
    info!("Connected to relay at {url}");

    if tx
        .send(WsEvent::Connected {
            url: url.to_string(),
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    let (_write, read) = ws_stream.split();
    if process_message_stream(read, &tx, url).await.is_err() {
        return Ok(());
    }

    let _ = tx.send(WsEvent::Disconnected).await;
    Ok(())
}

fn decode(text: &str) -> WsEvent {
    match serde_json::from_str::<RelayMessage>(text) {
        Ok(msg) => WsEvent::Message(msg),
        Err(_) => WsEvent::Raw(text.to_string()),
    }
}

/// Process raw WebSocket [`Message`] items from any [`Stream`], forwarding
/// text payloads through `tx`. Returns `Err(())` if the channel is closed
/// (receiver dropped), signalling the caller to stop.
pub async fn process_message_stream<St>(
    mut stream: St,
    tx: &mpsc::Sender<WsEvent>,
    url: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(decode(text.as_str())).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(_)) => {
                info!("Relay {url} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {url}: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
    Ok(())
}
