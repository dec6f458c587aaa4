use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relay_common::event::{Event, DEFAULT_ID_FIELD};
use relay_common::queue::{QueueError, QueueProducer};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StreamingSource;
use crate::error::SourceError;

pub const DATASOURCE: &str = "retarus";

/// Streaming source reading Retarus email security events from their websocket API.
pub struct RetarusSource {
    ws_url: String,
    ws_key: String,
}

impl RetarusSource {
    pub fn new(ws_url: &str, ws_key: &str) -> Self {
        Self {
            ws_url: ws_url.to_owned(),
            ws_key: ws_key.to_owned(),
        }
    }

    fn connection_error(&self, reason: impl ToString) -> SourceError {
        SourceError::ConnectionError {
            url: self.ws_url.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of handling one websocket message.
#[derive(Debug, PartialEq)]
enum Frame {
    Event(Event),
    Skipped,
    Closed,
}

/// Turn a websocket message into an event. Malformed payloads are logged and skipped.
fn parse_message(message: Message) -> Frame {
    let payload = match message {
        Message::Text(text) => text,
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "discarding non utf-8 retarus message");
                return Frame::Skipped;
            }
        },
        Message::Close(frame) => {
            info!(?frame, "retarus websocket closed by server");
            return Frame::Closed;
        }
        // Pings are answered by the protocol layer.
        _ => return Frame::Skipped,
    };

    match Event::from_json(&payload) {
        Ok(event) => Frame::Event(event),
        Err(error) => {
            warn!(%error, "discarding malformed retarus message");
            Frame::Skipped
        }
    }
}

/// Hand an event to the queue. A full queue already dropped and counted the event, a closed
/// one means the relay is gone and consuming must stop.
async fn enqueue(queue: &QueueProducer, event: Event) -> Result<(), SourceError> {
    match queue.offer(event).await {
        Err(QueueError::Closed) => Err(SourceError::QueueClosed),
        Ok(()) | Err(_) => Ok(()),
    }
}

#[async_trait]
impl StreamingSource for RetarusSource {
    fn datasource(&self) -> &'static str {
        DATASOURCE
    }

    fn id_field(&self) -> &str {
        DEFAULT_ID_FIELD
    }

    async fn consume(
        &self,
        queue: QueueProducer,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|error| self.connection_error(error))?;
        let authorization = HeaderValue::from_str(&format!("Bearer {}", self.ws_key))
            .map_err(|error| self.connection_error(error))?;
        request.headers_mut().insert("Authorization", authorization);

        let (mut socket, _) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            connected = tokio_tungstenite::connect_async(request) => {
                connected.map_err(|error| self.connection_error(error))?
            }
        };
        info!(url = %self.ws_url, "connected to retarus websocket");

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    if let Err(error) = socket.close(None).await {
                        debug!(%error, "failed to close retarus websocket");
                    }
                    return Ok(());
                }
                message = socket.next() => message,
            };

            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(error)) => return Err(self.connection_error(error)),
                None => {
                    return Err(SourceError::ConnectionClosed {
                        url: self.ws_url.clone(),
                    })
                }
            };

            match parse_message(message) {
                Frame::Event(event) => enqueue(&queue, event).await?,
                Frame::Skipped => {}
                Frame::Closed => {
                    return Err(SourceError::ConnectionClosed {
                        url: self.ws_url.clone(),
                    })
                }
            }

            // Flush pending pongs, if any.
            if let Err(error) = socket.flush().await {
                return Err(self.connection_error(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_message() {
        let expected = Event::try_from(json!({"id": "1", "ts": "2024-01-01T00:00:00Z"})).unwrap();

        assert_eq!(
            parse_message(Message::Text(
                r#"{"id": "1", "ts": "2024-01-01T00:00:00Z"}"#.to_owned()
            )),
            Frame::Event(expected.clone())
        );
        assert_eq!(
            parse_message(Message::Binary(
                br#"{"id": "1", "ts": "2024-01-01T00:00:00Z"}"#.to_vec()
            )),
            Frame::Event(expected)
        );
        assert_eq!(
            parse_message(Message::Text("not json".to_owned())),
            Frame::Skipped
        );
        assert_eq!(parse_message(Message::Ping(vec![1])), Frame::Skipped);
        assert_eq!(parse_message(Message::Close(None)), Frame::Closed);
    }

    #[tokio::test]
    async fn test_enqueue_stops_only_on_closed_queue() {
        let event = || Event::try_from(json!({"id": "1"})).unwrap();
        let (producer, consumer) =
            relay_common::queue::bounded(1, relay_common::queue::FullQueuePolicy::Drop);

        assert!(enqueue(&producer, event()).await.is_ok());
        // Full: the event is dropped but the stream goes on.
        assert!(enqueue(&producer, event()).await.is_ok());

        drop(consumer);
        assert!(matches!(
            enqueue(&producer, event()).await,
            Err(SourceError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_consume_reports_connection_failures() {
        let (producer, _consumer) =
            relay_common::queue::bounded(10, relay_common::queue::FullQueuePolicy::Drop);
        // Nothing listens on the discard port.
        let source = RetarusSource::new("ws://127.0.0.1:9/events", "secret");

        let result = source.consume(producer, CancellationToken::new()).await;
        assert!(matches!(result, Err(SourceError::ConnectionError { .. })));
    }

    #[tokio::test]
    async fn test_consume_stops_when_cancelled() {
        let (producer, _consumer) =
            relay_common::queue::bounded(10, relay_common::queue::FullQueuePolicy::Drop);
        let source = RetarusSource::new("ws://127.0.0.1:9/events", "secret");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(source.consume(producer, shutdown).await.is_ok());
    }
}
