use crate::feed::FeedMessage;
use serde::Deserialize;
use thiserror::Error;

pub const CONNECTED_EVENT: &str = "connected";
/// Event name a text/event-stream parser reports for blocks without `event:`.
pub const MESSAGE_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("event decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected { consumer_id: Option<u64> },
    /// Untyped `data: null` opener sent by older backends.
    Placeholder,
    Feed(FeedMessage),
    Ignored { event: String },
}

/// Classifies one dispatched event by name and decodes its data. An empty
/// name counts as the default `message` event.
pub fn decode_feed_message(event: &str, data: &str) -> Result<StreamEvent, FrameError> {
    #[derive(Deserialize)]
    struct ConnectedPayload {
        #[serde(default)]
        consumer_id: Option<u64>,
    }

    match event {
        "" | MESSAGE_EVENT => {}
        CONNECTED_EVENT => {
            let consumer_id = if data.trim().is_empty() {
                None
            } else {
                serde_json::from_str::<ConnectedPayload>(data)
                    .map_err(|err| FrameError::Decode(err.to_string()))?
                    .consumer_id
            };
            return Ok(StreamEvent::Connected { consumer_id });
        }
        other => {
            return Ok(StreamEvent::Ignored {
                event: other.to_string(),
            })
        }
    }

    let data = data.trim();
    if data.is_empty() || data == "null" {
        return Ok(StreamEvent::Placeholder);
    }
    serde_json::from_str::<FeedMessage>(data)
        .map(StreamEvent::Feed)
        .map_err(|err| FrameError::Decode(err.to_string()))
}
