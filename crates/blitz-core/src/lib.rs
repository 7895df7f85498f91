pub mod feed;
pub mod payloads;
pub mod sse;

pub use feed::{FeedFault, FeedMessage, FeedType, UnknownFeedType};
pub use sse::{decode_feed_message, FrameError, StreamEvent, CONNECTED_EVENT, MESSAGE_EVENT};
