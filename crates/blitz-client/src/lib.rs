pub mod actions;
pub mod store;
pub mod stream;

pub use actions::{ActionError, AppActions};
pub use store::{AppMap, AppView, ApplyOutcome, FeedHandle, FeedSlice, FeedStore};
pub use stream::{
    next_backoff, ClientError, ConnectionStatus, StreamClient, StreamConfig, StreamHandle,
};
