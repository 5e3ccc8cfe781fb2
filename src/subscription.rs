use anyhow::Result;
use atrium_api::com::atproto::sync::subscribe_repos::Commit;

use crate::stream::frames::Frame;

/// A source of firehose frames, one WebSocket connection at a time.
pub trait Subscription {
    fn next(&mut self) -> impl std::future::Future<Output = Option<Result<Frame>>> + Send;
}

/// Receives every decoded `#commit` message from a subscription.
pub trait CommitHandler {
    fn handle_commit(&self, commit: &Commit) -> impl std::future::Future<Output = Result<()>> + Send;
}
