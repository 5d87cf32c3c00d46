//! Contract for downstream mining-device sessions.

use super::session::UpstreamHandle;

/// A downstream session that can ride on a shared upstream connection.
///
/// Implemented by the miner-facing side of the proxy. The upstream event
/// loop keeps an `Arc` to each attached session, keyed by
/// [`session_id`](Self::session_id), and hands it an [`UpstreamHandle`] to
/// forward traffic through. The handle does not own the upstream session.
pub trait DownstreamSession: Send + Sync {
    /// Identifier unique among sessions sharing one upstream.
    fn session_id(&self) -> u32;

    /// Called once the session has been recorded by the upstream loop.
    fn set_upstream(&self, upstream: UpstreamHandle);
}
