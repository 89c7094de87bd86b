use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod compose;
mod gate;
mod hydration;
mod pipeline;
mod records;
mod relevant;
mod skeleton;
mod views;

#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod test_support;

pub use compose::{finalize_thread, Composer};
pub use gate::{evaluate_gate, GateCheck, GateLookup};
pub use hydration::{
    EmbedInfo, HydrationBundle, Label, ListInfo, PostBlocks, PostInfo, ProfileInfo,
    ThreadgateInfo,
};
pub use pipeline::{create_pipeline, no_rules, Pipeline};
pub use records::{Facet, FacetFeature, GateRule, PostRecord, ReplyRef, StrongRef, ThreadgateRecord};
pub use relevant::RelevantIds;
pub use skeleton::{build_thread, ParentNode, PostThread};
pub use views::{
    format_post_view, ActorInfoMap, ActorViewerState, BlockedAuthor, BlockedAuthorViewer,
    BlockedPost, EmbedView, EmbeddedRecordView, ExternalView, ImageView, ListViewBasic,
    NotFoundPost, PostView, ProfileViewBasic, ThreadView, ThreadViewPost, ThreadViewerState,
    ThreadgateView,
};

pub const POST_COLLECTION: &str = "app.bsky.feed.post";
pub const DEFAULT_DEPTH: u32 = 6;
pub const DEFAULT_PARENT_HEIGHT: u32 = 80;
pub const MAX_THREAD_BOUND: u32 = 1000;
/// Stack for threads that serialize or drop composed threads. Building and
/// composing never recurse, but serde and drop glue go one frame set per
/// level, and a thread can be [`MAX_THREAD_BOUND`] levels tall both ways.
pub const RENDER_STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("Post not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl ThreadError {
    /// Stable error name surfaced to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Collaborator(_) => "InternalServerError",
        }
    }
}

/// A parsed `at://<host>/<collection>/<rkey>` record address.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AtUri {
    pub host: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    /// Parse a record URI.
    ///
    /// # Errors
    /// Returns [`ThreadError::InvalidRequest`] when the value is not a
    /// three-segment `at://` URI.
    pub fn parse(value: &str) -> Result<Self, ThreadError> {
        let rest = value
            .strip_prefix("at://")
            .ok_or_else(|| ThreadError::InvalidRequest(format!("not an at:// uri: {value}")))?;
        let mut parts = rest.splitn(3, '/');
        let (Some(host), Some(collection), Some(rkey)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ThreadError::InvalidRequest(format!("incomplete record uri: {value}")));
        };
        if host.is_empty() || collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
            return Err(ThreadError::InvalidRequest(format!("malformed record uri: {value}")));
        }
        Ok(Self { host: host.to_string(), collection: collection.to_string(), rkey: rkey.to_string() })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Display for AtUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "at://{}/{}/{}", self.host, self.collection, self.rkey)
    }
}

/// The DID that owns a record, read from the host segment of its URI.
#[must_use]
pub fn uri_host(uri: &str) -> Option<&str> {
    uri.strip_prefix("at://")?.split('/').next().filter(|host| !host.is_empty())
}

/// Request parameters for one thread lookup, with bounds already applied.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ThreadParams {
    pub uri: String,
    pub viewer: Option<String>,
    pub parent_height: u32,
    pub depth: u32,
}

impl ThreadParams {
    /// Build parameters, falling back to the default bounds.
    ///
    /// # Errors
    /// Returns [`ThreadError::InvalidRequest`] when the URI is malformed or a
    /// bound exceeds [`MAX_THREAD_BOUND`].
    pub fn new(
        uri: impl Into<String>,
        viewer: Option<String>,
        depth: Option<u32>,
        parent_height: Option<u32>,
    ) -> Result<Self, ThreadError> {
        let uri = uri.into();
        AtUri::parse(&uri)?;
        let depth = depth.unwrap_or(DEFAULT_DEPTH);
        let parent_height = parent_height.unwrap_or(DEFAULT_PARENT_HEIGHT);
        if depth > MAX_THREAD_BOUND {
            return Err(ThreadError::InvalidRequest(format!(
                "depth MUST be <= {MAX_THREAD_BOUND}, got {depth}"
            )));
        }
        if parent_height > MAX_THREAD_BOUND {
            return Err(ThreadError::InvalidRequest(format!(
                "parentHeight MUST be <= {MAX_THREAD_BOUND}, got {parent_height}"
            )));
        }
        let viewer = viewer.filter(|did| !did.trim().is_empty());
        Ok(Self { uri, viewer, parent_height, depth })
    }
}

/// Minimal denormalized post row used to build the thread skeleton.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedRow {
    pub uri: String,
    pub cid: String,
    pub author_did: String,
    pub reply_root: Option<String>,
    pub reply_parent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub sort_at: OffsetDateTime,
    pub invalid_reply_root: bool,
    pub violates_thread_gate: bool,
}

impl FeedRow {
    /// The thread root this row belongs to: its `reply_root`, or itself.
    #[must_use]
    pub fn root_uri(&self) -> &str {
        self.reply_root.as_deref().unwrap_or(&self.uri)
    }
}
