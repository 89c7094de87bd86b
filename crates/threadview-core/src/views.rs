use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::hydration::{EmbedInfo, HydrationBundle, Label};
use crate::records::GateRule;

/// Formatted authors keyed by DID.
pub type ActorInfoMap = HashMap<String, ProfileViewBasic>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActorViewerState {
    pub muted: bool,
    pub blocked_by: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileViewBasic {
    pub did: String,
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ActorViewerState>,
    pub labels: Vec<Label>,
}

impl ProfileViewBasic {
    /// Whether the author and the viewer block each other in either direction.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.viewer.as_ref().is_some_and(|viewer| viewer.blocking.is_some() || viewer.blocked_by)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageView {
    pub thumb: String,
    pub fullsize: String,
    pub alt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalView {
    pub uri: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "$type")]
pub enum EmbeddedRecordView {
    #[serde(rename = "app.bsky.embed.record#viewRecord", rename_all = "camelCase")]
    Record {
        uri: String,
        cid: String,
        author: ProfileViewBasic,
        value: Value,
        labels: Vec<Label>,
        #[serde(with = "time::serde::rfc3339")]
        indexed_at: OffsetDateTime,
    },
    #[serde(rename = "app.bsky.embed.record#viewNotFound", rename_all = "camelCase")]
    NotFound { uri: String, not_found: bool },
    #[serde(rename = "app.bsky.embed.record#viewBlocked")]
    Blocked { uri: String, blocked: bool, author: BlockedAuthor },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "$type")]
pub enum EmbedView {
    #[serde(rename = "app.bsky.embed.images#view")]
    Images { images: Vec<ImageView> },
    #[serde(rename = "app.bsky.embed.external#view")]
    External { external: ExternalView },
    #[serde(rename = "app.bsky.embed.record#view")]
    Record { record: EmbeddedRecordView },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListViewBasic {
    pub uri: String,
    pub cid: String,
    pub name: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreadgateView {
    pub uri: String,
    pub cid: String,
    pub record: Value,
    pub lists: Vec<ListViewBasic>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: String,
    pub cid: String,
    pub author: ProfileViewBasic,
    pub record: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbedView>,
    pub reply_count: i64,
    pub repost_count: i64,
    pub like_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub indexed_at: OffsetDateTime,
    pub labels: Vec<Label>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threadgate: Option<ThreadgateView>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadViewerState {
    pub can_reply: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreadViewPost {
    pub post: PostView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ThreadView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<ThreadView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ThreadViewerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundPost {
    pub uri: String,
    pub not_found: bool,
}

impl NotFoundPost {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), not_found: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockedAuthorViewer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedAuthor {
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<BlockedAuthorViewer>,
}

impl BlockedAuthor {
    #[must_use]
    pub fn from_profile(author: &ProfileViewBasic) -> Self {
        Self {
            did: author.did.clone(),
            viewer: author.viewer.as_ref().map(|viewer| BlockedAuthorViewer {
                blocked_by: Some(viewer.blocked_by),
                blocking: viewer.blocking.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedPost {
    pub uri: String,
    pub blocked: bool,
    pub author: BlockedAuthor,
}

/// One rendered node of the thread tree.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "$type")]
pub enum ThreadView {
    #[serde(rename = "app.bsky.feed.defs#threadViewPost")]
    Post(Box<ThreadViewPost>),
    #[serde(rename = "app.bsky.feed.defs#notFoundPost")]
    NotFound(NotFoundPost),
    #[serde(rename = "app.bsky.feed.defs#blockedPost")]
    Blocked(BlockedPost),
}

impl ThreadView {
    #[must_use]
    pub fn not_found(uri: impl Into<String>) -> Self {
        Self::NotFound(NotFoundPost::new(uri))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        match self {
            Self::Post(post) => &post.post.uri,
            Self::NotFound(post) => &post.uri,
            Self::Blocked(post) => &post.uri,
        }
    }

    #[must_use]
    pub fn as_post(&self) -> Option<&ThreadViewPost> {
        match self {
            Self::Post(post) => Some(&**post),
            _ => None,
        }
    }
}

/// Render one hydrated post. `None` when the post or its author is missing
/// from the bundle.
#[must_use]
pub fn format_post_view(
    uri: &str,
    actors: &ActorInfoMap,
    bundle: &HydrationBundle,
) -> Option<PostView> {
    let post = bundle.posts.get(uri)?;
    let author = actors.get(&post.creator)?;
    let embed = bundle.embeds.get(uri).map(|embed| format_embed(uri, embed, actors, bundle));
    let threadgate = bundle.threadgates.get(uri).map(|gate| ThreadgateView {
        uri: gate.uri.clone(),
        cid: gate.cid.clone(),
        record: gate.record.clone(),
        lists: gate
            .gate_record()
            .and_then(|record| record.allow)
            .unwrap_or_default()
            .iter()
            .filter_map(|rule| match rule {
                GateRule::List { list } => bundle.lists.get(list),
                _ => None,
            })
            .map(|list| ListViewBasic {
                uri: list.uri.clone(),
                cid: list.cid.clone(),
                name: list.name.clone(),
                purpose: list.purpose.clone(),
            })
            .collect(),
    });

    Some(PostView {
        uri: post.uri.clone(),
        cid: post.cid.clone(),
        author: author.clone(),
        record: post.record.clone(),
        embed,
        reply_count: post.reply_count,
        repost_count: post.repost_count,
        like_count: post.like_count,
        indexed_at: post.indexed_at,
        labels: bundle.labels_for(&post.uri),
        threadgate,
    })
}

fn format_embed(
    post_uri: &str,
    embed: &EmbedInfo,
    actors: &ActorInfoMap,
    bundle: &HydrationBundle,
) -> EmbedView {
    match embed {
        EmbedInfo::Images(images) => EmbedView::Images { images: images.clone() },
        EmbedInfo::External { uri, title, description, thumb } => EmbedView::External {
            external: ExternalView {
                uri: uri.clone(),
                title: title.clone(),
                description: description.clone(),
                thumb: thumb.clone(),
            },
        },
        EmbedInfo::Record { uri } => {
            let embedded = bundle.posts.get(uri);
            let author = embedded.and_then(|post| actors.get(&post.creator));
            let record = match (embedded, author) {
                (Some(post), Some(author))
                    if bundle.blocks_for(post_uri).embed || author.is_blocked() =>
                {
                    EmbeddedRecordView::Blocked {
                        uri: post.uri.clone(),
                        blocked: true,
                        author: BlockedAuthor::from_profile(author),
                    }
                }
                (Some(post), Some(author)) => EmbeddedRecordView::Record {
                    uri: post.uri.clone(),
                    cid: post.cid.clone(),
                    author: author.clone(),
                    value: post.record.clone(),
                    labels: bundle.labels_for(&post.uri),
                    indexed_at: post.indexed_at,
                },
                _ => EmbeddedRecordView::NotFound { uri: uri.clone(), not_found: true },
            };
            EmbedView::Record { record }
        }
    }
}
