use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::records::{PostRecord, ThreadgateRecord};
use crate::views::ImageView;

/// Hydrated post body and counters, keyed by URI in [`HydrationBundle::posts`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostInfo {
    pub uri: String,
    pub cid: String,
    pub creator: String,
    pub record: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub indexed_at: OffsetDateTime,
    pub reply_root: Option<String>,
    pub reply_parent: Option<String>,
    pub invalid_reply_root: bool,
    pub violates_thread_gate: bool,
    pub reply_count: i64,
    pub repost_count: i64,
    pub like_count: i64,
}

impl PostInfo {
    #[must_use]
    pub fn post_record(&self) -> Option<PostRecord> {
        PostRecord::from_value(&self.record)
    }

    /// Row flags that mark this post as an illegitimate reply.
    #[must_use]
    pub fn is_bad_reply(&self) -> bool {
        self.invalid_reply_root || self.violates_thread_gate
    }
}

/// Author data plus the requesting viewer's relationship to the author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileInfo {
    pub did: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub viewer_muted: bool,
    pub viewer_blocking: Option<String>,
    pub viewer_blocked_by: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadgateInfo {
    pub uri: String,
    pub cid: String,
    pub record: Value,
}

impl ThreadgateInfo {
    #[must_use]
    pub fn gate_record(&self) -> Option<ThreadgateRecord> {
        ThreadgateRecord::from_value(&self.record)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EmbedInfo {
    Images(Vec<ImageView>),
    External { uri: String, title: String, description: String, thumb: Option<String> },
    Record { uri: String },
}

/// Third-party block edges that suppress parts of a post.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PostBlocks {
    pub reply: bool,
    pub embed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub src: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub val: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub neg: bool,
    pub cts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListInfo {
    pub uri: String,
    pub cid: String,
    pub creator: String,
    pub name: String,
    pub purpose: String,
}

/// Everything the composer needs, fetched once per request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrationBundle {
    pub posts: HashMap<String, PostInfo>,
    pub profiles: HashMap<String, ProfileInfo>,
    pub threadgates: HashMap<String, ThreadgateInfo>,
    pub embeds: HashMap<String, EmbedInfo>,
    pub blocks: HashMap<String, PostBlocks>,
    pub labels: HashMap<String, Vec<Label>>,
    pub lists: HashMap<String, ListInfo>,
}

impl HydrationBundle {
    #[must_use]
    pub fn labels_for(&self, subject: &str) -> Vec<Label> {
        self.labels.get(subject).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn blocks_for(&self, uri: &str) -> PostBlocks {
        self.blocks.get(uri).copied().unwrap_or_default()
    }
}
