use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "$type")]
pub enum FacetFeature {
    #[serde(rename = "app.bsky.richtext.facet#mention")]
    Mention { did: String },
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link { uri: String },
    #[serde(rename = "app.bsky.richtext.facet#tag")]
    Tag { tag: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Facet {
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

/// The subset of a post record the read path inspects.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<Facet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl PostRecord {
    /// Decode from a stored record body; `None` when the shape does not match.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    #[must_use]
    pub fn mentions(&self, did: &str) -> bool {
        self.facets.iter().any(|facet| {
            facet.features.iter().any(|feature| {
                matches!(feature, FacetFeature::Mention { did: mentioned } if mentioned == did)
            })
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "$type")]
pub enum GateRule {
    #[serde(rename = "app.bsky.feed.threadgate#mentionRule")]
    Mention,
    #[serde(rename = "app.bsky.feed.threadgate#followingRule")]
    Following,
    #[serde(rename = "app.bsky.feed.threadgate#listRule")]
    List { list: String },
    #[serde(other)]
    Unknown,
}

/// Reply-gate attached to a thread root. `allow: None` places no restriction;
/// `allow: Some(vec![])` restricts replies to the root's author.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadgateRecord {
    pub post: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<GateRule>>,
    #[serde(default)]
    pub created_at: String,
}

impl ThreadgateRecord {
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
