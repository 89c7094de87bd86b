use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use threadview_core::{
    uri_host, AtUri, GateRule, Label, ListInfo, PostRecord, StrongRef, ThreadError, ThreadParams,
    POST_COLLECTION,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub mod backend;
pub mod collaborators;
pub mod thread;

pub use backend::{image_url, SqliteBackend, IMAGE_CDN_BASE};
pub use collaborators::{
    ActorPresenter, BasicActorPresenter, EntityHydrator, GatePolicy, RevisionSource, RowStore,
    INVALID_HANDLE,
};
pub use thread::{
    get_post_thread, HydrationState, SkeletonState, ThreadContext, ThreadOutput, ThreadResponse,
};
pub use threadview_store_sqlite::{
    ForeignKeyViolation, GraphEdge, IntegrityReport, NewActor, NewPost, PostCounts, SchemaStatus,
    SqliteStore, StoredEmbed, StoredImage,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const THREADGATE_COLLECTION: &str = "app.bsky.feed.threadgate";
pub const BLOCK_COLLECTION: &str = "app.bsky.graph.block";
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";
pub const LIST_COLLECTION: &str = "app.bsky.graph.list";
pub const LIST_ITEM_COLLECTION: &str = "app.bsky.graph.listitem";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AddPostRequest {
    pub author: String,
    pub text: String,
    /// Record key; a fresh ULID when absent.
    pub rkey: Option<String>,
    /// URI of the post being replied to. Root and parent refs are resolved from the store.
    pub reply_to: Option<String>,
    pub mentions: Vec<String>,
    pub embed: Option<StoredEmbed>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub invalid_reply_root: bool,
    pub violates_thread_gate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddGateRequest {
    pub post_uri: String,
    /// `None` leaves replies open; an empty list restricts them to the owner.
    pub allow: Option<Vec<GateRule>>,
}

/// A record written through the API, with its derived address and CID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WrittenRecord {
    pub uri: String,
    pub cid: String,
    pub record: Value,
}

#[derive(Debug, Clone)]
pub struct ThreadViewApi {
    db_path: PathBuf,
}

impl ThreadViewApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Create or update an actor profile.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_actor(&self, actor: NewActor) -> Result<NewActor> {
        let mut store = self.open_migrated()?;
        store.upsert_actor(&actor)?;
        Ok(actor)
    }

    /// Write one post, resolving reply refs from the stored parent.
    ///
    /// # Errors
    /// Returns an error when the reply parent is unknown or persistence fails.
    pub fn add_post(&self, input: AddPostRequest) -> Result<NewPost> {
        let mut store = self.open_migrated()?;
        let reply = match &input.reply_to {
            Some(parent_uri) => Some(resolve_reply(&store, parent_uri)?),
            None => None,
        };
        let indexed_at = OffsetDateTime::now_utc();
        let created_at = input.created_at.unwrap_or(indexed_at);
        let rkey = input.rkey.clone().unwrap_or_else(new_rkey);
        let uri = AtUri {
            host: input.author.clone(),
            collection: POST_COLLECTION.to_string(),
            rkey,
        }
        .to_string();
        AtUri::parse(&uri)?;

        let mut record = json!({
            "$type": POST_COLLECTION,
            "text": input.text,
            "createdAt": created_at.format(&Rfc3339).context("failed to format createdAt")?,
        });
        if let Some((root, parent)) = reply {
            record["reply"] = json!({ "root": root, "parent": parent });
        }
        if !input.mentions.is_empty() {
            // Mention facets span the whole text; only the DID is read back.
            let byte_end = input.text.len();
            record["facets"] = Value::Array(
                input
                    .mentions
                    .iter()
                    .map(|did| {
                        json!({
                            "index": {"byteStart": 0, "byteEnd": byte_end},
                            "features": [{"$type": "app.bsky.richtext.facet#mention", "did": did}],
                        })
                    })
                    .collect(),
            );
        }
        if let Some(embed) = &input.embed {
            record["embed"] = embed_record_json(embed);
        }

        let post = NewPost {
            uri,
            cid: record_cid(&record)?,
            record,
            indexed_at,
            invalid_reply_root: input.invalid_reply_root,
            violates_thread_gate: input.violates_thread_gate,
            embed: input.embed,
        };
        store.insert_post(&post)?;
        Ok(post)
    }

    /// # Errors
    /// Returns an error when the post is unknown or the update fails.
    pub fn take_down(&self, uri: &str) -> Result<()> {
        let mut store = self.open_migrated()?;
        if !store.take_down_post(uri)? {
            return Err(anyhow!("post not found: {uri}"));
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the post is unknown or the update fails.
    pub fn set_counts(&self, uri: &str, counts: &PostCounts) -> Result<()> {
        let mut store = self.open_migrated()?;
        if !store.set_post_counts(uri, counts)? {
            return Err(anyhow!("post not found: {uri}"));
        }
        Ok(())
    }

    /// Attach a reply-gate to a post. The gate shares the post's record key.
    ///
    /// # Errors
    /// Returns an error when the post URI is malformed or persistence fails.
    pub fn add_gate(&self, input: AddGateRequest) -> Result<WrittenRecord> {
        let post = AtUri::parse(&input.post_uri)?;
        let mut store = self.open_migrated()?;
        let uri = AtUri {
            host: post.host.clone(),
            collection: THREADGATE_COLLECTION.to_string(),
            rkey: post.rkey,
        }
        .to_string();
        let mut record = json!({
            "$type": THREADGATE_COLLECTION,
            "post": input.post_uri,
            "createdAt": now_rfc3339()?,
        });
        if let Some(allow) = &input.allow {
            record["allow"] = serde_json::to_value(allow).context("failed to serialize gate rules")?;
        }
        let cid = record_cid(&record)?;
        store.insert_thread_gate(&uri, &cid, &record)?;
        Ok(WrittenRecord { uri, cid, record })
    }

    /// Record that `creator` blocks `subject`.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_block(&self, creator: &str, subject: &str) -> Result<GraphEdge> {
        let mut store = self.open_migrated()?;
        let edge = graph_edge(BLOCK_COLLECTION, creator, subject, json!({ "subject": subject }))?;
        store.insert_block(&edge)?;
        Ok(edge)
    }

    /// Record that `creator` follows `subject`.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_follow(&self, creator: &str, subject: &str) -> Result<GraphEdge> {
        let mut store = self.open_migrated()?;
        let edge = graph_edge(FOLLOW_COLLECTION, creator, subject, json!({ "subject": subject }))?;
        store.insert_follow(&edge)?;
        Ok(edge)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_mute(&self, muted_by: &str, subject: &str) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.insert_mute(muted_by, subject)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_list(&self, creator: &str, name: &str, purpose: &str) -> Result<ListInfo> {
        let mut store = self.open_migrated()?;
        let record = json!({
            "$type": LIST_COLLECTION,
            "name": name,
            "purpose": purpose,
            "createdAt": now_rfc3339()?,
        });
        let list = ListInfo {
            uri: format!("at://{creator}/{LIST_COLLECTION}/{}", new_rkey()),
            cid: record_cid(&record)?,
            creator: creator.to_string(),
            name: name.to_string(),
            purpose: purpose.to_string(),
        };
        store.insert_list(&list)?;
        Ok(list)
    }

    /// Add `subject` to a list, written by the list's owner.
    ///
    /// # Errors
    /// Returns an error when the list URI is malformed, the list is unknown, or
    /// persistence fails.
    pub fn add_list_item(&self, list_uri: &str, subject: &str) -> Result<GraphEdge> {
        let owner = uri_host(list_uri).ok_or_else(|| anyhow!("list uri has no owner: {list_uri}"))?;
        let mut store = self.open_migrated()?;
        let edge = graph_edge(
            LIST_ITEM_COLLECTION,
            owner,
            subject,
            json!({ "list": list_uri, "subject": subject }),
        )?;
        store.insert_list_item(list_uri, &edge)?;
        Ok(edge)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_label(&self, label: Label) -> Result<Label> {
        let mut store = self.open_migrated()?;
        store.insert_label(&label)?;
        Ok(label)
    }

    /// Set the repository revision reported for `did`.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn set_repo_rev(&self, did: &str, rev: &str) -> Result<()> {
        let mut store = self.open_migrated()?;
        let cid = record_cid(&json!({ "did": did, "rev": rev }))?;
        store.set_repo_revision(did, &cid, rev)
    }

    /// Collaborators backed by this database.
    #[must_use]
    pub fn thread_context(&self) -> ThreadContext {
        let backend = Arc::new(SqliteBackend::new(self.db_path.clone()));
        ThreadContext {
            rows: backend.clone(),
            hydrator: backend.clone(),
            gate_policy: backend.clone(),
            actors: Arc::new(BasicActorPresenter),
            revisions: backend,
        }
    }

    /// Render the thread around `params.uri` for the optional viewer.
    ///
    /// # Errors
    /// See [`get_post_thread`].
    pub async fn post_thread(&self, params: ThreadParams) -> Result<ThreadResponse, ThreadError> {
        get_post_thread(&self.thread_context(), params).await
    }
}

/// Root and parent refs for a reply to `parent_uri`.
fn resolve_reply(store: &SqliteStore, parent_uri: &str) -> Result<(StrongRef, StrongRef)> {
    let parent = store
        .posts_by_uri(&[parent_uri.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("reply parent not found: {parent_uri}"))?;
    let parent_ref = StrongRef { uri: parent.uri.clone(), cid: parent.cid.clone() };
    let root_ref = parent
        .post_record()
        .and_then(|record: PostRecord| record.reply)
        .map_or_else(|| parent_ref.clone(), |reply| reply.root);
    Ok((root_ref, parent_ref))
}

fn graph_edge(collection: &str, creator: &str, subject: &str, mut record: Value) -> Result<GraphEdge> {
    record["$type"] = json!(collection);
    record["createdAt"] = json!(now_rfc3339()?);
    Ok(GraphEdge {
        uri: format!("at://{creator}/{collection}/{}", new_rkey()),
        cid: record_cid(&record)?,
        creator: creator.to_string(),
        subject: subject.to_string(),
    })
}

fn embed_record_json(embed: &StoredEmbed) -> Value {
    match embed {
        StoredEmbed::Images { images } => json!({
            "$type": "app.bsky.embed.images",
            "images": images
                .iter()
                .map(|image| json!({"alt": image.alt, "image": {"ref": image.cid}}))
                .collect::<Vec<_>>(),
        }),
        StoredEmbed::External { uri, title, description, .. } => json!({
            "$type": "app.bsky.embed.external",
            "external": {"uri": uri, "title": title, "description": description},
        }),
        StoredEmbed::Record { uri, cid } => json!({
            "$type": "app.bsky.embed.record",
            "record": {"uri": uri, "cid": cid},
        }),
    }
}

fn new_rkey() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format timestamp")
}

/// Content address of a record body.
fn record_cid(record: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(record).context("failed to serialize record")?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("sha256:{digest:x}"))
}
