use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use threadview_core::{
    evaluate_gate, uri_host, EmbedInfo, FeedRow, GateCheck, GateRule, HydrationBundle, ImageView,
    PostBlocks, PostRecord, RelevantIds, ThreadgateRecord,
};
use threadview_store_sqlite::{SqliteStore, StoredEmbed};

use crate::collaborators::{EntityHydrator, GatePolicy, RevisionSource, RowStore};

/// Base URL for image and avatar links built from `(did, cid)` blob refs.
pub const IMAGE_CDN_BASE: &str = "https://cdn.bsky.app/img";

/// Every collaborator served from one `SQLite` file. Each call opens its own
/// connection on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    db_path: PathBuf,
}

impl SqliteBackend {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let store = SqliteStore::open(&db_path)?;
            op(&store)
        })
        .await
        .context("sqlite task did not complete")?
    }
}

#[async_trait]
impl RowStore for SqliteBackend {
    async fn fetch_ancestors(&self, uri: &str, max_height: u32) -> Result<Vec<FeedRow>> {
        let uri = uri.to_string();
        self.with_store(move |store| store.fetch_ancestors(&uri, max_height)).await
    }

    async fn fetch_descendants(&self, uri: &str, max_depth: u32) -> Result<Vec<FeedRow>> {
        let uri = uri.to_string();
        self.with_store(move |store| store.fetch_descendants(&uri, max_depth)).await
    }
}

#[async_trait]
impl EntityHydrator for SqliteBackend {
    async fn hydrate(&self, ids: &RelevantIds, viewer: Option<&str>) -> Result<HydrationBundle> {
        let ids = ids.clone();
        let viewer = viewer.map(str::to_string);
        self.with_store(move |store| hydrate_from_store(store, &ids, viewer.as_deref())).await
    }
}

#[async_trait]
impl GatePolicy for SqliteBackend {
    async fn violates_gate(
        &self,
        viewer: &str,
        owner: &str,
        root: Option<&PostRecord>,
        gate: Option<&ThreadgateRecord>,
    ) -> Result<bool> {
        match evaluate_gate(viewer, owner, root, gate) {
            GateCheck::Allowed => Ok(false),
            GateCheck::Violated => Ok(true),
            GateCheck::Lookup(lookup) => {
                let viewer = viewer.to_string();
                let owner = owner.to_string();
                self.with_store(move |store| {
                    let followed = lookup.following && store.is_following(&owner, &viewer)?;
                    let in_list = store.in_any_list(&lookup.list_uris, &viewer)?;
                    Ok(lookup.violates(followed, in_list))
                })
                .await
            }
        }
    }
}

#[async_trait]
impl RevisionSource for SqliteBackend {
    async fn repo_revision(&self, viewer: Option<&str>) -> Result<Option<String>> {
        let Some(viewer) = viewer.map(str::to_string) else {
            return Ok(None);
        };
        self.with_store(move |store| store.repo_revision(&viewer)).await
    }
}

/// CDN URL for a blob CID owned by `did`, resized per `preset`.
#[must_use]
pub fn image_url(preset: &str, did: &str, cid: &str) -> String {
    format!("{IMAGE_CDN_BASE}/{preset}/plain/{did}/{cid}@jpeg")
}

/// Batch-load everything the composer needs for `ids` over one connection.
fn hydrate_from_store(
    store: &SqliteStore,
    ids: &RelevantIds,
    viewer: Option<&str>,
) -> Result<HydrationBundle> {
    let mut bundle = HydrationBundle::default();
    let requested = ids.uris.iter().cloned().collect::<Vec<_>>();

    for post in store.posts_by_uri(&requested)? {
        bundle.posts.insert(post.uri.clone(), post);
    }
    let stored_embeds = store.embeds_for_posts(&bundle.posts.keys().cloned().collect::<Vec<_>>())?;

    // Second round: posts quoted by record embeds.
    let quoted = stored_embeds
        .values()
        .filter_map(|embed| match embed {
            StoredEmbed::Record { uri, .. } if !bundle.posts.contains_key(uri) => Some(uri.clone()),
            _ => None,
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    for post in store.posts_by_uri(&quoted)? {
        bundle.posts.insert(post.uri.clone(), post);
    }

    let mut dids = ids.dids.clone();
    dids.extend(bundle.posts.values().map(|post| post.creator.clone()));
    let dids = dids.into_iter().collect::<Vec<_>>();
    for mut profile in store.actors_by_did(&dids, viewer)? {
        profile.avatar = profile
            .avatar
            .as_deref()
            .map(|cid| image_url("avatar", &profile.did, cid));
        bundle.profiles.insert(profile.did.clone(), profile);
    }

    let gated = requested.iter().chain(quoted.iter()).cloned().collect::<Vec<_>>();
    bundle.threadgates.extend(store.threadgates_for_posts(&gated)?);
    let list_uris = bundle
        .threadgates
        .values()
        .filter_map(|gate| gate.gate_record())
        .flat_map(|record| record.allow.unwrap_or_default())
        .filter_map(|rule| match rule {
            GateRule::List { list } => Some(list),
            _ => None,
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    for list in store.lists_by_uri(&list_uris)? {
        bundle.lists.insert(list.uri.clone(), list);
    }

    for (post_uri, embed) in stored_embeds {
        let Some(creator) = bundle.posts.get(&post_uri).map(|post| post.creator.clone()) else {
            continue;
        };
        let info = match embed {
            StoredEmbed::Images { images } => EmbedInfo::Images(
                images
                    .into_iter()
                    .map(|image| ImageView {
                        thumb: image_url("feed_thumbnail", &creator, &image.cid),
                        fullsize: image_url("feed_fullsize", &creator, &image.cid),
                        alt: image.alt,
                    })
                    .collect(),
            ),
            StoredEmbed::External { uri, title, description, thumb_cid } => EmbedInfo::External {
                uri,
                title,
                description,
                thumb: thumb_cid.map(|cid| image_url("feed_thumbnail", &creator, &cid)),
            },
            StoredEmbed::Record { uri, .. } => EmbedInfo::Record { uri },
        };
        bundle.embeds.insert(post_uri, info);
    }

    bundle.blocks = block_flags(store, &bundle)?;

    let subjects = bundle.posts.keys().cloned().chain(dids).collect::<Vec<_>>();
    for label in store.labels_for_subjects(&subjects)? {
        bundle.labels.entry(label.uri.clone()).or_default().push(label);
    }

    Ok(bundle)
}

/// Per-post third-party block flags: `reply` when the author and the author of
/// the reply parent or root block each other, `embed` likewise for a quoted post.
fn block_flags(
    store: &SqliteStore,
    bundle: &HydrationBundle,
) -> Result<HashMap<String, PostBlocks>> {
    let mut pairs = Vec::new();
    for post in bundle.posts.values() {
        let reply_authors = [post.reply_parent.as_deref(), post.reply_root.as_deref()]
            .into_iter()
            .flatten()
            .filter_map(uri_host);
        for author in reply_authors {
            pairs.push((post.uri.clone(), false, post.creator.clone(), author.to_string()));
        }
        if let Some(EmbedInfo::Record { uri }) = bundle.embeds.get(&post.uri) {
            if let Some(author) = uri_host(uri) {
                pairs.push((post.uri.clone(), true, post.creator.clone(), author.to_string()));
            }
        }
    }

    let dids = pairs
        .iter()
        .flat_map(|(_, _, creator, other)| [creator.clone(), other.clone()])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let edges = store.blocks_among(&dids)?.into_iter().collect::<HashSet<_>>();
    let blocked = |a: &str, b: &str| {
        a != b
            && (edges.contains(&(a.to_string(), b.to_string()))
                || edges.contains(&(b.to_string(), a.to_string())))
    };

    let mut flags: HashMap<String, PostBlocks> = HashMap::new();
    for (post_uri, is_embed, creator, other) in pairs {
        if !blocked(&creator, &other) {
            continue;
        }
        let entry = flags.entry(post_uri).or_default();
        if is_embed {
            entry.embed = true;
        } else {
            entry.reply = true;
        }
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use threadview_core::{ListInfo, POST_COLLECTION};
    use threadview_store_sqlite::{GraphEdge, NewActor, NewPost, StoredImage};
    use time::OffsetDateTime;

    use super::*;

    fn temp_backend() -> Result<(SqliteBackend, SqliteStore, PathBuf)> {
        let db_path = std::env::temp_dir()
            .join(format!("threadview-backend-{}.sqlite3", ulid::Ulid::new()));
        let mut store = SqliteStore::open(&db_path)?;
        store.migrate()?;
        Ok((SqliteBackend::new(db_path.clone()), store, db_path))
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    fn uri(author: &str, rkey: &str) -> String {
        format!("at://{author}/{POST_COLLECTION}/{rkey}")
    }

    fn post(author: &str, rkey: &str, reply: Option<(&str, &str)>) -> NewPost {
        let mut record = json!({"text": rkey, "createdAt": "2024-01-01T00:00:00Z"});
        if let Some((root, parent)) = reply {
            record["reply"] = json!({
                "root": {"uri": root, "cid": "cid"},
                "parent": {"uri": parent, "cid": "cid"},
            });
        }
        NewPost {
            uri: uri(author, rkey),
            cid: format!("cid-{rkey}"),
            record,
            indexed_at: OffsetDateTime::now_utc(),
            invalid_reply_root: false,
            violates_thread_gate: false,
            embed: None,
        }
    }

    fn actor(store: &mut SqliteStore, did: &str) -> Result<()> {
        store.upsert_actor(&NewActor {
            did: did.to_string(),
            handle: Some(format!("{did}.test")),
            display_name: None,
            avatar_cid: Some("bafyavatar".to_string()),
        })
    }

    fn block(store: &mut SqliteStore, creator: &str, subject: &str) -> Result<()> {
        store.insert_block(&GraphEdge {
            uri: format!("at://{creator}/app.bsky.graph.block/{}", ulid::Ulid::new()),
            cid: "cid-block".to_string(),
            creator: creator.to_string(),
            subject: subject.to_string(),
        })
    }

    // Test IDs: THYD-001
    #[tokio::test]
    async fn hydration_resolves_embeds_quotes_and_block_flags() -> Result<()> {
        let (backend, mut store, db_path) = temp_backend()?;
        for did in ["did:plc:alice", "did:plc:bob", "did:plc:carol"] {
            actor(&mut store, did)?;
        }
        let root = uri("did:plc:alice", "root");
        let mut root_post = post("did:plc:alice", "root", None);
        root_post.embed = Some(StoredEmbed::Images {
            images: vec![StoredImage { cid: "bafyimg".to_string(), alt: "a cat".to_string() }],
        });
        store.insert_post(&root_post)?;
        store.insert_post(&post("did:plc:bob", "reply", Some((&root, &root))))?;
        let quoted = uri("did:plc:carol", "quoted");
        store.insert_post(&post("did:plc:carol", "quoted", None))?;
        let mut quoting = post("did:plc:alice", "quoting", None);
        quoting.embed = Some(StoredEmbed::Record { uri: quoted.clone(), cid: "cid-quoted".to_string() });
        store.insert_post(&quoting)?;
        block(&mut store, "did:plc:bob", "did:plc:alice")?;
        block(&mut store, "did:plc:carol", "did:plc:alice")?;

        let ids = RelevantIds {
            dids: BTreeSet::from(["did:plc:alice".to_string(), "did:plc:bob".to_string()]),
            uris: BTreeSet::from([root.clone(), uri("did:plc:bob", "reply"), quoting.uri.clone()]),
        };
        let bundle = backend.hydrate(&ids, None).await?;

        assert!(bundle.posts.contains_key(&quoted), "quoted post should be hydrated");
        assert!(bundle.profiles.contains_key("did:plc:carol"));
        assert_eq!(
            bundle.profiles["did:plc:alice"].avatar.as_deref(),
            Some("https://cdn.bsky.app/img/avatar/plain/did:plc:alice/bafyavatar@jpeg")
        );
        let Some(EmbedInfo::Images(images)) = bundle.embeds.get(&root) else {
            panic!("expected image embed on root: {:?}", bundle.embeds.get(&root));
        };
        assert_eq!(
            images[0].thumb,
            "https://cdn.bsky.app/img/feed_thumbnail/plain/did:plc:alice/bafyimg@jpeg"
        );
        assert!(bundle.blocks_for(&uri("did:plc:bob", "reply")).reply);
        assert!(bundle.blocks_for(&quoting.uri).embed);
        assert!(!bundle.blocks_for(&root).reply);

        drop(store);
        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: THYD-002
    #[tokio::test]
    async fn gate_policy_consults_follows_and_lists() -> Result<()> {
        let (backend, mut store, db_path) = temp_backend()?;
        let list_uri = "at://did:plc:owner/app.bsky.graph.list/l".to_string();
        store.insert_list(&ListInfo {
            uri: list_uri.clone(),
            cid: "cid-list".to_string(),
            creator: "did:plc:owner".to_string(),
            name: "l".to_string(),
            purpose: "app.bsky.graph.defs#curatelist".to_string(),
        })?;
        store.insert_list_item(
            &list_uri,
            &GraphEdge {
                uri: "at://did:plc:owner/app.bsky.graph.listitem/1".to_string(),
                cid: "cid-item".to_string(),
                creator: "did:plc:owner".to_string(),
                subject: "did:plc:listed".to_string(),
            },
        )?;
        store.insert_follow(&GraphEdge {
            uri: "at://did:plc:owner/app.bsky.graph.follow/1".to_string(),
            cid: "cid-follow".to_string(),
            creator: "did:plc:owner".to_string(),
            subject: "did:plc:friend".to_string(),
        })?;
        let gate = ThreadgateRecord {
            post: uri("did:plc:owner", "root"),
            allow: Some(vec![GateRule::Following, GateRule::List { list: list_uri }]),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        };

        for (viewer, expected) in [
            ("did:plc:friend", false),
            ("did:plc:listed", false),
            ("did:plc:stranger", true),
            ("did:plc:owner", false),
        ] {
            let violates = backend.violates_gate(viewer, "did:plc:owner", None, Some(&gate)).await?;
            assert_eq!(violates, expected, "viewer {viewer}");
        }
        assert!(!backend.violates_gate("did:plc:stranger", "did:plc:owner", None, None).await?);

        assert_eq!(backend.repo_revision(None).await?, None);
        store.set_repo_revision("did:plc:friend", "cid-commit", "3krev")?;
        assert_eq!(backend.repo_revision(Some("did:plc:friend")).await?, Some("3krev".to_string()));

        drop(store);
        cleanup(&db_path);
        Ok(())
    }
}
