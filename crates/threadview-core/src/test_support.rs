use std::collections::HashSet;

use time::{Duration, OffsetDateTime};

use crate::hydration::{HydrationBundle, PostInfo, ProfileInfo};
use crate::views::{ActorViewerState, ProfileViewBasic};
use crate::{FeedRow, POST_COLLECTION};

pub fn mk_row(rkey: &str, author: &str, parent: Option<&FeedRow>, sort_secs: i64) -> FeedRow {
    FeedRow {
        uri: format!("at://{author}/{POST_COLLECTION}/{rkey}"),
        cid: format!("cid-{rkey}"),
        author_did: author.to_string(),
        reply_root: parent.map(|parent| parent.root_uri().to_string()),
        reply_parent: parent.map(|parent| parent.uri.clone()),
        sort_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(sort_secs),
        invalid_reply_root: false,
        violates_thread_gate: false,
    }
}

pub fn handle_for(did: &str) -> String {
    format!("{}.test", did.rsplit(':').next().unwrap_or(did))
}

pub fn mk_actor(did: &str, viewer: Option<ActorViewerState>) -> ProfileViewBasic {
    ProfileViewBasic {
        did: did.to_string(),
        handle: handle_for(did),
        display_name: None,
        avatar: None,
        viewer,
        labels: Vec::new(),
    }
}

/// Bundle holding a post and a profile for every row.
pub fn mk_bundle(rows: &[FeedRow]) -> HydrationBundle {
    let mut bundle = HydrationBundle::default();
    for row in rows {
        let mut record = serde_json::json!({
            "text": format!("post {}", row.uri),
            "createdAt": "2024-01-01T00:00:00.000Z",
        });
        if let (Some(root), Some(parent)) = (&row.reply_root, &row.reply_parent) {
            record["reply"] = serde_json::json!({
                "root": {"uri": root, "cid": "cid-root"},
                "parent": {"uri": parent, "cid": "cid-parent"},
            });
        }
        bundle.posts.insert(
            row.uri.clone(),
            PostInfo {
                uri: row.uri.clone(),
                cid: row.cid.clone(),
                creator: row.author_did.clone(),
                record,
                indexed_at: row.sort_at,
                reply_root: row.reply_root.clone(),
                reply_parent: row.reply_parent.clone(),
                invalid_reply_root: row.invalid_reply_root,
                violates_thread_gate: row.violates_thread_gate,
                reply_count: 0,
                repost_count: 0,
                like_count: 0,
            },
        );
        bundle.profiles.entry(row.author_did.clone()).or_insert_with(|| ProfileInfo {
            did: row.author_did.clone(),
            handle: Some(handle_for(&row.author_did)),
            display_name: None,
            avatar: None,
            viewer_muted: false,
            viewer_blocking: None,
            viewer_blocked_by: false,
        });
    }
    bundle
}

/// Anchor plus up to `height` existing ancestors, like the bounded store query.
pub fn fetch_ancestors(rows: &[FeedRow], uri: &str, height: u32) -> Vec<FeedRow> {
    let mut out = Vec::new();
    let mut next = Some(uri.to_string());
    let mut hops = 0;
    while let Some(current) = next.take() {
        let Some(row) = rows.iter().find(|row| row.uri == current) else {
            break;
        };
        out.push(row.clone());
        if hops < height {
            next = row.reply_parent.clone();
            hops += 1;
        }
    }
    out
}

/// Descendants up to `depth` levels below `uri`, newest first.
pub fn fetch_descendants(rows: &[FeedRow], uri: &str, depth: u32) -> Vec<FeedRow> {
    let mut out = Vec::new();
    let mut frontier = HashSet::from([uri.to_string()]);
    for _ in 0..depth {
        let level = rows
            .iter()
            .filter(|row| row.reply_parent.as_ref().is_some_and(|parent| frontier.contains(parent)))
            .cloned()
            .collect::<Vec<_>>();
        if level.is_empty() {
            break;
        }
        frontier = level.iter().map(|row| row.uri.clone()).collect();
        out.extend(level);
    }
    out.sort_by(|a, b| b.sort_at.cmp(&a.sort_at).then_with(|| b.uri.cmp(&a.uri)));
    out
}
