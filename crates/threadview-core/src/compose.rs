use crate::hydration::{HydrationBundle, PostInfo};
use crate::skeleton::{ParentNode, PostThread};
use crate::views::{
    format_post_view, ActorInfoMap, BlockedAuthor, BlockedPost, PostView, ThreadView,
    ThreadViewPost, ThreadViewerState,
};
use crate::ThreadError;

/// Renders a skeleton into the client-facing thread tree.
#[derive(Debug, Clone, Copy)]
pub struct Composer<'a> {
    pub anchor_uri: &'a str,
    pub bundle: &'a HydrationBundle,
    pub actors: &'a ActorInfoMap,
}

/// Outcome of rendering a single node, before its neighbors are known.
enum Head {
    Done(ThreadView),
    Post { post: Box<PostView>, bad_reply: bool },
}

/// Arena slot used while composing. Neighbors always sit at higher indexes
/// than the node that points at them.
enum Slot {
    Pending,
    Done(ThreadView),
    Post { post: Box<PostView>, parent: Option<usize>, replies: Option<Vec<usize>> },
}

impl Slot {
    fn take_view(&mut self) -> Option<ThreadView> {
        match std::mem::replace(self, Self::Pending) {
            Self::Done(view) => Some(view),
            other => {
                *self = other;
                None
            }
        }
    }
}

impl Composer<'_> {
    /// Compose one node and everything below and above it.
    ///
    /// Replies that violate their thread's gate (or point at an invalid root)
    /// may appear as the anchor, without parent or replies, and nowhere else.
    /// Runs in constant stack depth however tall the thread is.
    #[must_use]
    pub fn compose(&self, thread: &PostThread) -> ThreadView {
        let mut slots = vec![Slot::Pending];
        let mut work = vec![(thread, 0)];
        while let Some((node, slot)) = work.pop() {
            let filled = match self.head(node) {
                Head::Done(view) => Slot::Done(view),
                Head::Post { post, bad_reply: true } => {
                    Slot::Post { post, parent: None, replies: None }
                }
                Head::Post { post, bad_reply: false } => {
                    let parent = match &node.parent {
                        Some(ParentNode::Resolved(parent)) => {
                            let parent: &PostThread = parent;
                            slots.push(Slot::Pending);
                            work.push((parent, slots.len() - 1));
                            Some(slots.len() - 1)
                        }
                        Some(ParentNode::NotFound { uri }) => {
                            slots.push(Slot::Done(ThreadView::not_found(uri.as_str())));
                            Some(slots.len() - 1)
                        }
                        None => None,
                    };
                    let replies = node.replies.as_ref().map(|replies| {
                        let mut ids = Vec::with_capacity(replies.len());
                        for reply in replies {
                            slots.push(Slot::Pending);
                            work.push((reply, slots.len() - 1));
                            ids.push(slots.len() - 1);
                        }
                        ids
                    });
                    Slot::Post { post, parent, replies }
                }
            };
            slots[slot] = filled;
        }

        for idx in (0..slots.len()).rev() {
            let (post, parent, replies) = match std::mem::replace(&mut slots[idx], Slot::Pending) {
                Slot::Post { post, parent, replies } => (post, parent, replies),
                other => {
                    slots[idx] = other;
                    continue;
                }
            };
            let parent = parent.and_then(|id| slots[id].take_view());
            // Unrenderable replies are dropped rather than shown as placeholders.
            let replies = replies.map(|ids| {
                ids.into_iter()
                    .filter_map(|id| slots[id].take_view())
                    .filter(|reply| !reply.is_not_found())
                    .collect()
            });
            slots[idx] = Slot::Done(ThreadView::Post(Box::new(ThreadViewPost {
                post: *post,
                parent,
                replies,
                viewer: None,
            })));
        }

        slots
            .first_mut()
            .and_then(Slot::take_view)
            .unwrap_or_else(|| ThreadView::not_found(thread.uri()))
    }

    /// Render `thread` alone, ignoring its parent and replies.
    fn head(&self, thread: &PostThread) -> Head {
        let uri = thread.uri();
        let bad_reply = self.bundle.posts.get(uri).is_some_and(PostInfo::is_bad_reply);
        let omit_bad_reply = bad_reply && uri != self.anchor_uri;

        let Some(post) = format_post_view(uri, self.actors, self.bundle) else {
            return Head::Done(ThreadView::not_found(uri));
        };
        if self.bundle.blocks_for(uri).reply || omit_bad_reply {
            return Head::Done(ThreadView::not_found(uri));
        }
        if post.author.is_blocked() {
            return Head::Done(ThreadView::Blocked(BlockedPost {
                uri: uri.to_string(),
                blocked: true,
                author: BlockedAuthor::from_profile(&post.author),
            }));
        }
        Head::Post { post: Box::new(post), bad_reply }
    }
}

/// Turn the composed top node into the response: an unrenderable anchor is a
/// request failure, and `viewer.canReply` goes on the anchor only.
///
/// # Errors
/// Returns [`ThreadError::NotFound`] naming `uri` when the anchor composed to
/// a not-found node.
pub fn finalize_thread(
    thread: ThreadView,
    uri: &str,
    viewer: Option<&str>,
    can_reply: bool,
) -> Result<ThreadView, ThreadError> {
    match thread {
        ThreadView::NotFound(_) => Err(ThreadError::NotFound(uri.to_string())),
        ThreadView::Post(mut post) => {
            if viewer.is_some() {
                post.viewer = Some(ThreadViewerState { can_reply });
            }
            Ok(ThreadView::Post(post))
        }
        blocked @ ThreadView::Blocked(_) => Ok(blocked),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::hydration::PostBlocks;
    use crate::skeleton::build_thread;
    use crate::test_support::{fetch_ancestors, fetch_descendants, mk_actor, mk_bundle, mk_row};
    use crate::views::ActorViewerState;
    use crate::FeedRow;

    fn actors_for(bundle: &HydrationBundle) -> ActorInfoMap {
        bundle.profiles.keys().map(|did| (did.clone(), mk_actor(did, None))).collect()
    }

    fn skeleton(rows: &[FeedRow], uri: &str, parent_height: u32, depth: u32) -> PostThread {
        build_thread(
            uri,
            &fetch_ancestors(rows, uri, parent_height),
            &fetch_descendants(rows, uri, depth),
            parent_height,
            depth,
        )
        .unwrap_or_else(|| panic!("anchor {uri} should exist"))
    }

    fn post(view: &ThreadView) -> &ThreadViewPost {
        view.as_post().unwrap_or_else(|| panic!("expected thread view post, got {view:?}"))
    }

    // Test IDs: TCMP-001
    #[test]
    fn deleted_root_becomes_not_found_parent() {
        let root = mk_row("root", "did:plc:alice", None, 1);
        let a = mk_row("a", "did:plc:bob", Some(&root), 2);
        let rows = vec![a.clone()];
        let bundle = mk_bundle(&rows);
        let actors = actors_for(&bundle);
        let composer = Composer { anchor_uri: &a.uri, bundle: &bundle, actors: &actors };

        let view = composer.compose(&skeleton(&rows, &a.uri, 5, 6));
        let parent = post(&view).parent.as_ref().unwrap_or_else(|| panic!("parent expected"));
        assert_eq!(parent, &ThreadView::not_found(root.uri.as_str()));
    }

    // Test IDs: TCMP-002
    #[test]
    fn gate_violating_reply_is_dropped_from_replies() {
        let a = mk_row("a", "did:plc:alice", None, 1);
        let b = mk_row("b", "did:plc:bob", Some(&a), 2);
        let mut c = mk_row("c", "did:plc:carol", Some(&a), 3);
        c.violates_thread_gate = true;
        let rows = vec![a.clone(), b.clone(), c.clone()];
        let bundle = mk_bundle(&rows);
        let actors = actors_for(&bundle);
        let composer = Composer { anchor_uri: &a.uri, bundle: &bundle, actors: &actors };

        let view = composer.compose(&skeleton(&rows, &a.uri, 0, 1));
        let replies = post(&view).replies.as_ref().unwrap_or_else(|| panic!("replies expected"));
        assert_eq!(replies.iter().map(ThreadView::uri).collect::<Vec<_>>(), vec![b.uri.as_str()]);
    }

    // Test IDs: TCMP-003
    #[test]
    fn flagged_anchor_renders_without_parent_or_replies() {
        let root = mk_row("root", "did:plc:alice", None, 1);
        let mut a = mk_row("a", "did:plc:bob", Some(&root), 2);
        a.invalid_reply_root = true;
        let b = mk_row("b", "did:plc:carol", Some(&a), 3);
        let rows = vec![root, a.clone(), b];
        let bundle = mk_bundle(&rows);
        let actors = actors_for(&bundle);
        let composer = Composer { anchor_uri: &a.uri, bundle: &bundle, actors: &actors };

        let view = composer.compose(&skeleton(&rows, &a.uri, 5, 5));
        let anchor = post(&view);
        assert_eq!(anchor.post.uri, a.uri);
        assert!(anchor.parent.is_none());
        assert!(anchor.replies.is_none());
    }

    // Test IDs: TCMP-004
    #[test]
    fn blocks_render_blocked_or_not_found() {
        let root = mk_row("root", "did:plc:alice", None, 1);
        let a = mk_row("a", "did:plc:bob", Some(&root), 2);
        let b = mk_row("b", "did:plc:carol", Some(&a), 3);
        let rows = vec![root.clone(), a.clone(), b.clone()];
        let mut bundle = mk_bundle(&rows);
        bundle.blocks.insert(b.uri.clone(), PostBlocks { reply: true, embed: false });
        let mut actors = actors_for(&bundle);
        actors.insert(
            "did:plc:alice".to_string(),
            mk_actor(
                "did:plc:alice",
                Some(ActorViewerState {
                    muted: false,
                    blocked_by: false,
                    blocking: Some("at://did:plc:viewer/app.bsky.graph.block/1".to_string()),
                }),
            ),
        );
        let composer = Composer { anchor_uri: &a.uri, bundle: &bundle, actors: &actors };

        let view = composer.compose(&skeleton(&rows, &a.uri, 5, 5));
        let anchor = post(&view);
        let Some(ThreadView::Blocked(parent)) = &anchor.parent else {
            panic!("expected blocked parent, got {:?}", anchor.parent);
        };
        assert_eq!(parent.uri, root.uri);
        assert_eq!(parent.author.did, "did:plc:alice");
        // b's reply edge is blocked: it composes to not-found and is dropped.
        assert_eq!(anchor.replies, Some(Vec::new()));
    }

    // Test IDs: TCMP-005
    #[test]
    fn finalize_attaches_can_reply_for_viewers_only() -> Result<(), ThreadError> {
        let a = mk_row("a", "did:plc:alice", None, 1);
        let rows = vec![a.clone()];
        let bundle = mk_bundle(&rows);
        let actors = actors_for(&bundle);
        let composer = Composer { anchor_uri: &a.uri, bundle: &bundle, actors: &actors };
        let view = composer.compose(&skeleton(&rows, &a.uri, 0, 0));

        let anonymous = finalize_thread(view.clone(), &a.uri, None, true)?;
        assert!(post(&anonymous).viewer.is_none());
        let viewed = finalize_thread(view, &a.uri, Some("did:plc:viewer"), false)?;
        assert_eq!(post(&viewed).viewer, Some(ThreadViewerState { can_reply: false }));

        let missing = finalize_thread(ThreadView::not_found(a.uri.as_str()), &a.uri, None, true);
        assert!(matches!(missing, Err(ThreadError::NotFound(uri)) if uri == a.uri));
        Ok(())
    }

    // Test IDs: TCMP-006
    #[test]
    fn full_bound_chains_compose_on_a_small_stack() {
        let bound = crate::MAX_THREAD_BOUND;
        let composed = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                let authors = ["did:plc:alice", "did:plc:bob", "did:plc:carol"];
                let mut rows = vec![mk_row("n0", authors[0], None, 0)];
                for idx in 1..=2 * bound {
                    let parent = rows[rows.len() - 1].clone();
                    let author = authors[usize::try_from(idx).unwrap_or(0) % authors.len()];
                    rows.push(mk_row(&format!("n{idx}"), author, Some(&parent), i64::from(idx)));
                }
                let anchor = rows[usize::try_from(bound).unwrap_or(0)].clone();
                let thread = skeleton(&rows, &anchor.uri, bound, bound);
                assert_eq!(thread.node_count(), rows.len());
                let ids = crate::RelevantIds::collect(&thread);
                assert_eq!(ids.uris.len(), rows.len());

                let bundle = mk_bundle(&rows);
                let actors = actors_for(&bundle);
                let composer = Composer { anchor_uri: &anchor.uri, bundle: &bundle, actors: &actors };
                let view = composer.compose(&thread);
                finalize_thread(view, &anchor.uri, Some("did:plc:viewer"), true)
                    .unwrap_or_else(|err| panic!("anchor should render: {err}"))
            })
            .unwrap_or_else(|err| panic!("failed to spawn compose thread: {err}"))
            .join()
            .unwrap_or_else(|_| panic!("compose thread panicked"));

        let mut above = 0;
        let mut cursor = post(&composed);
        while let Some(parent) = &cursor.parent {
            above += 1;
            cursor = post(parent);
        }
        let mut below = 0;
        let mut cursor = post(&composed);
        while let Some(replies) = &cursor.replies {
            assert_eq!(replies.len(), 1);
            below += 1;
            cursor = post(&replies[0]);
        }
        assert_eq!((above, below), (bound, bound));

        let json = std::thread::Builder::new()
            .stack_size(crate::RENDER_STACK_SIZE)
            .spawn(move || serde_json::to_string(&composed))
            .unwrap_or_else(|err| panic!("failed to spawn render thread: {err}"))
            .join()
            .unwrap_or_else(|_| panic!("render thread panicked"))
            .unwrap_or_else(|err| panic!("thread should serialize: {err}"));
        assert_eq!(json.matches("app.bsky.feed.defs#threadViewPost").count(), 2001);
        assert_eq!(json.matches("\"canReply\":true").count(), 1);
    }

    #[derive(Debug, Clone)]
    struct NodeShape {
        parent: usize,
        author: usize,
        flagged: bool,
        deleted: bool,
    }

    fn node_shapes() -> impl Strategy<Value = Vec<NodeShape>> {
        prop::collection::vec(
            (any::<prop::sample::Index>(), 0usize..3, prop::bool::weighted(0.2), prop::bool::weighted(0.15)),
            0..24,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(idx, (parent, author, flagged, deleted))| NodeShape {
                    parent: parent.index(idx + 1),
                    author,
                    flagged,
                    deleted,
                })
                .collect()
        })
    }

    /// Rows for a generated tree. Row 0 is the root; node `i` becomes row `i + 1`.
    fn rows_from(shapes: &[NodeShape]) -> (Vec<FeedRow>, Vec<FeedRow>) {
        let authors = ["did:plc:alice", "did:plc:bob", "did:plc:carol"];
        let mut all = vec![mk_row("n0", authors[0], None, 0)];
        for (idx, shape) in shapes.iter().enumerate() {
            let parent = all[shape.parent].clone();
            let sort_secs = i64::try_from(idx + 1).unwrap_or(i64::MAX);
            let mut row = mk_row(&format!("n{}", idx + 1), authors[shape.author], Some(&parent), sort_secs);
            row.violates_thread_gate = shape.flagged;
            all.push(row);
        }
        let stored = all
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx == 0 || !shapes[idx - 1].deleted)
            .map(|(_, row)| row.clone())
            .collect();
        (all, stored)
    }

    fn walk<'v>(view: &'v ThreadView, out: &mut Vec<(&'v ThreadView, bool)>, in_replies: bool) {
        out.push((view, in_replies));
        if let Some(post) = view.as_post() {
            if let Some(parent) = &post.parent {
                walk(parent, out, false);
            }
            for reply in post.replies.iter().flatten() {
                walk(reply, out, true);
            }
        }
    }

    proptest! {
        #[test]
        fn composed_threads_respect_bounds_and_pruning(
            shapes in node_shapes(),
            anchor_pick in any::<prop::sample::Index>(),
            parent_height in 0u32..4,
            depth in 0u32..4,
        ) {
            let (all, stored) = rows_from(&shapes);
            let anchor = anchor_pick.get(&stored).clone();
            let bundle = mk_bundle(&stored);
            let actors = actors_for(&bundle);
            let composer = Composer { anchor_uri: &anchor.uri, bundle: &bundle, actors: &actors };
            let thread = skeleton(&stored, &anchor.uri, parent_height, depth);

            let view = composer.compose(&thread);
            prop_assert_eq!(&view, &composer.compose(&thread));

            let top = post(&view);
            prop_assert_eq!(&top.post.uri, &anchor.uri);
            if parent_height == 0 {
                prop_assert!(top.parent.is_none());
            }

            let mut nodes = Vec::new();
            walk(&view, &mut nodes, false);
            for (node, in_replies) in nodes {
                if depth == 0 {
                    prop_assert!(!node.as_post().is_some_and(|post| post.replies.is_some()));
                }
                if in_replies {
                    prop_assert!(!node.is_not_found());
                }
                if let Some(post) = node.as_post() {
                    let row = all.iter().find(|row| row.uri == post.post.uri);
                    let flagged = row.is_some_and(|row| row.violates_thread_gate);
                    if post.post.uri != anchor.uri {
                        prop_assert!(!flagged);
                    } else if flagged {
                        prop_assert!(post.parent.is_none() && post.replies.is_none());
                    }
                }
            }
        }
    }
}
