use std::collections::BTreeSet;

use crate::skeleton::{ParentNode, PostThread};

/// Author DIDs and post URIs a thread needs hydrated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelevantIds {
    pub dids: BTreeSet<String>,
    pub uris: BTreeSet<String>,
}

impl RelevantIds {
    /// Walk the whole skeleton once. Every node's reply root is included so
    /// the root's gate is hydrated even when it sits outside the fetched
    /// bounds.
    #[must_use]
    pub fn collect(thread: &PostThread) -> Self {
        let mut ids = Self::default();
        let mut pending = vec![thread];
        while let Some(node) = pending.pop() {
            if let Some(ParentNode::Resolved(parent)) = &node.parent {
                pending.push(parent);
            }
            pending.extend(node.replies.iter().flatten());
            ids.dids.insert(node.post.author_did.clone());
            ids.uris.insert(node.post.uri.clone());
            if let Some(root) = &node.post.reply_root {
                ids.uris.insert(root.clone());
            }
        }
        ids
    }

    pub fn extend(&mut self, other: Self) {
        self.dids.extend(other.dids);
        self.uris.extend(other.uris);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::build_thread;
    use crate::test_support::{fetch_ancestors, fetch_descendants, mk_row};

    // Test IDs: TREL-001
    #[test]
    fn collects_unique_authors_and_forces_root_uri() {
        let root = mk_row("root", "did:plc:alice", None, 1);
        let a = mk_row("a", "did:plc:bob", Some(&root), 2);
        let b = mk_row("b", "did:plc:alice", Some(&a), 3);
        let c = mk_row("c", "did:plc:bob", Some(&a), 4);
        let rows = vec![root.clone(), a.clone(), b.clone(), c.clone()];

        // height 0 keeps the root out of the tree; its URI must still be collected.
        let thread = build_thread(
            &a.uri,
            &fetch_ancestors(&rows, &a.uri, 0),
            &fetch_descendants(&rows, &a.uri, 1),
            0,
            1,
        )
        .unwrap_or_else(|| panic!("anchor should exist"));
        let ids = RelevantIds::collect(&thread);

        assert_eq!(
            ids.dids,
            BTreeSet::from(["did:plc:alice".to_string(), "did:plc:bob".to_string()])
        );
        assert_eq!(
            ids.uris,
            BTreeSet::from([root.uri.clone(), a.uri.clone(), b.uri.clone(), c.uri.clone()])
        );
    }

    // Test IDs: TREL-002
    #[test]
    fn sentinel_parent_contributes_nothing() {
        let root = mk_row("root", "did:plc:alice", None, 1);
        let a = mk_row("a", "did:plc:bob", Some(&root), 2);
        let thread = build_thread(&a.uri, &[a.clone()], &[], 5, 0)
            .unwrap_or_else(|| panic!("anchor should exist"));
        let ids = RelevantIds::collect(&thread);
        assert_eq!(ids.dids, BTreeSet::from(["did:plc:bob".to_string()]));
        // root URI comes from the anchor's reply_root, not from the sentinel.
        assert_eq!(ids.uris, BTreeSet::from([root.uri.clone(), a.uri.clone()]));
    }
}
