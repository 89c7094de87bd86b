use std::collections::HashMap;

use crate::FeedRow;

/// One node of the assembled thread skeleton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostThread {
    pub post: FeedRow,
    pub parent: Option<ParentNode>,
    /// `None` when the depth budget is spent or nothing was indexed below.
    pub replies: Option<Vec<PostThread>>,
}

/// Upward link of a node: a resolved ancestor, or the URI of an ancestor the
/// store no longer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentNode {
    Resolved(Box<PostThread>),
    NotFound { uri: String },
}

impl PostThread {
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.post.uri
    }

    /// Nodes reachable from here, parents and replies included. Sentinels
    /// are not counted.
    #[must_use]
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            count += 1;
            if let Some(ParentNode::Resolved(parent)) = &node.parent {
                pending.push(parent);
            }
            pending.extend(node.replies.iter().flatten());
        }
        count
    }
}

/// Assemble the thread around `uri` from the two bounded fetches.
///
/// `ancestors` holds the anchor itself plus its reply-parent chain;
/// `descendants` holds replies below the anchor, newest first. Returns `None`
/// when the anchor is not among the ancestor rows.
#[must_use]
pub fn build_thread(
    uri: &str,
    ancestors: &[FeedRow],
    descendants: &[FeedRow],
    parent_height: u32,
    depth: u32,
) -> Option<PostThread> {
    let by_uri = ancestors.iter().map(|row| (row.uri.as_str(), row)).collect::<HashMap<_, _>>();
    let mut by_parent: HashMap<&str, Vec<&FeedRow>> = HashMap::new();
    for row in descendants {
        if let Some(parent) = row.reply_parent.as_deref() {
            by_parent.entry(parent).or_default().push(row);
        }
    }

    let post = *by_uri.get(uri)?;
    Some(PostThread {
        post: post.clone(),
        parent: post
            .reply_parent
            .as_deref()
            .and_then(|parent| parent_node(&by_uri, parent, parent_height)),
        replies: child_nodes(&by_parent, uri, depth),
    })
}

/// Walk up from `uri` for at most `height` hops. The first hop the store
/// could not supply becomes the sentinel that caps the chain.
fn parent_node<'a>(
    by_uri: &HashMap<&'a str, &'a FeedRow>,
    uri: &'a str,
    height: u32,
) -> Option<ParentNode> {
    let height = usize::try_from(height).unwrap_or(usize::MAX);
    let mut chain: Vec<&FeedRow> = Vec::new();
    let mut top = None;
    let mut next = Some(uri);
    while let Some(current) = next.take() {
        if chain.len() >= height {
            break;
        }
        if let Some(row) = by_uri.get(current).copied() {
            chain.push(row);
            next = row.reply_parent.as_deref();
        } else {
            top = Some(ParentNode::NotFound { uri: current.to_string() });
        }
    }
    chain.into_iter().rev().fold(top, |parent, row| {
        Some(ParentNode::Resolved(Box::new(PostThread { post: row.clone(), parent, replies: None })))
    })
}

fn indexed_children<'m, 'a>(
    by_parent: &'m HashMap<&'a str, Vec<&'a FeedRow>>,
    uri: &str,
    depth: u32,
) -> Option<&'m [&'a FeedRow]> {
    if depth == 0 {
        return None;
    }
    by_parent.get(uri).map(Vec::as_slice).filter(|children| !children.is_empty())
}

/// Reply subtrees below `uri`. Nodes are laid out breadth-first so every
/// child sits after its parent, then assembled from the back.
fn child_nodes(
    by_parent: &HashMap<&str, Vec<&FeedRow>>,
    uri: &str,
    depth: u32,
) -> Option<Vec<PostThread>> {
    let top = indexed_children(by_parent, uri, depth)?;
    let mut order: Vec<(&FeedRow, u32)> = top.iter().map(|row| (*row, depth - 1)).collect();
    let mut children: Vec<Option<Vec<usize>>> = Vec::with_capacity(order.len());
    let mut next = 0;
    while next < order.len() {
        let (row, left) = order[next];
        children.push(indexed_children(by_parent, &row.uri, left).map(|below| {
            let first = order.len();
            order.extend(below.iter().map(|child| (*child, left - 1)));
            (first..order.len()).collect()
        }));
        next += 1;
    }

    let mut built: Vec<Option<PostThread>> = Vec::with_capacity(order.len());
    built.resize_with(order.len(), || None);
    for idx in (0..order.len()).rev() {
        let replies = children[idx]
            .as_ref()
            .map(|ids| ids.iter().filter_map(|id| built[*id].take()).collect());
        built[idx] = Some(PostThread { post: order[idx].0.clone(), parent: None, replies });
    }
    Some(built.into_iter().take(top.len()).flatten().collect())
}
