use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tree::{
    Anchor, CommentId, CommentNode, Forest, NodeId, ParentRef, Payload, Placeholder,
    PlaceholderSlot,
};

/// One reply as delivered by a listing, before it is placed in a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRecord {
    pub id: CommentId,
    pub parent: ParentRef,
    pub depth: usize,
    #[serde(default)]
    pub payload: Payload,
    /// Unfetched replies hanging off this record.
    #[serde(default)]
    pub more: Option<Placeholder>,
}

impl ReplyRecord {
    pub fn new(id: impl Into<CommentId>, parent: ParentRef, depth: usize) -> Self {
        Self {
            id: id.into(),
            parent,
            depth,
            payload: Payload::default(),
            more: None,
        }
    }

    pub fn reply_to(id: impl Into<CommentId>, parent: impl Into<CommentId>, depth: usize) -> Self {
        Self::new(id, ParentRef::Comment(parent.into()), depth)
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_more(mut self, more: Placeholder) -> Self {
        self.more = Some(more);
        self
    }
}

/// A flat page of replies plus the placeholder for whatever the page left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub replies: Vec<ReplyRecord>,
    #[serde(default)]
    pub placeholder: Option<Placeholder>,
}

impl Batch {
    pub fn new(replies: Vec<ReplyRecord>, placeholder: Option<Placeholder>) -> Self {
        Self {
            replies,
            placeholder,
        }
    }
}

/// Builds a forest from server-ordered records in a single forward pass.
///
/// A record whose parent appeared earlier in `records` becomes that parent's
/// last child; every other record becomes a local root, and the caller decides
/// where local roots attach. The first record wins when an identifier repeats.
pub fn graft(records: Vec<ReplyRecord>) -> Forest {
    let mut forest = Forest::new();
    let mut seen: HashMap<CommentId, NodeId> = HashMap::with_capacity(records.len());
    let mut duplicates = 0usize;

    for record in records {
        if seen.contains_key(&record.id) {
            duplicates += 1;
            tracing::warn!(id = %record.id, "duplicate comment in listing, keeping first");
            continue;
        }

        let parent = record
            .parent
            .comment_id()
            .and_then(|parent_id| seen.get(parent_id).copied());
        let depth = match parent {
            Some(parent) => forest.node(parent).map(|p| p.depth + 1).unwrap_or(0),
            None if record.parent == ParentRef::Post => 0,
            None => record.depth,
        };
        if depth != record.depth {
            tracing::debug!(
                id = %record.id,
                reported = record.depth,
                depth,
                "listing depth disagrees with tree position"
            );
        }

        let placeholder = record.more.map(|mut more| {
            let holder = Anchor::Node(record.id.clone());
            if more.anchor != holder {
                tracing::debug!(placeholder = %more.id, anchor = %more.anchor, holder = %holder, "re-anchoring nested placeholder");
                more.anchor = holder;
            }
            more
        });

        let node = CommentNode {
            id: record.id.clone(),
            parent: record.parent,
            depth,
            payload: record.payload,
            children: Vec::new(),
            placeholder: PlaceholderSlot::from(placeholder),
        };
        let pos = forest.attach(node, parent);
        seen.insert(record.id, pos);
    }

    tracing::trace!(nodes = forest.len(), roots = forest.roots().len(), duplicates, "grafted listing");
    forest
}

#[cfg(test)]
pub(crate) mod shapes {
    use proptest::prelude::*;
    use proptest::sample::Index;

    use super::ReplyRecord;
    use crate::tree::ParentRef;

    /// Flat listings in which every reply's parent is listed before it.
    /// Top-level entries reply to `parent` at `base_depth`.
    pub(crate) fn listing(
        prefix: &'static str,
        parent: ParentRef,
        base_depth: usize,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<ReplyRecord>> {
        prop::collection::vec((any::<bool>(), any::<Index>()), 1..max_len).prop_map(
            move |shape| {
                let mut records: Vec<ReplyRecord> = Vec::with_capacity(shape.len());
                for (i, (top_level, pick)) in shape.into_iter().enumerate() {
                    let id = format!("{prefix}{i}");
                    let record = if i == 0 || top_level {
                        ReplyRecord::new(id, parent.clone(), base_depth)
                    } else {
                        let up = &records[pick.index(i)];
                        ReplyRecord::reply_to(id, up.id.clone(), up.depth + 1)
                    };
                    records.push(record);
                }
                records
            },
        )
    }
}
