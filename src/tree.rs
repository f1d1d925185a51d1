//! Arena-backed comment forest.
//!
//! Nodes live in a flat `Vec` and refer to each other through [`NodeId`]
//! indices. An identifier index is kept next to the arena so lookups by
//! [`CommentId`] never walk the tree; every mutation goes through the
//! crate-private helpers below, which keep that index in sync.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(String);

impl CommentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CommentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Logical parent of a reply: the discussion's post, or another reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParentRef {
    Post,
    Comment(CommentId),
}

impl ParentRef {
    pub fn comment_id(&self) -> Option<&CommentId> {
        match self {
            ParentRef::Post => None,
            ParentRef::Comment(id) => Some(id),
        }
    }
}

/// Display payload. The tree never looks inside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub created_utc: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceholderId(String);

impl PlaceholderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier for the remainder left over after `taken` entries of this
    /// placeholder were fetched.
    pub fn successor(&self, taken: usize) -> Self {
        Self(format!("{}+{}", self.0, taken))
    }
}

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a placeholder's replies attach once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    Root,
    Node(CommentId),
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anchor::Root => f.write_str("root"),
            Anchor::Node(id) => write!(f, "{id}"),
        }
    }
}

/// Replies that exist upstream but have not been fetched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    pub id: PlaceholderId,
    pub anchor: Anchor,
    /// Advertised number of hidden replies; upstream only approximates it.
    pub count: usize,
    /// "Continue this thread" rather than "N more replies".
    pub is_continuation: bool,
    /// Opaque pagination state owned by the transport.
    #[serde(default)]
    pub continuation: Vec<String>,
}

impl Placeholder {
    pub fn new(id: impl Into<String>, anchor: Anchor, count: usize) -> Self {
        Self {
            id: PlaceholderId::new(id),
            anchor,
            count,
            is_continuation: false,
            continuation: Vec::new(),
        }
    }

    pub fn continue_thread(id: impl Into<String>, anchor: Anchor) -> Self {
        Self {
            is_continuation: true,
            ..Self::new(id, anchor, 0)
        }
    }

    pub fn with_continuation(mut self, continuation: Vec<String>) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn label(&self) -> String {
        if self.is_continuation {
            return "continue this thread".to_string();
        }
        match self.count {
            0 => "load more replies".to_string(),
            1 => "1 more reply".to_string(),
            n => format!("{n} more replies"),
        }
    }

    /// Folds a second placeholder for the same anchor into this one.
    pub fn coalesce(&mut self, other: Placeholder) {
        self.count += other.count;
        self.is_continuation |= other.is_continuation;
        self.continuation.extend(other.continuation);
    }
}

/// Placeholder state of a node or of the forest root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PlaceholderSlot {
    #[default]
    Vacant,
    Pending(Placeholder),
}

impl PlaceholderSlot {
    pub fn pending(&self) -> Option<&Placeholder> {
        match self {
            PlaceholderSlot::Vacant => None,
            PlaceholderSlot::Pending(placeholder) => Some(placeholder),
        }
    }

    pub(crate) fn install(&mut self, placeholder: Option<Placeholder>) {
        *self = match placeholder {
            Some(placeholder) => PlaceholderSlot::Pending(placeholder),
            None => PlaceholderSlot::Vacant,
        };
    }
}

impl From<Option<Placeholder>> for PlaceholderSlot {
    fn from(value: Option<Placeholder>) -> Self {
        let mut slot = PlaceholderSlot::Vacant;
        slot.install(value);
        slot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub id: CommentId,
    pub parent: ParentRef,
    pub depth: usize,
    pub payload: Payload,
    pub children: Vec<NodeId>,
    pub placeholder: PlaceholderSlot,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("comment {0} appears more than once")]
    DuplicateId(CommentId),
    #[error("comment {id} has depth {found}, expected {expected}")]
    DepthMismatch {
        id: CommentId,
        expected: usize,
        found: usize,
    },
    #[error("comment {id} records parent {recorded:?} but sits under {actual:?}")]
    ParentMismatch {
        id: CommentId,
        recorded: ParentRef,
        actual: ParentRef,
    },
    #[error("identifier index is out of sync for comment {0}")]
    IndexOutOfSync(CommentId),
    #[error("placeholder {placeholder} is anchored at {anchor}, not {holder}")]
    MisanchoredPlaceholder {
        placeholder: PlaceholderId,
        anchor: Anchor,
        holder: Anchor,
    },
    #[error("{0} nodes are not reachable from the roots")]
    Unreachable(usize),
}

/// Ordered top-level replies plus at most one root placeholder.
#[derive(Debug, Clone, Default)]
pub struct Forest {
    nodes: Vec<CommentNode>,
    roots: Vec<NodeId>,
    placeholder: PlaceholderSlot,
    index: HashMap<CommentId, NodeId>,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> Option<&CommentNode> {
        self.nodes.get(id.0)
    }

    pub fn get(&self, id: &CommentId) -> Option<&CommentNode> {
        self.position(id).and_then(|pos| self.node(pos))
    }

    pub fn contains(&self, id: &CommentId) -> bool {
        self.index.contains_key(id)
    }

    pub fn root_placeholder(&self) -> Option<&Placeholder> {
        self.placeholder.pending()
    }

    pub fn root_nodes(&self) -> impl Iterator<Item = &CommentNode> + '_ {
        self.roots.iter().map(move |id| &self.nodes[id.0])
    }

    pub fn children<'a>(&'a self, node: &'a CommentNode) -> impl Iterator<Item = &'a CommentNode> + 'a {
        node.children.iter().map(move |id| &self.nodes[id.0])
    }

    pub fn root_ids(&self) -> Vec<CommentId> {
        self.root_nodes().map(|node| node.id.clone()).collect()
    }

    pub fn child_ids(&self, id: &CommentId) -> Vec<CommentId> {
        self.get(id)
            .map(|node| self.children(node).map(|child| child.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Depth-first, parents before children, siblings in display order.
    pub fn preorder(&self) -> Preorder<'_> {
        Preorder {
            forest: self,
            stack: self.roots.iter().rev().copied().collect(),
        }
    }

    pub fn ids(&self) -> Vec<CommentId> {
        self.preorder().map(|node| node.id.clone()).collect()
    }

    /// Every unresolved placeholder, root placeholder first, then in pre-order.
    pub fn placeholders(&self) -> Vec<&Placeholder> {
        self.placeholder
            .pending()
            .into_iter()
            .chain(self.preorder().filter_map(|node| node.placeholder.pending()))
            .collect()
    }

    /// Walks the arena in pre-order and returns the first node carrying `id`.
    ///
    /// Lookups normally go through the identifier index; this scan is the
    /// reference the index is validated against.
    pub fn find_preorder(&self, id: &CommentId) -> Option<NodeId> {
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            let node = &self.nodes[current.0];
            if &node.id == id {
                return Some(current);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        None
    }

    pub fn snapshot(&self) -> ForestSnapshot {
        ForestSnapshot {
            roots: self.roots.iter().map(|id| self.snapshot_node(*id)).collect(),
            placeholder: self.placeholder.pending().cloned(),
        }
    }

    fn snapshot_node(&self, id: NodeId) -> SnapshotNode {
        let node = &self.nodes[id.0];
        SnapshotNode {
            id: node.id.clone(),
            depth: node.depth,
            payload: node.payload.clone(),
            placeholder: node.placeholder.pending().cloned(),
            children: node
                .children
                .iter()
                .map(|child| self.snapshot_node(*child))
                .collect(),
        }
    }

    /// Checks identity, depth, parent and placeholder-anchor invariants.
    ///
    /// Top-level nodes attached to the post must sit at depth 0; top-level
    /// nodes of a freshly grafted sub-forest may still point at a comment
    /// outside the forest and keep whatever depth they were given.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if let Some(placeholder) = self.placeholder.pending() {
            if placeholder.anchor != Anchor::Root {
                return Err(InvariantViolation::MisanchoredPlaceholder {
                    placeholder: placeholder.id.clone(),
                    anchor: placeholder.anchor.clone(),
                    holder: Anchor::Root,
                });
            }
        }

        let mut seen: HashSet<&CommentId> = HashSet::new();
        let mut stack: Vec<(NodeId, Option<NodeId>)> =
            self.roots.iter().rev().map(|id| (*id, None)).collect();
        while let Some((current, parent)) = stack.pop() {
            let node = &self.nodes[current.0];
            if !seen.insert(&node.id) {
                return Err(InvariantViolation::DuplicateId(node.id.clone()));
            }
            if self.index.get(&node.id) != Some(&current) {
                return Err(InvariantViolation::IndexOutOfSync(node.id.clone()));
            }
            match parent {
                Some(parent) => {
                    let parent_node = &self.nodes[parent.0];
                    let actual = ParentRef::Comment(parent_node.id.clone());
                    if node.parent != actual {
                        return Err(InvariantViolation::ParentMismatch {
                            id: node.id.clone(),
                            recorded: node.parent.clone(),
                            actual,
                        });
                    }
                    if node.depth != parent_node.depth + 1 {
                        return Err(InvariantViolation::DepthMismatch {
                            id: node.id.clone(),
                            expected: parent_node.depth + 1,
                            found: node.depth,
                        });
                    }
                }
                None => {
                    if node.parent == ParentRef::Post && node.depth != 0 {
                        return Err(InvariantViolation::DepthMismatch {
                            id: node.id.clone(),
                            expected: 0,
                            found: node.depth,
                        });
                    }
                }
            }
            if let Some(placeholder) = node.placeholder.pending() {
                let holder = Anchor::Node(node.id.clone());
                if placeholder.anchor != holder {
                    return Err(InvariantViolation::MisanchoredPlaceholder {
                        placeholder: placeholder.id.clone(),
                        anchor: placeholder.anchor.clone(),
                        holder,
                    });
                }
            }
            stack.extend(node.children.iter().rev().map(|child| (*child, Some(current))));
        }

        if seen.len() != self.nodes.len() {
            return Err(InvariantViolation::Unreachable(self.nodes.len() - seen.len()));
        }
        if self.index.len() != self.nodes.len() {
            let stray = self
                .index
                .keys()
                .find(|id| !seen.contains(id))
                .cloned()
                .unwrap_or_else(|| CommentId::new(""));
            return Err(InvariantViolation::IndexOutOfSync(stray));
        }
        Ok(())
    }

    pub(crate) fn position(&self, id: &CommentId) -> Option<NodeId> {
        self.index.get(id).copied()
    }

    pub(crate) fn locate(&mut self, id: &CommentId) -> Option<&mut CommentNode> {
        let pos = self.position(id)?;
        self.nodes.get_mut(pos.0)
    }

    pub(crate) fn locate_placeholder(&mut self, anchor: &Anchor) -> Option<&mut PlaceholderSlot> {
        match anchor {
            Anchor::Root => Some(&mut self.placeholder),
            Anchor::Node(id) => self.locate(id).map(|node| &mut node.placeholder),
        }
    }

    #[cfg(test)]
    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut CommentNode {
        &mut self.nodes[id.0]
    }

    /// Appends `node` under `parent` (or at the top level) and indexes it.
    ///
    /// Callers must have checked that the identifier is not present yet.
    pub(crate) fn attach(&mut self, node: CommentNode, parent: Option<NodeId>) -> NodeId {
        debug_assert!(!self.contains(&node.id), "duplicate comment {}", node.id);
        let pos = NodeId(self.nodes.len());
        self.index.insert(node.id.clone(), pos);
        self.nodes.push(node);
        match parent {
            Some(parent) => self.nodes[parent.0].children.push(pos),
            None => self.roots.push(pos),
        }
        pos
    }

    /// Hands the arena over for transfer into another forest.
    pub(crate) fn into_parts(self) -> (Vec<CommentNode>, Vec<NodeId>) {
        (self.nodes, self.roots)
    }
}

pub struct Preorder<'a> {
    forest: &'a Forest,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Preorder<'a> {
    type Item = &'a CommentNode;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.stack.pop()?;
        let node = &self.forest.nodes[current.0];
        self.stack.extend(node.children.iter().rev().copied());
        Some(node)
    }
}

/// Owned, nested copy of a forest handed to readers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForestSnapshot {
    pub roots: Vec<SnapshotNode>,
    pub placeholder: Option<Placeholder>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotNode {
    pub id: CommentId,
    pub depth: usize,
    pub payload: Payload,
    pub placeholder: Option<Placeholder>,
    pub children: Vec<SnapshotNode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, parent: ParentRef, depth: usize) -> CommentNode {
        CommentNode {
            id: CommentId::new(id),
            parent,
            depth,
            payload: Payload::default(),
            children: Vec::new(),
            placeholder: PlaceholderSlot::Vacant,
        }
    }

    fn sample() -> Forest {
        let mut forest = Forest::new();
        let a = forest.attach(node("a", ParentRef::Post, 0), None);
        let b = forest.attach(node("b", ParentRef::Comment("a".into()), 1), Some(a));
        forest.attach(node("c", ParentRef::Comment("b".into()), 2), Some(b));
        forest.attach(node("d", ParentRef::Comment("a".into()), 1), Some(a));
        forest.attach(node("e", ParentRef::Post, 0), None);
        forest
    }

    #[test]
    fn preorder_visits_parents_before_children() {
        let forest = sample();
        let ids: Vec<String> = forest.ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(forest.root_ids(), vec![CommentId::new("a"), CommentId::new("e")]);
        assert_eq!(
            forest.child_ids(&"a".into()),
            vec![CommentId::new("b"), CommentId::new("d")]
        );
    }

    #[test]
    fn index_agrees_with_preorder_scan() {
        let forest = sample();
        for id in forest.ids() {
            assert_eq!(forest.position(&id), forest.find_preorder(&id));
        }
        assert!(forest.find_preorder(&"missing".into()).is_none());
        assert!(forest.validate().is_ok());
    }

    #[test]
    fn locate_placeholder_reaches_nested_node() {
        let mut forest = sample();
        let anchor = Anchor::Node("c".into());
        let slot = forest.locate_placeholder(&anchor).unwrap();
        slot.install(Some(Placeholder::new("more_c", anchor.clone(), 3)));
        assert_eq!(forest.get(&"c".into()).unwrap().placeholder.pending().unwrap().count, 3);
        assert_eq!(forest.placeholders().len(), 1);
        assert!(forest.locate_placeholder(&Anchor::Node("zz".into())).is_none());
        assert!(forest.validate().is_ok());
    }

    #[test]
    fn validate_flags_depth_drift() {
        let mut forest = sample();
        let pos = forest.position(&"c".into()).unwrap();
        forest.node_mut(pos).depth = 5;
        assert_eq!(
            forest.validate(),
            Err(InvariantViolation::DepthMismatch {
                id: "c".into(),
                expected: 2,
                found: 5,
            })
        );
    }

    #[test]
    fn validate_flags_misanchored_placeholder() {
        let mut forest = sample();
        forest
            .locate(&"d".into())
            .unwrap()
            .placeholder
            .install(Some(Placeholder::new("more_b", Anchor::Node("b".into()), 1)));
        assert!(matches!(
            forest.validate(),
            Err(InvariantViolation::MisanchoredPlaceholder { .. })
        ));
    }

    #[test]
    fn placeholder_labels() {
        let anchor = Anchor::Root;
        assert_eq!(Placeholder::new("m", anchor.clone(), 1).label(), "1 more reply");
        assert_eq!(Placeholder::new("m", anchor.clone(), 7).label(), "7 more replies");
        assert_eq!(
            Placeholder::continue_thread("m", anchor).label(),
            "continue this thread"
        );
    }

    #[test]
    fn coalesce_merges_counts_and_continuation() {
        let mut first =
            Placeholder::new("m1", Anchor::Root, 2).with_continuation(vec!["x".into(), "y".into()]);
        first.coalesce(Placeholder::new("m2", Anchor::Root, 1).with_continuation(vec!["z".into()]));
        assert_eq!(first.count, 3);
        assert_eq!(first.continuation, vec!["x", "y", "z"]);
        assert_eq!(first.id.as_str(), "m1");
    }

    #[test]
    fn snapshot_is_nested() {
        let snapshot = sample().snapshot();
        assert_eq!(snapshot.roots.len(), 2);
        assert_eq!(snapshot.roots[0].children.len(), 2);
        assert_eq!(snapshot.roots[0].children[0].children[0].id.as_str(), "c");
        assert_eq!(snapshot.roots[0].children[0].children[0].depth, 2);
    }
}
