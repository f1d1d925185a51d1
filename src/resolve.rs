use crate::graft::{graft, Batch};
use crate::tree::{Anchor, CommentId, Forest, NodeId, ParentRef, Placeholder};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("anchor comment {anchor} not found in forest")]
    AnchorNotFound { anchor: CommentId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Replies were appended and the anchor's placeholder swapped.
    Merged { added: usize, skipped: usize },
    /// The anchor no longer holds the placeholder being expanded; nothing changed.
    Stale,
}

/// Builds the initial forest for a discussion from its first listing page.
pub fn populate(batch: Batch) -> (Forest, usize) {
    let mut forest = Forest::new();
    let fetched = graft(batch.replies);
    let (_, skipped) = transfer(&mut forest, fetched, None);
    if let Some(slot) = forest.locate_placeholder(&Anchor::Root) {
        slot.install(anchored(batch.placeholder, Anchor::Root));
    }
    (forest, skipped)
}

/// Merges replies fetched for `expanded` into `forest`.
///
/// Root expansions append to the top level; nested expansions append under the
/// anchor comment after its existing children. The placeholder is swapped for
/// `continuation` in the same step, so a second delivery of the same fetch
/// finds nothing to consume and returns [`Resolution::Stale`]. On error the
/// forest is untouched.
pub fn resolve(
    forest: &mut Forest,
    expanded: &Placeholder,
    fetched: Forest,
    continuation: Option<Placeholder>,
) -> Result<Resolution, TreeError> {
    let parent = match &expanded.anchor {
        Anchor::Root => None,
        Anchor::Node(anchor) => Some(forest.position(anchor).ok_or_else(|| {
            TreeError::AnchorNotFound {
                anchor: anchor.clone(),
            }
        })?),
    };

    let consumable = forest
        .locate_placeholder(&expanded.anchor)
        .and_then(|slot| slot.pending())
        .is_some_and(|current| current.id == expanded.id);
    if !consumable {
        tracing::debug!(placeholder = %expanded.id, anchor = %expanded.anchor, "placeholder already consumed");
        return Ok(Resolution::Stale);
    }

    let (added, skipped) = transfer(forest, fetched, parent);
    if let Some(slot) = forest.locate_placeholder(&expanded.anchor) {
        slot.install(anchored(continuation, expanded.anchor.clone()));
    }
    tracing::debug!(placeholder = %expanded.id, anchor = %expanded.anchor, added, skipped, "resolved placeholder");
    Ok(Resolution::Merged { added, skipped })
}

fn anchored(placeholder: Option<Placeholder>, anchor: Anchor) -> Option<Placeholder> {
    placeholder.map(|mut placeholder| {
        if placeholder.anchor != anchor {
            tracing::debug!(placeholder = %placeholder.id, from = %placeholder.anchor, to = %anchor, "re-anchoring continuation");
            placeholder.anchor = anchor;
        }
        placeholder
    })
}

/// Moves every node of `fetched` into `forest` below `parent`, rebasing depth
/// and parent references onto their new position.
///
/// The target's identifier index acts as the visited set: a fetched node that
/// is already present is not re-created, and its fetched children continue
/// under the existing node.
fn transfer(forest: &mut Forest, fetched: Forest, parent: Option<NodeId>) -> (usize, usize) {
    let (nodes, roots) = fetched.into_parts();
    let mut slots: Vec<_> = nodes.into_iter().map(Some).collect();
    let mut added = 0usize;
    let mut skipped = 0usize;

    let mut stack: Vec<(NodeId, Option<NodeId>)> =
        roots.into_iter().rev().map(|root| (root, parent)).collect();
    while let Some((source, target)) = stack.pop() {
        let Some(mut node) = slots.get_mut(source.index()).and_then(Option::take) else {
            continue;
        };

        if let Some(existing) = forest.position(&node.id) {
            skipped += 1;
            tracing::warn!(id = %node.id, "comment already in forest, skipping fetched copy");
            stack.extend(node.children.into_iter().rev().map(|child| (child, Some(existing))));
            continue;
        }

        let children = std::mem::take(&mut node.children);
        let (parent_ref, depth) = target
            .and_then(|target| forest.node(target))
            .map(|holder| (ParentRef::Comment(holder.id.clone()), holder.depth + 1))
            .unwrap_or((ParentRef::Post, 0));
        if node.parent != parent_ref && target == parent {
            tracing::debug!(id = %node.id, declared = ?node.parent, actual = ?parent_ref, "attaching reply under expanded anchor");
        }
        node.parent = parent_ref;
        node.depth = depth;

        let placed = forest.attach(node, target);
        added += 1;
        stack.extend(children.into_iter().rev().map(|child| (child, Some(placed))));
    }

    (added, skipped)
}
