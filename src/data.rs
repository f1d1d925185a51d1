use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;

use crate::graft::Batch;
use crate::reddit::{self, CommentOptions, CommentThing, MORE_CHILDREN_LIMIT};
use crate::tree::{Anchor, Placeholder, PlaceholderId};

/// Source of flat reply pages for one discussion.
///
/// Calls block; the session runs them on worker threads.
pub trait ListingService: Send + Sync {
    fn fetch_initial(&self, post_id: &str) -> Result<Batch>;
    fn fetch_more(&self, post_id: &str, placeholder: &Placeholder) -> Result<Batch>;
}

pub struct RedditListingService {
    client: Arc<reddit::Client>,
}

impl RedditListingService {
    pub fn new(client: Arc<reddit::Client>) -> Self {
        Self { client }
    }

    fn continue_thread(&self, post_id: &str, placeholder: &Placeholder) -> Result<Batch> {
        let Anchor::Node(anchor) = &placeholder.anchor else {
            bail!("reddit: continue-thread placeholder {} has no anchor comment", placeholder.id);
        };
        let opts = CommentOptions {
            comment: Some(anchor.to_string()),
        };
        let thread = self
            .client
            .comments(post_id, opts)
            .context("fetch continued thread")?;
        let replies = thread
            .comments
            .children
            .into_iter()
            .find_map(|thing| match thing {
                CommentThing::Comment(comment) if comment.id == anchor.as_str() => Some(comment),
                _ => None,
            })
            .ok_or_else(|| anyhow!("reddit: comment {anchor} missing from its own thread"))?
            .replies
            .map(|listing| listing.children)
            .unwrap_or_default();
        Ok(reddit::flatten(replies, &placeholder.anchor))
    }
}

impl ListingService for RedditListingService {
    fn fetch_initial(&self, post_id: &str) -> Result<Batch> {
        let thread = self
            .client
            .comments(post_id, CommentOptions::default())
            .context("fetch comments")?;
        Ok(reddit::flatten(thread.comments.children, &Anchor::Root))
    }

    fn fetch_more(&self, post_id: &str, placeholder: &Placeholder) -> Result<Batch> {
        if placeholder.is_continuation {
            return self.continue_thread(post_id, placeholder);
        }

        let (ids, leftover) = page_ids(placeholder);
        let things = self
            .client
            .more_children(&format!("t3_{post_id}"), ids)
            .context("fetch more comments")?;
        let mut batch = reddit::flatten(things, &placeholder.anchor);
        carry_leftover(&mut batch, leftover);
        Ok(batch)
    }
}

/// Splits off the ids one `morechildren` call may request. Ids past the limit
/// move to a successor placeholder on the same anchor.
fn page_ids(placeholder: &Placeholder) -> (&[String], Option<Placeholder>) {
    let split = placeholder.continuation.len().min(MORE_CHILDREN_LIMIT);
    let (ids, rest) = placeholder.continuation.split_at(split);
    if rest.is_empty() {
        return (ids, None);
    }
    let leftover = Placeholder {
        id: placeholder.id.successor(split),
        anchor: placeholder.anchor.clone(),
        count: placeholder.count.saturating_sub(split).max(rest.len()),
        is_continuation: false,
        continuation: rest.to_vec(),
    };
    (ids, Some(leftover))
}

/// Folds the unrequested ids into whatever placeholder the server returned.
fn carry_leftover(batch: &mut Batch, leftover: Option<Placeholder>) {
    let Some(leftover) = leftover else {
        return;
    };
    batch.placeholder = Some(match batch.placeholder.take() {
        Some(mut existing) => {
            existing.coalesce(leftover);
            existing
        }
        None => leftover,
    });
}

#[derive(Clone)]
enum Scripted {
    Page(Batch),
    Fail(String),
}

impl Scripted {
    fn play(&self) -> Result<Batch> {
        match self {
            Scripted::Page(batch) => Ok(batch.clone()),
            Scripted::Fail(message) => Err(anyhow!("{message}")),
        }
    }
}

/// Replays canned pages. Each key holds a queue; the last entry repeats.
#[derive(Default)]
pub struct MockListingService {
    initial: Mutex<Vec<Scripted>>,
    more: Mutex<HashMap<PlaceholderId, Vec<Scripted>>>,
    calls: Mutex<HashMap<PlaceholderId, usize>>,
}

impl MockListingService {
    pub fn new(initial: Batch) -> Self {
        let service = Self::default();
        service.initial.lock().push(Scripted::Page(initial));
        service
    }

    pub fn fail_initial(self, message: &str) -> Self {
        self.initial.lock().insert(0, Scripted::Fail(message.to_string()));
        self
    }

    pub fn with_more(self, placeholder: &str, batch: Batch) -> Self {
        self.push_more(placeholder, Scripted::Page(batch));
        self
    }

    pub fn fail_more(self, placeholder: &str, message: &str) -> Self {
        self.push_more(placeholder, Scripted::Fail(message.to_string()));
        self
    }

    pub fn more_calls(&self, placeholder: &str) -> usize {
        self.calls
            .lock()
            .get(&PlaceholderId::new(placeholder))
            .copied()
            .unwrap_or(0)
    }

    fn push_more(&self, placeholder: &str, entry: Scripted) {
        self.more
            .lock()
            .entry(PlaceholderId::new(placeholder))
            .or_default()
            .push(entry);
    }

    fn next(queue: &mut Vec<Scripted>) -> Option<Scripted> {
        match queue.len() {
            0 => None,
            1 => queue.first().cloned(),
            _ => Some(queue.remove(0)),
        }
    }
}

impl ListingService for MockListingService {
    fn fetch_initial(&self, _post_id: &str) -> Result<Batch> {
        let entry = Self::next(&mut self.initial.lock());
        match entry {
            Some(entry) => entry.play(),
            None => Ok(Batch::default()),
        }
    }

    fn fetch_more(&self, _post_id: &str, placeholder: &Placeholder) -> Result<Batch> {
        *self.calls.lock().entry(placeholder.id.clone()).or_default() += 1;
        let entry = self
            .more
            .lock()
            .get_mut(&placeholder.id)
            .and_then(Self::next);
        match entry {
            Some(entry) => entry.play(),
            None => bail!("mock: nothing scripted for placeholder {}", placeholder.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graft::ReplyRecord;
    use crate::tree::ParentRef;

    fn pending_ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{i}")).collect()
    }

    #[test]
    fn page_within_limit_has_no_leftover() {
        let placeholder =
            Placeholder::new("m", Anchor::Root, 40).with_continuation(pending_ids(40));
        let (ids, leftover) = page_ids(&placeholder);
        assert_eq!(ids.len(), 40);
        assert!(leftover.is_none());
    }

    #[test]
    fn page_past_limit_moves_rest_to_successor() {
        let placeholder = Placeholder::new("m", Anchor::Node("a".into()), 250)
            .with_continuation(pending_ids(250));
        let (ids, leftover) = page_ids(&placeholder);
        assert_eq!(ids.len(), MORE_CHILDREN_LIMIT);
        assert_eq!(ids[0], "c0");
        assert_eq!(ids[99], "c99");

        let leftover = leftover.unwrap();
        assert_eq!(leftover.id.as_str(), "m+100");
        assert_eq!(leftover.anchor, Anchor::Node("a".into()));
        assert_eq!(leftover.count, 150);
        assert_eq!(leftover.continuation.len(), 150);
        assert_eq!(leftover.continuation[0], "c100");
        assert!(!leftover.is_continuation);
    }

    #[test]
    fn leftover_count_never_undercounts_ids() {
        // Reddit's count can lag behind the ids it lists.
        let placeholder =
            Placeholder::new("m", Anchor::Root, 120).with_continuation(pending_ids(230));
        let (_, leftover) = page_ids(&placeholder);
        assert_eq!(leftover.unwrap().count, 130);
    }

    #[test]
    fn leftover_becomes_batch_placeholder() {
        let placeholder =
            Placeholder::new("m", Anchor::Root, 101).with_continuation(pending_ids(101));
        let (_, leftover) = page_ids(&placeholder);
        let mut batch = Batch::new(vec![ReplyRecord::new("c0", ParentRef::Post, 0)], None);
        carry_leftover(&mut batch, leftover);
        let more = batch.placeholder.unwrap();
        assert_eq!(more.id.as_str(), "m+100");
        assert_eq!(more.continuation, vec!["c100"]);
    }

    #[test]
    fn leftover_coalesces_with_server_placeholder() {
        let placeholder =
            Placeholder::new("m", Anchor::Root, 105).with_continuation(pending_ids(105));
        let (_, leftover) = page_ids(&placeholder);
        let server = Placeholder::new("t1_more", Anchor::Root, 3)
            .with_continuation(vec!["s1".into(), "s2".into()]);
        let mut batch = Batch::new(Vec::new(), Some(server));
        carry_leftover(&mut batch, leftover);

        let more = batch.placeholder.unwrap();
        assert_eq!(more.id.as_str(), "t1_more");
        assert_eq!(more.count, 8);
        assert_eq!(
            more.continuation,
            vec!["s1", "s2", "c100", "c101", "c102", "c103", "c104"]
        );
    }

    #[test]
    fn no_leftover_keeps_server_placeholder() {
        let server = Placeholder::new("t1_more", Anchor::Root, 3);
        let mut batch = Batch::new(Vec::new(), Some(server.clone()));
        carry_leftover(&mut batch, None);
        assert_eq!(batch.placeholder, Some(server));
    }

    #[test]
    fn mock_repeats_last_entry() {
        let service = MockListingService::new(Batch::default())
            .fail_more("m", "boom")
            .with_more(
                "m",
                Batch::new(vec![ReplyRecord::new("1", ParentRef::Post, 0)], None),
            );
        let placeholder = Placeholder::new("m", Anchor::Root, 1);
        assert!(service.fetch_more("post", &placeholder).is_err());
        assert_eq!(service.fetch_more("post", &placeholder).unwrap().replies.len(), 1);
        assert_eq!(service.fetch_more("post", &placeholder).unwrap().replies.len(), 1);
        assert_eq!(service.more_calls("m"), 3);
    }

    #[test]
    fn mock_initial_failure_then_success() {
        let service = MockListingService::new(Batch::new(
            vec![ReplyRecord::new("1", ParentRef::Post, 0)],
            None,
        ))
        .fail_initial("offline");
        let err = service.fetch_initial("post").unwrap_err();
        assert_eq!(err.to_string(), "offline");
        assert_eq!(service.fetch_initial("post").unwrap().replies.len(), 1);
    }

    #[test]
    fn unscripted_placeholder_fails() {
        let service = MockListingService::default();
        let placeholder = Placeholder::new("nope", Anchor::Root, 1);
        assert!(service.fetch_more("post", &placeholder).is_err());
    }
}
