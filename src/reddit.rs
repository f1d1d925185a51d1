use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::RwLock;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::graft::{Batch, ReplyRecord};
use crate::tree::{Anchor, CommentId, ParentRef, Payload, Placeholder};

pub const PUBLIC_BASE_URL: &str = "https://www.reddit.com/";
pub const OAUTH_BASE_URL: &str = "https://oauth.reddit.com/";

/// Upper bound on ids per `morechildren` request.
pub const MORE_CHILDREN_LIMIT: usize = 100;

const CONTINUE_THREAD_ID: &str = "_";

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<OAuthToken>;
}

#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Option<SystemTime>,
}

/// Token taken verbatim from configuration.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<OAuthToken> {
        if self.0.trim().is_empty() {
            bail!("reddit: access token is empty");
        }
        Ok(OAuthToken {
            access_token: self.0.clone(),
            token_type: "bearer".into(),
            expires_at: None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Default)]
pub struct CommentOptions {
    /// Focus the listing on this comment's sub-thread.
    pub comment: Option<String>,
}

pub struct Client {
    token_provider: Option<Arc<dyn TokenProvider>>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    rate: RwLock<RateLimit>,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimit {
    pub used: f64,
    pub remaining: f64,
    pub reset_at: Option<SystemTime>,
}

impl RateLimit {
    /// Requests left in the current window, or `None` when no window is known
    /// (no headers seen yet, or the last window has already reset).
    pub fn budget(&self, now: SystemTime) -> Option<usize> {
        let reset_at = self.reset_at?;
        if now >= reset_at {
            return None;
        }
        Some(self.remaining.max(0.0).floor() as usize)
    }
}

impl Client {
    pub fn new(token_provider: Option<Arc<dyn TokenProvider>>, config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("reddit client user agent required");
        }
        let base = config.base_url.unwrap_or_else(|| {
            if token_provider.is_some() {
                OAUTH_BASE_URL.to_string()
            } else {
                PUBLIC_BASE_URL.to_string()
            }
        });
        let base_url = Url::parse(&base).with_context(|| format!("reddit: parse base url {base}"))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            token_provider,
            http,
            user_agent: config.user_agent,
            base_url,
            rate: RwLock::new(RateLimit::default()),
        })
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate.read().clone()
    }

    pub fn comments(&self, article: &str, opts: CommentOptions) -> Result<PostComments> {
        let path = match opts.comment.as_deref() {
            Some(comment) => format!("comments/{article}/_/{comment}.json"),
            None => format!("comments/{article}.json"),
        };
        let params = [("raw_json".to_string(), "1".to_string())];
        let payload: Vec<Value> = self.get(&path, &params)?.json()?;
        parse_comments_payload(payload)
    }

    pub fn more_children(&self, link_id: &str, children: &[String]) -> Result<Vec<CommentThing>> {
        if children.is_empty() {
            return Ok(Vec::new());
        }
        if children.len() > MORE_CHILDREN_LIMIT {
            bail!(
                "reddit: morechildren accepts at most {MORE_CHILDREN_LIMIT} ids, got {}",
                children.len()
            );
        }
        let params = vec![
            ("api_type".to_string(), "json".to_string()),
            ("link_id".to_string(), link_id.to_string()),
            ("children".to_string(), children.join(",")),
            ("limit_children".to_string(), "false".to_string()),
            ("raw_json".to_string(), "1".to_string()),
        ];
        let payload: MoreChildrenResponse = self.get("api/morechildren.json", &params)?.json()?;
        if let Some(err) = payload.json.errors.first() {
            let joined = err
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            bail!("reddit: morechildren error: {}", joined);
        }
        Ok(payload.json.data.things)
    }

    fn get(&self, path: &str, params: &[(String, String)]) -> Result<Response> {
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        let mut req = self.http.get(url).header(USER_AGENT, self.user_agent.clone());
        if let Some(provider) = &self.token_provider {
            let token = provider.token()?;
            req = req.header(AUTHORIZATION, format!("Bearer {}", token.access_token));
        }

        tracing::debug!(path, "reddit request");
        let resp = req.send()?;
        self.capture_rate(resp.headers());
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            match status.as_u16() {
                401 => Err(anyhow!("reddit: unauthorized")),
                403 => Err(anyhow!("reddit: forbidden")),
                404 => Err(anyhow!("reddit: thread not found")),
                429 => Err(anyhow!("reddit: rate limited: {}", body)),
                _ => Err(anyhow!("reddit: api error {}: {}", status, body)),
            }
        }
    }

    fn capture_rate(&self, headers: &HeaderMap) {
        let remaining = header_float(headers, "x-ratelimit-remaining");
        let used = header_float(headers, "x-ratelimit-used");
        let reset = header_float(headers, "x-ratelimit-reset");
        if remaining == 0.0 && used == 0.0 && reset == 0.0 {
            return;
        }
        let reset_at = SystemTime::now().checked_add(Duration::from_secs_f64(reset.max(0.0)));
        let mut rate = self.rate.write();
        rate.remaining = remaining;
        rate.used = used;
        rate.reset_at = reset_at;
    }
}

fn header_float(headers: &HeaderMap, key: &str) -> f64 {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn parse_comments_payload(payload: Vec<Value>) -> Result<PostComments> {
    let mut parts = payload.into_iter();
    let (Some(post_part), Some(comment_part)) = (parts.next(), parts.next()) else {
        bail!("reddit: comments payload missing elements");
    };
    let post_listing: ListingEnvelope<Thing<Post>> =
        decode(post_part).context("reddit: decode post listing")?;
    let comments_listing: ListingEnvelope<CommentThing> =
        decode(comment_part).context("reddit: decode comment listing")?;
    let post = post_listing
        .data
        .children
        .into_iter()
        .next()
        .map(|thing| thing.data)
        .ok_or_else(|| anyhow!("reddit: post listing empty"))?;
    Ok(PostComments {
        post,
        comments: comments_listing.data,
    })
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Accepts a bare id, a `t3_` fullname, or a thread URL.
pub fn parse_post_id(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("reddit: post id required");
    }
    if let Ok(url) = Url::parse(trimmed) {
        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        if let Some(pos) = segments.iter().position(|s| *s == "comments") {
            if let Some(id) = segments.get(pos + 1) {
                return Ok((*id).to_string());
            }
        }
        if url.host_str() == Some("redd.it") {
            if let Some(id) = segments.first() {
                return Ok((*id).to_string());
            }
        }
        bail!("reddit: no thread id in {trimmed}");
    }
    let id = trimmed.strip_prefix("t3_").unwrap_or(trimmed);
    if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("reddit: invalid post id {trimmed}");
    }
    Ok(id.to_string())
}

fn parse_parent(fullname: &str) -> ParentRef {
    match fullname.split_once('_') {
        Some(("t1", id)) => ParentRef::Comment(CommentId::new(id)),
        _ => ParentRef::Post,
    }
}

/// Flattens a (possibly nested) comment listing into pre-order records.
///
/// `anchor` is where the listing's own replies attach: a `more` entry pointing
/// at it becomes the batch placeholder, a `more` pointing at a listed comment
/// becomes that comment's placeholder.
pub fn flatten(things: Vec<CommentThing>, anchor: &Anchor) -> Batch {
    let mut batch = Batch::default();
    let mut positions: HashMap<CommentId, usize> = HashMap::new();
    let mut stack: Vec<CommentThing> = things.into_iter().rev().collect();

    while let Some(thing) = stack.pop() {
        match thing {
            CommentThing::Comment(comment) => {
                let Comment {
                    id,
                    parent_id,
                    body,
                    author,
                    score,
                    depth,
                    created_utc,
                    replies,
                    ..
                } = comment;
                let id = CommentId::new(id);
                positions.entry(id.clone()).or_insert(batch.replies.len());
                batch.replies.push(ReplyRecord {
                    id,
                    parent: parse_parent(&parent_id),
                    depth,
                    payload: Payload {
                        author,
                        body,
                        score,
                        created_utc,
                    },
                    more: None,
                });
                if let Some(replies) = replies {
                    stack.extend(replies.children.into_iter().rev());
                }
            }
            CommentThing::More(more) => {
                let parent = parse_parent(&more.parent_id);
                let target = match &parent {
                    ParentRef::Post => Anchor::Root,
                    ParentRef::Comment(id) => Anchor::Node(id.clone()),
                };
                let placeholder = more.into_placeholder(target.clone());
                if &target == anchor {
                    merge_into(&mut batch.placeholder, placeholder);
                } else if let Some(pos) = parent.comment_id().and_then(|id| positions.get(id)) {
                    merge_into(&mut batch.replies[*pos].more, placeholder);
                } else {
                    tracing::warn!(placeholder = %placeholder.id, anchor = %target, "dropping placeholder with no listed parent");
                }
            }
        }
    }
    batch
}

fn merge_into(slot: &mut Option<Placeholder>, placeholder: Placeholder) {
    match slot {
        Some(existing) => existing.coalesce(placeholder),
        None => *slot = Some(placeholder),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing<T> {
    pub children: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thing<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum CommentThing {
    #[serde(rename = "t1")]
    Comment(Comment),
    #[serde(rename = "more")]
    More(More),
}

#[derive(Debug, Clone, Serialize)]
pub struct Comment {
    pub id: String,
    pub parent_id: String,
    pub body: String,
    pub author: String,
    pub score: i64,
    pub depth: usize,
    pub created_utc: f64,
    pub replies: Option<Box<Listing<CommentThing>>>,
}

impl<'de> Deserialize<'de> for Comment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct CommentHelper {
            id: String,
            #[serde(default)]
            parent_id: String,
            #[serde(default)]
            body: String,
            #[serde(default)]
            author: String,
            #[serde(default)]
            score: i64,
            #[serde(default)]
            depth: usize,
            #[serde(default)]
            created_utc: f64,
            #[serde(default)]
            replies: Value,
        }

        let helper = CommentHelper::deserialize(deserializer)?;
        // Reddit sends an empty string instead of a listing when there are no replies.
        let replies = if helper.replies.is_null() || helper.replies == "" {
            None
        } else {
            let listing = serde_json::from_value::<ListingEnvelope<CommentThing>>(helper.replies)
                .map_err(serde::de::Error::custom)?;
            Some(Box::new(listing.data))
        };
        Ok(Comment {
            id: helper.id,
            parent_id: helper.parent_id,
            body: helper.body,
            author: helper.author,
            score: helper.score,
            depth: helper.depth,
            created_utc: helper.created_utc,
            replies,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct More {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub parent_id: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub children: Vec<String>,
}

impl More {
    pub fn is_continue_thread(&self) -> bool {
        self.id == CONTINUE_THREAD_ID
    }

    fn into_placeholder(self, anchor: Anchor) -> Placeholder {
        if self.is_continue_thread() {
            return Placeholder::continue_thread(format!("continue:{}", self.parent_id), anchor);
        }
        let id = if self.name.is_empty() {
            format!("more:{}", self.id)
        } else {
            self.name
        };
        let count = self.count.max(self.children.len());
        Placeholder::new(id, anchor, count).with_continuation(self.children)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostComments {
    pub post: Post,
    pub comments: Listing<CommentThing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListingEnvelope<T> {
    data: Listing<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct MoreChildrenResponse {
    json: MoreChildrenBody,
}

#[derive(Debug, Clone, Deserialize)]
struct MoreChildrenBody {
    #[serde(default)]
    errors: Vec<Vec<Value>>,
    #[serde(default)]
    data: MoreChildrenData,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MoreChildrenData {
    #[serde(default)]
    things: Vec<CommentThing>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comment(id: &str, parent: &str, depth: usize, replies: Value) -> Value {
        json!({
            "kind": "t1",
            "data": {
                "id": id,
                "name": format!("t1_{id}"),
                "parent_id": parent,
                "body": format!("body {id}"),
                "author": "someone",
                "score": 3,
                "depth": depth,
                "created_utc": 1700000000.0,
                "replies": replies,
            }
        })
    }

    fn listing(children: Vec<Value>) -> Value {
        json!({ "kind": "Listing", "data": { "after": null, "before": null, "children": children } })
    }

    fn more(id: &str, parent: &str, count: usize, children: &[&str]) -> Value {
        json!({
            "kind": "more",
            "data": {
                "id": id,
                "name": format!("t1_{id}"),
                "parent_id": parent,
                "count": count,
                "depth": 1,
                "children": children,
            }
        })
    }

    fn thread_payload() -> Vec<Value> {
        let post = listing(vec![json!({
            "kind": "t3",
            "data": { "id": "abc", "name": "t3_abc", "title": "A thread" }
        })]);
        let comments = listing(vec![
            comment(
                "c1",
                "t3_abc",
                0,
                listing(vec![
                    comment("c2", "t1_c1", 1, json!("")),
                    more("m2", "t1_c1", 4, &["c5", "c6"]),
                ]),
            ),
            comment(
                "c3",
                "t3_abc",
                0,
                listing(vec![more("_", "t1_c3", 0, &[])]),
            ),
            more("m0", "t3_abc", 12, &["c7", "c8", "c9"]),
        ]);
        vec![post, comments]
    }

    #[test]
    fn parses_nested_comment_payload() {
        let parsed = parse_comments_payload(thread_payload()).unwrap();
        assert_eq!(parsed.post.id, "abc");
        assert_eq!(parsed.comments.children.len(), 3);
        let CommentThing::Comment(first) = &parsed.comments.children[0] else {
            panic!("expected comment");
        };
        assert_eq!(first.replies.as_ref().unwrap().children.len(), 2);
    }

    #[test]
    fn flattens_in_preorder_with_placeholders() {
        let parsed = parse_comments_payload(thread_payload()).unwrap();
        let batch = flatten(parsed.comments.children, &Anchor::Root);
        let ids: Vec<&str> = batch.replies.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert_eq!(batch.replies[1].parent, ParentRef::Comment("c1".into()));

        let root = batch.placeholder.unwrap();
        assert_eq!(root.anchor, Anchor::Root);
        assert_eq!(root.count, 12);
        assert_eq!(root.continuation, vec!["c7", "c8", "c9"]);

        let nested = batch.replies[0].more.as_ref().unwrap();
        assert_eq!(nested.anchor, Anchor::Node("c1".into()));
        assert_eq!(nested.count, 4);

        let cont = batch.replies[2].more.as_ref().unwrap();
        assert!(cont.is_continuation);
        assert_eq!(cont.label(), "continue this thread");
    }

    #[test]
    fn flatten_routes_anchor_more_to_batch() {
        let things: Vec<CommentThing> = serde_json::from_value(json!([
            comment("c5", "t1_c1", 1, json!("")),
            comment("c10", "t1_c5", 2, json!("")),
            more("m3", "t1_c1", 2, &["c6", "c11"]),
            more("m4", "t1_c5", 1, &["c12"]),
            more("m5", "t1_zz", 1, &["c13"]),
        ]))
        .unwrap();
        let batch = flatten(things, &Anchor::Node("c1".into()));
        assert_eq!(batch.replies.len(), 2);
        assert_eq!(batch.placeholder.unwrap().continuation, vec!["c6", "c11"]);
        assert_eq!(batch.replies[0].more.as_ref().unwrap().continuation, vec!["c12"]);
        assert!(batch.replies[1].more.is_none());
    }

    #[test]
    fn parses_morechildren_response() {
        let body = json!({
            "json": {
                "errors": [],
                "data": { "things": [comment("c5", "t1_c1", 1, json!(""))] }
            }
        });
        let parsed: MoreChildrenResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.json.data.things.len(), 1);
    }

    #[test]
    fn post_id_forms() {
        assert_eq!(parse_post_id("abc123").unwrap(), "abc123");
        assert_eq!(parse_post_id("t3_abc123").unwrap(), "abc123");
        assert_eq!(
            parse_post_id("https://www.reddit.com/r/rust/comments/abc123/some_title/").unwrap(),
            "abc123"
        );
        assert_eq!(parse_post_id("https://redd.it/abc123").unwrap(), "abc123");
        assert!(parse_post_id("https://example.com/nothing").is_err());
        assert!(parse_post_id("  ").is_err());
        assert!(parse_post_id("a/b").is_err());
    }

    #[test]
    fn rate_budget_follows_window() {
        let now = SystemTime::now();
        assert_eq!(RateLimit::default().budget(now), None);

        let open = RateLimit {
            used: 590.0,
            remaining: 10.7,
            reset_at: Some(now + Duration::from_secs(60)),
        };
        assert_eq!(open.budget(now), Some(10));
        assert_eq!(open.budget(now + Duration::from_secs(61)), None);

        let spent = RateLimit {
            remaining: 0.0,
            ..open
        };
        assert_eq!(spent.budget(now), Some(0));
    }

    #[test]
    fn client_requires_user_agent() {
        assert!(Client::new(None, ClientConfig::default()).is_err());
    }
}
