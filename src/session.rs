use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::data::ListingService;
use crate::graft::{graft, Batch};
use crate::resolve::{self, Resolution, TreeError};
use crate::tree::{Anchor, Forest, Placeholder, PlaceholderId};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("comments are not loaded yet")]
    NotPopulated,
    #[error("comments were already requested")]
    AlreadyLoaded,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Tree(#[from] TreeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Loading,
    Populated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandOutcome {
    Started,
    /// A fetch for this placeholder is already outstanding; the request was ignored.
    AlreadyInFlight,
    /// The anchor no longer carries this placeholder.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    Initial,
    More,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Populated {
        nodes: usize,
    },
    Expanded {
        placeholder: PlaceholderId,
        added: usize,
        skipped: usize,
    },
    AnchorNotFound {
        placeholder: PlaceholderId,
        anchor: Anchor,
    },
    TransportFailure {
        stage: FetchStage,
        placeholder: Option<PlaceholderId>,
        message: String,
    },
}

struct PendingLoad {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
}

struct PendingExpansion {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
}

enum FetchResponse {
    Initial {
        request_id: u64,
        result: Result<Batch>,
    },
    More {
        request_id: u64,
        placeholder: Placeholder,
        result: Result<Batch>,
    },
}

/// Owns one discussion's forest and every fetch that feeds it.
///
/// Fetches run on worker threads and report back over a channel; results are
/// only applied from [`poll`](Self::poll), [`wait`](Self::wait) or
/// [`run_until_idle`](Self::run_until_idle), so the forest is only ever
/// mutated from the thread that owns the session.
pub struct CommentTreeSession {
    post_id: String,
    service: Arc<dyn ListingService>,
    forest: Forest,
    state: SessionState,
    response_tx: Sender<FetchResponse>,
    response_rx: Receiver<FetchResponse>,
    event_tx: Sender<SessionEvent>,
    event_rx: Receiver<SessionEvent>,
    next_request_id: u64,
    pending_load: Option<PendingLoad>,
    pending_expansions: HashMap<PlaceholderId, PendingExpansion>,
}

impl CommentTreeSession {
    pub fn new(post_id: impl Into<String>, service: Arc<dyn ListingService>) -> Self {
        let (response_tx, response_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        Self {
            post_id: post_id.into(),
            service,
            forest: Forest::new(),
            state: SessionState::Empty,
            response_tx,
            response_rx,
            event_tx,
            event_rx,
            next_request_id: 1,
            pending_load: None,
            pending_expansions: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn events(&self) -> Receiver<SessionEvent> {
        self.event_rx.clone()
    }

    pub fn is_expanding(&self, placeholder: &PlaceholderId) -> bool {
        self.pending_expansions.contains_key(placeholder)
    }

    pub fn is_busy(&self) -> bool {
        self.pending_load.is_some() || !self.pending_expansions.is_empty()
    }

    pub fn load(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Empty => {}
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Loading | SessionState::Populated => {
                return Err(SessionError::AlreadyLoaded)
            }
        }

        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_load = Some(PendingLoad {
            request_id,
            cancel_flag: cancel_flag.clone(),
        });
        self.state = SessionState::Loading;
        tracing::debug!(post = %self.post_id, request_id, "loading comments");

        let tx = self.response_tx.clone();
        let service = self.service.clone();
        let post_id = self.post_id.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.fetch_initial(&post_id);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(FetchResponse::Initial { request_id, result });
        });
        Ok(())
    }

    pub fn request_expansion(
        &mut self,
        placeholder: &Placeholder,
    ) -> Result<ExpandOutcome, SessionError> {
        match self.state {
            SessionState::Populated => {}
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Empty | SessionState::Loading => return Err(SessionError::NotPopulated),
        }
        if self.pending_expansions.contains_key(&placeholder.id) {
            tracing::debug!(placeholder = %placeholder.id, "expansion already in flight");
            return Ok(ExpandOutcome::AlreadyInFlight);
        }

        let current = match self.forest.locate_placeholder(&placeholder.anchor) {
            Some(slot) => slot.pending().cloned(),
            None => {
                let Anchor::Node(anchor) = &placeholder.anchor else {
                    return Ok(ExpandOutcome::Stale);
                };
                return Err(TreeError::AnchorNotFound {
                    anchor: anchor.clone(),
                }
                .into());
            }
        };
        let Some(current) = current.filter(|current| current.id == placeholder.id) else {
            return Ok(ExpandOutcome::Stale);
        };

        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_expansions.insert(
            current.id.clone(),
            PendingExpansion {
                request_id,
                cancel_flag: cancel_flag.clone(),
            },
        );
        tracing::debug!(placeholder = %current.id, anchor = %current.anchor, request_id, "expanding placeholder");

        let tx = self.response_tx.clone();
        let service = self.service.clone();
        let post_id = self.post_id.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.fetch_more(&post_id, &current);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(FetchResponse::More {
                request_id,
                placeholder: current,
                result,
            });
        });
        Ok(ExpandOutcome::Started)
    }

    /// Applies every completed fetch without blocking.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            changed |= self.handle_response(message);
        }
        changed
    }

    /// Blocks for at most `timeout` waiting for one completed fetch, then
    /// drains whatever else has arrived.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        match self.response_rx.recv_timeout(timeout) {
            Ok(message) => {
                let changed = self.handle_response(message);
                self.poll() || changed
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Waits until nothing is in flight. Returns `false` on timeout.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_busy() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.wait(remaining);
        }
        true
    }

    /// Cancels outstanding fetches and drops the forest. Late results are discarded.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(pending) = self.pending_load.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        for (_, pending) in self.pending_expansions.drain() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        self.forest = Forest::new();
        self.state = SessionState::Closed;
        tracing::debug!(post = %self.post_id, "session closed");
    }

    fn take_request_id(&mut self) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        request_id
    }

    fn handle_response(&mut self, message: FetchResponse) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        match message {
            FetchResponse::Initial { request_id, result } => {
                self.apply_initial(request_id, result)
            }
            FetchResponse::More {
                request_id,
                placeholder,
                result,
            } => self.apply_more(request_id, placeholder, result),
        }
    }

    fn apply_initial(&mut self, request_id: u64, result: Result<Batch>) -> bool {
        let Some(pending) = &self.pending_load else {
            return false;
        };
        if pending.cancel_flag.load(Ordering::SeqCst) || pending.request_id != request_id {
            return false;
        }
        self.pending_load = None;

        match result {
            Ok(batch) => {
                let (forest, skipped) = resolve::populate(batch);
                self.forest = forest;
                self.state = SessionState::Populated;
                self.check_invariants();
                tracing::debug!(post = %self.post_id, nodes = self.forest.len(), skipped, "comments loaded");
                self.emit(SessionEvent::Populated {
                    nodes: self.forest.len(),
                });
            }
            Err(err) => {
                self.state = SessionState::Empty;
                tracing::warn!(post = %self.post_id, "failed to load comments: {err:#}");
                self.emit(SessionEvent::TransportFailure {
                    stage: FetchStage::Initial,
                    placeholder: None,
                    message: format!("{err:#}"),
                });
            }
        }
        true
    }

    fn apply_more(&mut self, request_id: u64, placeholder: Placeholder, result: Result<Batch>) -> bool {
        let Some(pending) = self.pending_expansions.get(&placeholder.id) else {
            return false;
        };
        if pending.cancel_flag.load(Ordering::SeqCst) || pending.request_id != request_id {
            return false;
        }
        self.pending_expansions.remove(&placeholder.id);

        let batch = match result {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(placeholder = %placeholder.id, "failed to load more comments: {err:#}");
                self.emit(SessionEvent::TransportFailure {
                    stage: FetchStage::More,
                    placeholder: Some(placeholder.id),
                    message: format!("{err:#}"),
                });
                return true;
            }
        };

        let fetched = graft(batch.replies);
        match resolve::resolve(&mut self.forest, &placeholder, fetched, batch.placeholder) {
            Ok(Resolution::Merged { added, skipped }) => {
                self.check_invariants();
                self.emit(SessionEvent::Expanded {
                    placeholder: placeholder.id,
                    added,
                    skipped,
                });
                true
            }
            Ok(Resolution::Stale) => false,
            Err(TreeError::AnchorNotFound { anchor }) => {
                tracing::warn!(placeholder = %placeholder.id, %anchor, "anchor vanished before merge");
                self.emit(SessionEvent::AnchorNotFound {
                    placeholder: placeholder.id,
                    anchor: Anchor::Node(anchor),
                });
                true
            }
        }
    }

    fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            if let Err(err) = self.forest.validate() {
                tracing::error!(post = %self.post_id, "forest invariant broken: {err}");
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for CommentTreeSession {
    fn drop(&mut self) {
        self.close();
    }
}
