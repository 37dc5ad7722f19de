//! `SessionClient`: the user-facing object (spec.md §4.3).
//!
//! Owns the document replica, revision, users, note metadata, the OT state
//! machine, and the rate limiter / batch buffer / undo stacks / reconnect
//! supervisor built on top of it. Grounded on the teacher's
//! `CollaborationManager` (`src/features/collaboration.rs`) for the overall
//! shape (a manager object wrapping shared state behind `Arc<Mutex<_>>`,
//! spawning a task to pump inbound transport messages) and on the
//! `rustpad` reference server's `RwLock<State>` for how the mutable state
//! is serialized behind one logical lock (spec.md §5).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};

use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::op::TextOperation;
use crate::ot_client::{Collaborators, OtClient};
use crate::transport::{Transport, TransportEvent};

/// Permission vocabulary (spec.md §4.3.1). `Unknown` is reserved for
/// defensive defaults when the server sends something unrecognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Freely,
    Editable,
    Limited,
    Locked,
    Private,
    Protected,
    #[serde(other)]
    Unknown,
}

impl Permission {
    /// Pure function of `(permission, is_logged_in)` per spec.md §4.3.1's
    /// table. `locked`/`private`/`protected` optimistically admit any
    /// logged-in user — the source behavior spec.md §9 explicitly retains,
    /// relying on the server to refuse.
    pub fn can_edit(self, is_logged_in: bool) -> bool {
        match self {
            Permission::Freely => true,
            Permission::Editable | Permission::Limited => is_logged_in,
            Permission::Locked | Permission::Private | Permission::Protected => is_logged_in,
            Permission::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorInfo {
    pub position: Option<usize>,
    pub selection: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub color: String,
    pub photo: Option<String>,
    pub cursor: Option<CursorInfo>,
}

/// A read-only record of the user responsible for a half-open character
/// range (spec.md §3 "Authorship span"). Reissued by the server at
/// `refresh` time; the core does not maintain these under local edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorshipSpan {
    pub user_id: Option<String>,
    pub start: usize,
    pub end: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteInfo {
    pub title: String,
    pub permission: Permission,
    pub owner_id: Option<String>,
    pub authors: HashMap<String, UserProfile>,
    pub authorship_spans: Vec<AuthorshipSpan>,
}

impl Default for NoteInfo {
    fn default() -> Self {
        Self {
            title: String::new(),
            permission: Permission::Unknown,
            owner_id: None,
            authors: HashMap::new(),
            authorship_spans: Vec::new(),
        }
    }
}

/// One undo/redo history entry (spec.md §3 "Undo/redo stacks").
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub operation: TextOperation,
    pub pre_document: String,
    pub post_document: String,
    pub timestamp: Instant,
}

/// Events fanned out on every document mutation (spec.md §4.3's
/// submission pipeline and §4.2's `applyOperation` hook). `MacroEngine`
/// subscribes to this stream and reacts only to `Remote`.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Local { operation: TextOperation },
    Remote { operation: TextOperation, user_id: Option<String> },
}

/// Terminal / progress events outside the document-change stream:
/// reconnection progress, fatal errors, deletion.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Ready,
    ReconnectAttemptFailed { attempt: u32 },
    ReconnectReplaying,
    ReconnectFailed { attempts: u32 },
    Deleted,
    Error(String),
    /// No ack arrived for the outstanding operation within
    /// `SessionConfig::operation_timeout` (spec.md §5, §7). Does not itself
    /// mutate session state; the FSM keeps waiting and a late ack still
    /// resolves normally.
    OperationTimeout { ms: u64 },
}

struct RateLimiterState {
    enabled: bool,
    min_interval: Duration,
    max_burst: usize,
    burst_window: Duration,
    last_op_timestamp: Option<Instant>,
    recent_timestamps: VecDeque<Instant>,
    queue: VecDeque<TextOperation>,
    draining: bool,
}

impl RateLimiterState {
    fn from_config(cfg: &crate::config::RateLimitConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            min_interval: cfg.min_interval,
            max_burst: cfg.max_burst,
            burst_window: cfg.burst_window,
            last_op_timestamp: None,
            recent_timestamps: VecDeque::new(),
            queue: VecDeque::new(),
            draining: false,
        }
    }

    /// Token check: accept iff enough time has elapsed since the last op
    /// and fewer than `max_burst` ops landed within `burst_window`.
    fn try_admit(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }
        while let Some(&front) = self.recent_timestamps.front() {
            if now.duration_since(front) > self.burst_window {
                self.recent_timestamps.pop_front();
            } else {
                break;
            }
        }
        let interval_ok = self
            .last_op_timestamp
            .map(|last| now.duration_since(last) >= self.min_interval)
            .unwrap_or(true);
        let burst_ok = self.recent_timestamps.len() < self.max_burst;
        interval_ok && burst_ok
    }

    fn record(&mut self, now: Instant) {
        self.last_op_timestamp = Some(now);
        self.recent_timestamps.push_back(now);
    }

    /// Earliest instant at which another operation would be admitted,
    /// given the current queue occupancy. Disabling the limiter mid-drain
    /// must let the queue flush at full speed (spec.md §4.3.3), so a
    /// disabled limiter admits immediately regardless of prior timestamps.
    fn next_admission_time(&self, now: Instant) -> Instant {
        if !self.enabled {
            return now;
        }
        let by_interval = self
            .last_op_timestamp
            .map(|last| last + self.min_interval)
            .unwrap_or(now);
        let by_burst = if self.recent_timestamps.len() < self.max_burst {
            now
        } else {
            self.recent_timestamps
                .front()
                .copied()
                .unwrap_or(now)
                + self.burst_window
        };
        by_interval.max(by_burst).max(now)
    }
}

struct SessionState {
    ready: bool,
    is_logged_in: bool,
    replica: String,
    fsm: OtClient,
    users: HashMap<String, UserProfile>,
    note_info: NoteInfo,
    rate_limiter: RateLimiterState,
    batch: Option<Vec<TextOperation>>,
    undo_stack: Vec<UndoEntry>,
    redo_stack: Vec<UndoEntry>,
    suspend_undo: bool,
    undo_config: crate::config::UndoConfig,
    /// Bumped every time an operation is sent to the transport. A spawned
    /// timeout watcher compares its captured generation against this value
    /// after `operation_timeout` elapses: a mismatch means a new send (or an
    /// ack resolving to `Synchronized`) has since occurred, so the watcher
    /// stands down instead of firing a stale timeout.
    op_send_generation: u64,
    server_version: Option<Value>,
}

/// An effect the FSM or submission pipeline wants carried out against the
/// transport, collected synchronously under the write lock and flushed
/// asynchronously once it is released (spec.md §5: "Transport message
/// handlers MUST run to completion without suspension").
enum Effect {
    SendOperation { revision: u64, op: TextOperation },
    RequestOperations { base: u64, head: u64 },
}

/// Bridges `OtClient`'s synchronous `Collaborators` hooks to
/// `SessionState` mutation plus effect collection.
struct Bridge<'a> {
    replica: &'a mut String,
    rate_limiter: &'a mut RateLimiterState,
    batch: &'a mut Option<Vec<TextOperation>>,
    change_tx: &'a broadcast::Sender<ChangeEvent>,
    effects: &'a mut Vec<Effect>,
    remote_user: Option<String>,
}

impl<'a> Collaborators for Bridge<'a> {
    fn send_operation(&mut self, revision: u64, op: &TextOperation) {
        self.effects.push(Effect::SendOperation {
            revision,
            op: op.clone(),
        });
    }

    fn apply_operation(&mut self, op: &TextOperation) {
        match op.apply(self.replica) {
            Ok(new_doc) => *self.replica = new_doc,
            Err(err) => {
                log::error!("remote operation failed to apply: {err}");
                return;
            }
        }
        transform_queue_against_remote(&mut self.rate_limiter.queue, op);
        if let Some(batch) = self.batch.as_mut() {
            transform_batch_against_remote(batch, op);
        }
        let _ = self.change_tx.send(ChangeEvent::Remote {
            operation: op.clone(),
            user_id: self.remote_user.clone(),
        });
    }

    fn get_operations(&mut self, base: u64, head: u64) {
        self.effects.push(Effect::RequestOperations { base, head });
    }
}

/// The document new local edits must be positioned against: the live
/// replica with the pending rate-limit queue (or, while batching, the
/// batch buffer) folded on top. Without this, a burst of edits issued
/// before the queue drains would validate positions against a replica
/// that hasn't caught up yet, and each queued op's `baseLength` would fail
/// to chain to the one ahead of it once dequeued (spec.md §4.3.3's
/// `baseLength == document.length at dequeue time` invariant is only
/// meaningful if it was computed this way at enqueue time).
fn projected_document(state: &SessionState) -> String {
    let mut doc = state.replica.clone();
    for op in &state.rate_limiter.queue {
        if let Ok(next) = op.apply(&doc) {
            doc = next;
        }
    }
    if let Some(batch) = &state.batch {
        for op in batch {
            if let Ok(next) = op.apply(&doc) {
                doc = next;
            }
        }
    }
    doc
}

/// Transform every queued (not-yet-sent) operation against `remote`,
/// advancing a rolling copy of the remote operation through each. Entries
/// that fail to transform (stale `baseLength`) are dropped with a log, per
/// spec.md §4.3.3.
fn transform_queue_against_remote(queue: &mut VecDeque<TextOperation>, remote: &TextOperation) {
    let mut rolling = remote.clone();
    let drained: Vec<_> = queue.drain(..).collect();
    for queued in drained {
        match queued.transform(&rolling) {
            Ok((queued_prime, remote_prime)) => {
                queue.push_back(queued_prime);
                rolling = remote_prime;
            }
            Err(err) => log::warn!("dropping stale queued operation: {err}"),
        }
    }
}

/// Maintains the batch buffer's `baseLength == document.length` invariant
/// (spec.md §3 "Batch buffer") by transforming its accumulated operations
/// against an inbound remote operation, the same way the rate-limit queue
/// is handled.
fn transform_batch_against_remote(batch: &mut Vec<TextOperation>, remote: &TextOperation) {
    let mut rolling = remote.clone();
    let drained = std::mem::take(batch);
    for op in drained {
        match op.transform(&rolling) {
            Ok((op_prime, remote_prime)) => {
                batch.push(op_prime);
                rolling = remote_prime;
            }
            Err(err) => log::warn!("dropping stale batched operation: {err}"),
        }
    }
}

/// The realtime OT client: owns the replica and mediates every local and
/// remote mutation. Cheap to clone — every field is an `Arc` handle onto
/// shared state, matching the teacher's `Arc<Mutex<_>>`-wrapped managers.
#[derive(Clone)]
pub struct SessionClient {
    state: Arc<RwLock<SessionState>>,
    transport: Arc<AsyncMutex<Box<dyn Transport>>>,
    config: SessionConfig,
    change_tx: broadcast::Sender<ChangeEvent>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl SessionClient {
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        let (change_tx, _) = broadcast::channel(256);
        let (lifecycle_tx, _) = broadcast::channel(64);
        Self {
            state: Arc::new(RwLock::new(SessionState {
                ready: false,
                is_logged_in: false,
                replica: String::new(),
                fsm: OtClient::new(0),
                users: HashMap::new(),
                note_info: NoteInfo::default(),
                rate_limiter: RateLimiterState::from_config(&config.rate_limit),
                batch: None,
                undo_stack: Vec::new(),
                redo_stack: Vec::new(),
                suspend_undo: false,
                undo_config: config.undo.clone(),
                op_send_generation: 0,
                server_version: None,
            })),
            transport: Arc::new(AsyncMutex::new(transport)),
            config,
            change_tx,
            lifecycle_tx,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    pub async fn set_logged_in(&self, logged_in: bool) {
        self.state.write().await.is_logged_in = logged_in;
    }

    // -- read-only snapshots -------------------------------------------------

    pub async fn document_snapshot(&self) -> (String, u64) {
        let state = self.state.read().await;
        (state.replica.clone(), state.fsm.revision())
    }

    pub async fn title(&self) -> String {
        self.state.read().await.note_info.title.clone()
    }

    pub async fn permission(&self) -> Permission {
        self.state.read().await.note_info.permission
    }

    pub async fn is_synchronized(&self) -> bool {
        self.state.read().await.fsm.is_synchronized()
    }

    /// Joins authorship spans with author profiles against the live
    /// document (spec.md §4.3.2).
    pub async fn document_with_authorship(&self) -> DocumentWithAuthorship {
        let state = self.state.read().await;
        DocumentWithAuthorship {
            content: state.replica.clone(),
            authors: state.note_info.authors.clone(),
            spans: state.note_info.authorship_spans.clone(),
        }
    }

    pub async fn author_at(&self, pos: usize) -> Option<String> {
        let state = self.state.read().await;
        state
            .note_info
            .authorship_spans
            .iter()
            .find(|span| span.start <= pos && pos < span.end)
            .and_then(|span| span.user_id.clone())
    }

    /// Looks up a collaborator's display name by id, for the macro engine's
    /// user filter (spec.md §4.4.4).
    pub async fn user_name(&self, user_id: &str) -> Option<String> {
        self.state.read().await.users.get(user_id).map(|u| u.name.clone())
    }

    pub async fn text_by_author(&self, user_id: &str) -> String {
        let state = self.state.read().await;
        let mut out = String::new();
        for span in &state.note_info.authorship_spans {
            if span.user_id.as_deref() == Some(user_id) {
                if let Some(slice) = state.replica.get(span.start..span.end) {
                    out.push_str(slice);
                }
            }
        }
        out
    }

    // -- permission gate ------------------------------------------------------

    fn check_can_edit(state: &SessionState) -> CoreResult<()> {
        if !state.ready {
            return Err(CoreError::NotReady);
        }
        if !state.note_info.permission.can_edit(state.is_logged_in) {
            return Err(CoreError::PermissionDenied(state.note_info.permission));
        }
        Ok(())
    }

    // -- edit API (spec.md §4.3) ----------------------------------------------

    pub async fn insert(&self, pos: usize, text: &str) -> CoreResult<()> {
        let op = {
            let state = self.state.read().await;
            Self::check_can_edit(&state)?;
            let doc = projected_document(&state);
            let len = doc.len();
            if pos > len || !doc.is_char_boundary(pos) {
                return Err(CoreError::PositionOutOfBounds { pos, len });
            }
            let mut op = TextOperation::new();
            op.retain(pos).insert(text).retain(len - pos);
            op
        };
        self.submit(op).await
    }

    pub async fn delete(&self, pos: usize, n: usize) -> CoreResult<()> {
        let op = {
            let state = self.state.read().await;
            Self::check_can_edit(&state)?;
            let doc = projected_document(&state);
            let len = doc.len();
            let end = pos + n;
            if end > len || !doc.is_char_boundary(pos) || !doc.is_char_boundary(end) {
                return Err(CoreError::PositionOutOfBounds { pos: end, len });
            }
            let mut op = TextOperation::new();
            op.retain(pos).delete(n).retain(len - end);
            op
        };
        self.submit(op).await
    }

    pub async fn replace(&self, pos: usize, n: usize, text: &str) -> CoreResult<()> {
        let op = {
            let state = self.state.read().await;
            Self::check_can_edit(&state)?;
            let doc = projected_document(&state);
            let len = doc.len();
            let end = pos + n;
            if end > len || !doc.is_char_boundary(pos) || !doc.is_char_boundary(end) {
                return Err(CoreError::PositionOutOfBounds { pos: end, len });
            }
            let mut op = TextOperation::new();
            op.retain(pos).delete(n).insert(text).retain(len - end);
            op
        };
        self.submit(op).await
    }

    /// A single delete-all + insert-all.
    pub async fn set_content(&self, new_content: &str) -> CoreResult<()> {
        let op = {
            let state = self.state.read().await;
            Self::check_can_edit(&state)?;
            let doc = projected_document(&state);
            let mut op = TextOperation::new();
            op.delete(doc.len()).insert(new_content);
            op
        };
        self.submit(op).await
    }

    /// Computes the minimal single replace by trimming the common prefix
    /// and suffix, then emits one replace (spec.md §4.3, used by undo/redo).
    pub async fn update_content(&self, new_content: &str) -> CoreResult<()> {
        let op = {
            let state = self.state.read().await;
            Self::check_can_edit(&state)?;
            let doc = projected_document(&state);
            minimal_replace(&doc, new_content)
        };
        match op {
            Some(op) => self.submit(op).await,
            None => Ok(()),
        }
    }

    pub async fn apply_operation(&self, op: TextOperation) -> CoreResult<()> {
        {
            let state = self.state.read().await;
            Self::check_can_edit(&state)?;
        }
        self.submit(op).await
    }

    /// Matches are processed right-to-left so earlier match indices remain
    /// valid after a replacement.
    pub async fn replace_regex(
        &self,
        pattern: &Regex,
        repl: impl Fn(&regex::Captures) -> String,
    ) -> CoreResult<usize> {
        let document = self.document_snapshot().await.0;
        let matches: Vec<_> = pattern.captures_iter(&document).collect();
        let mut count = 0;
        for caps in matches.into_iter().rev() {
            let whole = caps.get(0).unwrap();
            let replacement = repl(&caps);
            self.replace(whole.start(), whole.len(), &replacement).await?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn replace_first(
        &self,
        pattern: &Regex,
        repl: impl Fn(&regex::Captures) -> String,
    ) -> CoreResult<bool> {
        let document = self.document_snapshot().await.0;
        if let Some(caps) = pattern.captures(&document) {
            let whole = caps.get(0).unwrap();
            let replacement = repl(&caps);
            self.replace(whole.start(), whole.len(), &replacement).await?;
            return Ok(true);
        }
        Ok(false)
    }

    // -- line helpers (zero-indexed, split on '\n') ---------------------------

    pub async fn get_line(&self, index: usize) -> Option<String> {
        let document = self.document_snapshot().await.0;
        document.split('\n').nth(index).map(|s| s.to_string())
    }

    pub async fn get_lines(&self) -> Vec<String> {
        let document = self.document_snapshot().await.0;
        document.split('\n').map(|s| s.to_string()).collect()
    }

    pub async fn get_line_start(&self, index: usize) -> Option<usize> {
        let document = self.document_snapshot().await.0;
        line_bounds(&document, index).map(|(start, _)| start)
    }

    pub async fn get_line_end(&self, index: usize) -> Option<usize> {
        let document = self.document_snapshot().await.0;
        line_bounds(&document, index).map(|(_, end)| end)
    }

    /// Replaces line `index`'s content, preserving its trailing newline.
    pub async fn set_line(&self, index: usize, content: &str) -> CoreResult<()> {
        let document = self.document_snapshot().await.0;
        let Some((start, end)) = line_bounds(&document, index) else {
            return Ok(());
        };
        self.replace(start, end - start, content).await
    }

    pub async fn insert_line(&self, index: usize, content: &str) -> CoreResult<()> {
        let document = self.document_snapshot().await.0;
        let lines: Vec<&str> = document.split('\n').collect();
        let at = if index >= lines.len() {
            document.len()
        } else {
            line_bounds(&document, index).map(|(start, _)| start).unwrap_or(document.len())
        };
        let mut text = content.to_string();
        text.push('\n');
        self.insert(at, &text).await
    }

    /// Deleting the only line clears it; deleting the last line removes
    /// the preceding `\n`; deleting any other line removes its trailing
    /// `\n`.
    pub async fn delete_line(&self, index: usize) -> CoreResult<()> {
        let document = self.document_snapshot().await.0;
        let lines: Vec<&str> = document.split('\n').collect();
        if lines.len() == 1 {
            return self.set_content("").await;
        }
        let Some((start, end)) = line_bounds(&document, index) else {
            return Ok(());
        };
        if index == lines.len() - 1 {
            // last line: remove the preceding newline too.
            let from = start.saturating_sub(1);
            self.delete(from, end - from).await
        } else {
            // remove through the trailing newline.
            self.delete(start, end - start + 1).await
        }
    }

    pub async fn replace_lines(&self, start: usize, end: usize, content: &[String]) -> CoreResult<()> {
        let document = self.document_snapshot().await.0;
        let line_start = line_bounds(&document, start).map(|(s, _)| s).unwrap_or(document.len());
        let lines: Vec<&str> = document.split('\n').collect();
        let line_end = if end >= lines.len() {
            document.len()
        } else {
            line_bounds(&document, end).map(|(s, _)| s.saturating_sub(1)).unwrap_or(document.len())
        };
        let replacement = content.join("\n");
        self.replace(line_start, line_end.saturating_sub(line_start), &replacement).await
    }

    // -- batching (spec.md §4.3.4) --------------------------------------------

    pub async fn start_batch(&self) {
        self.state.write().await.batch = Some(Vec::new());
    }

    pub async fn cancel_batch(&self) {
        self.state.write().await.batch = None;
    }

    pub async fn end_batch(&self) -> CoreResult<()> {
        let ops = self.state.write().await.batch.take();
        let Some(ops) = ops else { return Ok(()) };
        if ops.is_empty() {
            return Ok(());
        }
        let mut iter = ops.into_iter();
        let mut composed = iter.next().unwrap();
        for op in iter {
            composed = composed.compose(&op)?;
        }
        self.submit(composed).await
    }

    /// Runs `f`, guaranteeing `cancel_batch` on error.
    pub async fn batch<F, Fut, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(SessionClient) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.start_batch().await;
        match f(self.clone()).await {
            Ok(value) => {
                self.end_batch().await?;
                Ok(value)
            }
            Err(err) => {
                self.cancel_batch().await;
                Err(err)
            }
        }
    }

    // -- undo / redo (spec.md §4.3.5) -----------------------------------------

    pub async fn can_undo(&self) -> bool {
        !self.state.read().await.undo_stack.is_empty()
    }

    pub async fn can_redo(&self) -> bool {
        !self.state.read().await.redo_stack.is_empty()
    }

    pub async fn clear_history(&self) {
        let mut state = self.state.write().await;
        state.undo_stack.clear();
        state.redo_stack.clear();
    }

    pub async fn undo(&self) -> CoreResult<()> {
        let entry = self.state.write().await.undo_stack.pop();
        let Some(entry) = entry else { return Ok(()) };
        self.state.write().await.suspend_undo = true;
        let result = self.update_content(&entry.pre_document).await;
        let mut state = self.state.write().await;
        state.suspend_undo = false;
        if result.is_ok() {
            state.redo_stack.push(entry);
        } else {
            state.undo_stack.push(entry);
        }
        result
    }

    pub async fn redo(&self) -> CoreResult<()> {
        let entry = self.state.write().await.redo_stack.pop();
        let Some(entry) = entry else { return Ok(()) };
        self.state.write().await.suspend_undo = true;
        let result = self.update_content(&entry.post_document).await;
        let mut state = self.state.write().await;
        state.suspend_undo = false;
        if result.is_ok() {
            state.undo_stack.push(entry);
        } else {
            state.redo_stack.push(entry);
        }
        result
    }

    // -- rate limiting ---------------------------------------------------------

    /// Flips the enforcement switch without flushing; returns the prior
    /// value so callers (e.g. streaming macro workers) can restore it.
    pub async fn set_rate_limiting_enabled(&self, enabled: bool) -> bool {
        let mut state = self.state.write().await;
        let prev = state.rate_limiter.enabled;
        state.rate_limiter.enabled = enabled;
        prev
    }

    // -- outbound metadata requests (spec.md §6) -------------------------------

    /// Requests a fresh `refresh(noteInfo)` push from the server.
    pub async fn request_refresh(&self) -> CoreResult<()> {
        let mut transport = self.transport.lock().await;
        transport.emit("refresh", Vec::new()).await
    }

    /// Requests the current `online users({users[]})` snapshot.
    pub async fn request_online_users(&self) -> CoreResult<()> {
        let mut transport = self.transport.lock().await;
        transport.emit("online users", Vec::new()).await
    }

    /// Requests the server's `version(info)` payload.
    pub async fn request_version(&self) -> CoreResult<()> {
        let mut transport = self.transport.lock().await;
        transport.emit("version", Vec::new()).await
    }

    /// The most recent `version(info)` payload received from the server,
    /// if any (spec.md §6's `version` inbound event).
    pub async fn server_version(&self) -> Option<Value> {
        self.state.read().await.server_version.clone()
    }

    // -- submission pipeline (spec.md §4.3) ------------------------------------

    async fn submit(&self, op: TextOperation) -> CoreResult<()> {
        enum Outcome {
            Batched,
            Queued { should_spawn: bool },
            Executed(Vec<Effect>),
        }
        let outcome = {
            let mut state = self.state.write().await;
            if !state.ready {
                return Err(CoreError::NotReady);
            }
            if let Some(batch) = state.batch.as_mut() {
                batch.push(op);
                Outcome::Batched
            } else {
                let now = Instant::now();
                if state.rate_limiter.enabled && !state.rate_limiter.try_admit(now) {
                    state.rate_limiter.queue.push_back(op);
                    let should_spawn = !state.rate_limiter.draining;
                    state.rate_limiter.draining = true;
                    Outcome::Queued { should_spawn }
                } else {
                    let effects = self.execute_locked(&mut state, op, now)?;
                    Outcome::Executed(effects)
                }
            }
        };
        match outcome {
            Outcome::Batched => Ok(()),
            Outcome::Queued { should_spawn } => {
                if should_spawn {
                    self.ensure_drain_task();
                }
                Ok(())
            }
            Outcome::Executed(effects) => self.flush_effects(effects).await,
        }
    }

    /// Locally applies `op`, records undo/rate-limit bookkeeping, and hands
    /// it to the FSM — all synchronously under the write lock, per spec.md
    /// §5's "handlers run to completion without suspension".
    fn execute_locked(
        &self,
        state: &mut SessionState,
        op: TextOperation,
        now: Instant,
    ) -> CoreResult<Vec<Effect>> {
        let pre_document = state.replica.clone();
        let new_document = op.apply(&state.replica)?;
        state.replica = new_document.clone();
        state.rate_limiter.record(now);

        if !state.suspend_undo && state.undo_config.enabled {
            push_undo_entry(state, op.clone(), pre_document, new_document, now);
        }

        let mut effects = Vec::new();
        {
            let mut bridge = Bridge {
                replica: &mut state.replica,
                rate_limiter: &mut state.rate_limiter,
                batch: &mut state.batch,
                change_tx: &self.change_tx,
                effects: &mut effects,
                remote_user: None,
            };
            state.fsm.apply_client(op.clone(), &mut bridge)?;
        }
        let _ = self.change_tx.send(ChangeEvent::Local { operation: op });
        Ok(effects)
    }

    async fn flush_effects(&self, effects: Vec<Effect>) -> CoreResult<()> {
        for effect in effects {
            match effect {
                Effect::SendOperation { revision, op } => {
                    {
                        let mut transport = self.transport.lock().await;
                        transport
                            .emit(
                                "operation",
                                vec![Value::from(revision), op.to_wire(), Value::Null],
                            )
                            .await?;
                    }
                    self.arm_operation_timeout().await;
                }
                Effect::RequestOperations { base, head } => {
                    let mut transport = self.transport.lock().await;
                    transport
                        .emit("get_operations", vec![Value::from(base), Value::from(head)])
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Bumps the send generation and, if `operation_timeout` is configured,
    /// spawns a watcher that fires `LifecycleEvent::OperationTimeout` if no
    /// ack resolves the outstanding operation before the deadline (spec.md
    /// §5, §7). The watcher never mutates state itself.
    async fn arm_operation_timeout(&self) {
        let Some(timeout) = self.config.operation_timeout else { return };
        let generation = {
            let mut state = self.state.write().await;
            state.op_send_generation += 1;
            state.op_send_generation
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let state = this.state.read().await;
            if state.op_send_generation == generation && !state.fsm.is_synchronized() {
                drop(state);
                let _ = this.lifecycle_tx.send(LifecycleEvent::OperationTimeout {
                    ms: timeout.as_millis() as u64,
                });
            }
        });
    }

    fn ensure_drain_task(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.drain_queue().await;
        });
    }

    /// Single-threaded cooperative drain: pop the queue head, wait for its
    /// admission time, re-validate its `baseLength` against the live
    /// document, and execute it. `submit` sets `draining` before spawning
    /// this task under the same lock it enqueues under, so at most one
    /// drain task is ever live for a given session.
    async fn drain_queue(&self) {
        loop {
            let wait_until = {
                let state = self.state.read().await;
                if state.rate_limiter.queue.is_empty() {
                    drop(state);
                    self.state.write().await.rate_limiter.draining = false;
                    return;
                }
                state.rate_limiter.next_admission_time(Instant::now())
            };
            let now = Instant::now();
            if wait_until > now {
                tokio::time::sleep(wait_until - now).await;
            }
            let outcome = {
                let mut state = self.state.write().await;
                match state.rate_limiter.queue.pop_front() {
                    None => {
                        state.rate_limiter.draining = false;
                        None
                    }
                    Some(op) => {
                        if op.base_length() != state.replica.len() {
                            log::warn!("dropping stale rate-limited operation");
                            Some(Ok(Vec::new()))
                        } else {
                            let now = Instant::now();
                            Some(self.execute_locked(&mut state, op, now))
                        }
                    }
                }
            };
            match outcome {
                None => return,
                Some(Ok(effects)) => {
                    if let Err(err) = self.flush_effects(effects).await {
                        log::error!("failed to flush rate-limited operation: {err}");
                    }
                }
                Some(Err(err)) => log::error!("failed to apply rate-limited operation: {err}"),
            }
        }
    }

    // -- inbound transport handling (spec.md §6) -------------------------------

    /// Drives the transport's event stream until it closes. Dispatches
    /// each named inbound event to its handler and flushes any effects
    /// produced (e.g. a `get_operations` request triggered by a stale ack).
    pub async fn run(&self) -> CoreResult<()> {
        loop {
            let event = {
                let mut transport = self.transport.lock().await;
                transport.next_event().await
            };
            match event {
                None => return Ok(()),
                Some(TransportEvent::Connected) => {}
                Some(TransportEvent::Disconnected { intentional }) => {
                    self.on_disconnected(intentional).await;
                }
                Some(TransportEvent::Message(msg)) => {
                    if let Err(err) = self.handle_message(&msg.event, &msg.args).await {
                        let _ = self.lifecycle_tx.send(LifecycleEvent::Error(err.to_string()));
                        let mut state = self.state.write().await;
                        state.ready = false;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, event: &str, args: &[Value]) -> CoreResult<()> {
        match event {
            "doc" => self.handle_doc(args).await,
            "ack" => self.handle_ack(args).await,
            "operation" => self.handle_remote_operation(args).await,
            "operations" => self.handle_operations_batch(args).await,
            "refresh" => self.handle_refresh(args).await,
            "online users" => self.handle_online_users(args).await,
            "user status" => self.handle_user_status(args).await,
            "client_left" => self.handle_client_left(args).await,
            "permission" => self.handle_permission(args).await,
            "delete" => self.handle_delete().await,
            "version" => self.handle_version(args).await,
            "info" => self.handle_info(args).await,
            _ => Ok(()),
        }
    }

    async fn handle_doc(&self, args: &[Value]) -> CoreResult<()> {
        let payload = args.first().cloned().unwrap_or(Value::Null);
        let text = payload.get("str").and_then(Value::as_str).unwrap_or("").to_string();
        let revision = payload.get("revision").and_then(Value::as_u64).unwrap_or(0);
        let mut state = self.state.write().await;
        state.replica = text;
        state.fsm = OtClient::new(revision);
        state.ready = true;
        drop(state);
        let _ = self.lifecycle_tx.send(LifecycleEvent::Ready);
        Ok(())
    }

    async fn handle_ack(&self, args: &[Value]) -> CoreResult<()> {
        let rev = args.first().and_then(Value::as_u64).unwrap_or(0);
        let effects = {
            let mut state = self.state.write().await;
            let mut effects = Vec::new();
            let mut bridge = Bridge {
                replica: &mut state.replica,
                rate_limiter: &mut state.rate_limiter,
                batch: &mut state.batch,
                change_tx: &self.change_tx,
                effects: &mut effects,
                remote_user: None,
            };
            state.fsm.server_ack(rev, &mut bridge)?;
            effects
        };
        self.flush_effects(effects).await
    }

    async fn handle_remote_operation(&self, args: &[Value]) -> CoreResult<()> {
        let user_id = args.first().and_then(Value::as_str).map(|s| s.to_string());
        let rev = args.get(1).and_then(Value::as_u64).unwrap_or(0);
        let op = args
            .get(2)
            .map(TextOperation::from_wire)
            .transpose()?
            .unwrap_or_default();
        let effects = {
            let mut state = self.state.write().await;
            let mut effects = Vec::new();
            let mut bridge = Bridge {
                replica: &mut state.replica,
                rate_limiter: &mut state.rate_limiter,
                batch: &mut state.batch,
                change_tx: &self.change_tx,
                effects: &mut effects,
                remote_user: user_id,
            };
            state.fsm.apply_server(rev, op, &mut bridge)?;
            effects
        };
        self.flush_effects(effects).await
    }

    async fn handle_operations_batch(&self, args: &[Value]) -> CoreResult<()> {
        let head = args.first().and_then(Value::as_u64).unwrap_or(0);
        let ops: Vec<TextOperation> = args
            .get(1)
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(|v| TextOperation::from_wire(v).ok()).collect())
            .unwrap_or_default();
        let effects = {
            let mut state = self.state.write().await;
            let mut effects = Vec::new();
            let mut bridge = Bridge {
                replica: &mut state.replica,
                rate_limiter: &mut state.rate_limiter,
                batch: &mut state.batch,
                change_tx: &self.change_tx,
                effects: &mut effects,
                remote_user: None,
            };
            state.fsm.apply_operations(head, ops, &mut bridge)?;
            effects
        };
        self.flush_effects(effects).await
    }

    async fn handle_refresh(&self, args: &[Value]) -> CoreResult<()> {
        let payload = args.first().cloned().unwrap_or(Value::Null);
        if let Ok(info) = serde_json::from_value::<NoteInfo>(payload) {
            self.state.write().await.note_info = info;
        }
        Ok(())
    }

    async fn handle_online_users(&self, args: &[Value]) -> CoreResult<()> {
        let payload = args.first().cloned().unwrap_or(Value::Null);
        let users: Vec<UserProfile> = payload
            .get("users")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let mut state = self.state.write().await;
        state.users = users.into_iter().map(|u| (u.id.clone(), u)).collect();
        Ok(())
    }

    async fn handle_user_status(&self, args: &[Value]) -> CoreResult<()> {
        let payload = args.first().cloned().unwrap_or(Value::Null);
        if let Ok(user) = serde_json::from_value::<UserProfile>(payload) {
            self.state.write().await.users.insert(user.id.clone(), user);
        }
        Ok(())
    }

    async fn handle_client_left(&self, args: &[Value]) -> CoreResult<()> {
        if let Some(client_id) = args.first().and_then(Value::as_str) {
            self.state.write().await.users.remove(client_id);
        }
        Ok(())
    }

    async fn handle_permission(&self, args: &[Value]) -> CoreResult<()> {
        let payload = args.first().cloned().unwrap_or(Value::Null);
        if let Some(permission) = payload
            .get("permission")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value::<Permission>(Value::String(s.to_string())).ok())
        {
            self.state.write().await.note_info.permission = permission;
        }
        Ok(())
    }

    async fn handle_version(&self, args: &[Value]) -> CoreResult<()> {
        let payload = args.first().cloned().unwrap_or(Value::Null);
        self.state.write().await.server_version = Some(payload);
        Ok(())
    }

    async fn handle_delete(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write().await;
            state.ready = false;
        }
        let _ = self.lifecycle_tx.send(LifecycleEvent::Deleted);
        self.on_disconnected(true).await;
        Ok(())
    }

    async fn handle_info(&self, args: &[Value]) -> CoreResult<()> {
        let payload = args.first().cloned().unwrap_or(Value::Null);
        if let Some(code) = payload.get("code").and_then(Value::as_u64) {
            if code == 403 || code == 404 {
                let _ = self
                    .lifecycle_tx
                    .send(LifecycleEvent::Error(format!("fatal info code {code}")));
                self.state.write().await.ready = false;
            }
        }
        Ok(())
    }

    // -- reconnection (spec.md §4.3.6) -----------------------------------------

    async fn on_disconnected(&self, intentional: bool) {
        let was_ready = {
            let mut state = self.state.write().await;
            let was_ready = state.ready;
            state.ready = false;
            was_ready
        };
        if intentional || !self.config.reconnect.enabled || !was_ready {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.reconnect_supervisor().await;
        });
    }

    async fn reconnect_supervisor(&self) {
        let mut attempt = 0u32;
        loop {
            if attempt >= self.config.reconnect.max_attempts {
                let _ = self.lifecycle_tx.send(LifecycleEvent::ReconnectFailed { attempts: attempt });
                return;
            }
            let delay = self.config.reconnect.delay_for_attempt(attempt);
            tokio::time::sleep(delay).await;
            let reconnected = {
                let mut transport = self.transport.lock().await;
                transport.reconnect().await.is_ok()
            };
            if reconnected {
                let effects = {
                    let mut state = self.state.write().await;
                    let mut effects = Vec::new();
                    let mut bridge = Bridge {
                        replica: &mut state.replica,
                        rate_limiter: &mut state.rate_limiter,
                        batch: &mut state.batch,
                        change_tx: &self.change_tx,
                        effects: &mut effects,
                        remote_user: None,
                    };
                    state.fsm.server_reconnect(&mut bridge);
                    effects
                };
                let _ = self.lifecycle_tx.send(LifecycleEvent::ReconnectReplaying);
                if self.flush_effects(effects).await.is_ok() {
                    return;
                }
            }
            attempt += 1;
            let _ = self
                .lifecycle_tx
                .send(LifecycleEvent::ReconnectAttemptFailed { attempt });
        }
    }
}

pub struct DocumentWithAuthorship {
    pub content: String,
    pub authors: HashMap<String, UserProfile>,
    pub spans: Vec<AuthorshipSpan>,
}

fn push_undo_entry(
    state: &mut SessionState,
    op: TextOperation,
    pre_document: String,
    post_document: String,
    now: Instant,
) {
    state.redo_stack.clear();
    let grouped = state
        .undo_stack
        .last()
        .map(|top| now.duration_since(top.timestamp) < state.undo_config.group_interval)
        .unwrap_or(false);
    if grouped {
        let top = state.undo_stack.last_mut().unwrap();
        if let Ok(composed) = top.operation.compose(&op) {
            top.operation = composed;
            top.post_document = post_document;
            top.timestamp = now;
            return;
        }
    }
    state.undo_stack.push(UndoEntry {
        operation: op,
        pre_document,
        post_document,
        timestamp: now,
    });
    if state.undo_stack.len() > state.undo_config.max_size {
        state.undo_stack.remove(0);
    }
}

/// Computes the minimal single replace between `old` and `new` by
/// trimming the common prefix and suffix (spec.md §4.3 `updateContent`).
/// Returns `None` if the strings are identical.
fn minimal_replace(old: &str, new: &str) -> Option<TextOperation> {
    if old == new {
        return None;
    }
    let old_bytes = old.as_bytes();
    let new_bytes = new.as_bytes();
    let mut prefix = 0;
    let max_prefix = old_bytes.len().min(new_bytes.len());
    while prefix < max_prefix && old_bytes[prefix] == new_bytes[prefix] {
        prefix += 1;
    }
    while prefix > 0 && (!old.is_char_boundary(prefix) || !new.is_char_boundary(prefix)) {
        prefix -= 1;
    }

    let mut suffix = 0;
    let max_suffix = max_prefix - prefix;
    while suffix < max_suffix
        && old_bytes[old_bytes.len() - 1 - suffix] == new_bytes[new_bytes.len() - 1 - suffix]
    {
        suffix += 1;
    }
    while suffix > 0
        && (!old.is_char_boundary(old.len() - suffix) || !new.is_char_boundary(new.len() - suffix))
    {
        suffix -= 1;
    }

    let old_mid_end = old.len() - suffix;
    let new_mid_end = new.len() - suffix;

    let mut op = TextOperation::new();
    op.retain(prefix);
    op.delete(old_mid_end - prefix);
    op.insert(&new[prefix..new_mid_end]);
    op.retain(suffix);
    Some(op)
}

/// Byte `(start, end)` of line `index` (end excludes the trailing `\n`).
fn line_bounds(document: &str, index: usize) -> Option<(usize, usize)> {
    let mut start = 0usize;
    for (i, line) in document.split('\n').enumerate() {
        let end = start + line.len();
        if i == index {
            return Some((start, end));
        }
        start = end + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundMessage;
    use tokio::sync::mpsc;

    struct FakeTransport {
        outbox: Vec<(String, Vec<Value>)>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn emit(&mut self, event: &str, args: Vec<Value>) -> CoreResult<()> {
            self.outbox.push((event.to_string(), args));
            Ok(())
        }
        async fn next_event(&mut self) -> Option<TransportEvent> {
            self.inbound.recv().await
        }
        async fn disconnect(&mut self, _intentional: bool) {}
        async fn reconnect(&mut self) -> CoreResult<()> {
            Ok(())
        }
    }

    fn make_session() -> (SessionClient, mpsc::UnboundedSender<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = FakeTransport {
            outbox: Vec::new(),
            inbound: rx,
        };
        let session = SessionClient::new(Box::new(transport), SessionConfig::default());
        (session, tx)
    }

    async fn make_ready_session() -> SessionClient {
        let (session, tx) = make_session();
        tx.send(TransportEvent::Message(InboundMessage {
            event: "doc".to_string(),
            args: vec![serde_json::json!({"str": "hello world", "revision": 0})],
        }))
        .unwrap();
        let doc_msg = { session.transport.lock().await.next_event().await.unwrap() };
        if let TransportEvent::Message(msg) = doc_msg {
            session.handle_message(&msg.event, &msg.args).await.unwrap();
        }
        session.state.write().await.note_info.permission = Permission::Freely;
        session
    }

    #[tokio::test]
    async fn insert_mutates_replica_before_ack() {
        let session = make_ready_session().await;
        session.insert(5, "X").await.unwrap();
        let (doc, _rev) = session.document_snapshot().await;
        assert_eq!(doc, "helloX world");
        assert!(!session.is_synchronized().await);
    }

    #[tokio::test]
    async fn permission_denied_without_login() {
        let session = make_ready_session().await;
        session.state.write().await.note_info.permission = Permission::Editable;
        let result = session.insert(0, "x").await;
        assert!(matches!(result, Err(CoreError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn update_content_emits_single_replace() {
        let session = make_ready_session().await;
        session.update_content("hello brave new world").await.unwrap();
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "hello brave new world");
    }

    #[tokio::test]
    async fn update_content_noop_when_unchanged() {
        let session = make_ready_session().await;
        session.update_content("hello world").await.unwrap();
        assert!(session.is_synchronized().await);
    }

    #[tokio::test]
    async fn batch_composes_edits_into_one_operation() {
        let session = make_ready_session().await;
        session
            .batch(|s| async move {
                s.insert(0, "A").await?;
                s.insert(1, "B").await?;
                Ok(())
            })
            .await
            .unwrap();
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "ABhello world");
    }

    #[tokio::test]
    async fn batch_cancels_on_error() {
        let session = make_ready_session().await;
        let result: CoreResult<()> = session
            .batch(|s| async move {
                s.insert(0, "A").await?;
                Err(CoreError::NotReady)
            })
            .await;
        assert!(result.is_err());
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "hello world");
    }

    #[tokio::test]
    async fn undo_redo_round_trip() {
        let session = make_ready_session().await;
        session.insert(0, "A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.state.write().await.undo_stack.last_mut().unwrap().timestamp =
            Instant::now() - Duration::from_secs(10);
        session.insert(0, "B").await.unwrap();
        let (doc_after_edits, _) = session.document_snapshot().await;
        assert_eq!(doc_after_edits, "BAhello world");

        session.undo().await.unwrap();
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "Ahello world");

        session.undo().await.unwrap();
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "hello world");

        session.redo().await.unwrap();
        session.redo().await.unwrap();
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "BAhello world");
    }

    #[tokio::test]
    async fn undo_grouping_composes_rapid_edits() {
        let session = make_ready_session().await;
        session.insert(0, "A").await.unwrap();
        session.insert(1, "B").await.unwrap();
        assert_eq!(session.state.read().await.undo_stack.len(), 1);
    }

    #[tokio::test]
    async fn line_helpers_roundtrip() {
        let session = make_ready_session().await;
        session.set_content("a\nb\nc").await.unwrap();
        assert_eq!(session.get_line(1).await, Some("b".to_string()));
        assert_eq!(session.get_lines().await, vec!["a", "b", "c"]);
        session.delete_line(1).await.unwrap();
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "a\nc");
    }

    #[tokio::test]
    async fn replace_regex_processes_right_to_left() {
        let session = make_ready_session().await;
        session.set_content("a1 b2 c3").await.unwrap();
        let pattern = Regex::new(r"\d").unwrap();
        session
            .replace_regex(&pattern, |caps| {
                let n: i32 = caps[0].parse().unwrap();
                (n + 10).to_string()
            })
            .await
            .unwrap();
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "a11 b12 c13");
    }

    #[tokio::test]
    async fn operation_timeout_fires_when_ack_never_arrives() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = FakeTransport { outbox: Vec::new(), inbound: rx };
        let mut config = SessionConfig::default();
        config.operation_timeout = Some(Duration::from_millis(20));
        let session = SessionClient::new(Box::new(transport), config);
        tx.send(TransportEvent::Message(InboundMessage {
            event: "doc".to_string(),
            args: vec![serde_json::json!({"str": "hello world", "revision": 0})],
        }))
        .unwrap();
        let doc_msg = { session.transport.lock().await.next_event().await.unwrap() };
        if let TransportEvent::Message(msg) = doc_msg {
            session.handle_message(&msg.event, &msg.args).await.unwrap();
        }
        session.state.write().await.note_info.permission = Permission::Freely;

        let mut lifecycle = session.subscribe_lifecycle();
        session.insert(0, "X").await.unwrap();

        let event = tokio::time::timeout(Duration::from_millis(500), lifecycle.recv())
            .await
            .expect("timeout watcher should fire")
            .unwrap();
        assert!(matches!(event, LifecycleEvent::OperationTimeout { .. }));
    }

    #[tokio::test]
    async fn operation_timeout_does_not_fire_once_acked() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = FakeTransport { outbox: Vec::new(), inbound: rx };
        let mut config = SessionConfig::default();
        config.operation_timeout = Some(Duration::from_millis(30));
        let session = SessionClient::new(Box::new(transport), config);
        tx.send(TransportEvent::Message(InboundMessage {
            event: "doc".to_string(),
            args: vec![serde_json::json!({"str": "hello world", "revision": 0})],
        }))
        .unwrap();
        let doc_msg = { session.transport.lock().await.next_event().await.unwrap() };
        if let TransportEvent::Message(msg) = doc_msg {
            session.handle_message(&msg.event, &msg.args).await.unwrap();
        }
        session.state.write().await.note_info.permission = Permission::Freely;

        let mut lifecycle = session.subscribe_lifecycle();
        session.insert(0, "X").await.unwrap();
        session.handle_message("ack", &[Value::from(1)]).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), lifecycle.recv()).await;
        assert!(result.is_err(), "no timeout event should fire once synchronized");
    }

    #[tokio::test]
    async fn rate_limited_burst_preserves_submission_order() {
        let (session, tx) = make_session();
        tx.send(TransportEvent::Message(InboundMessage {
            event: "doc".to_string(),
            args: vec![serde_json::json!({"str": "", "revision": 0})],
        }))
        .unwrap();
        let doc_msg = { session.transport.lock().await.next_event().await.unwrap() };
        if let TransportEvent::Message(msg) = doc_msg {
            session.handle_message(&msg.event, &msg.args).await.unwrap();
        }
        session.state.write().await.note_info.permission = Permission::Freely;
        {
            let mut state = session.state.write().await;
            state.rate_limiter.enabled = true;
            state.rate_limiter.min_interval = Duration::from_millis(5);
            state.rate_limiter.max_burst = 1;
            state.rate_limiter.burst_window = Duration::from_millis(100);
        }
        session.insert(0, "A").await.unwrap();
        session.insert(1, "B").await.unwrap();
        session.insert(2, "C").await.unwrap();
        session.insert(3, "D").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (doc, _) = session.document_snapshot().await;
        assert_eq!(doc, "ABCD");
    }
}
