//! Cross-thread confirmation requests.
//!
//! Any thread can queue a [`PopupRequest`] on the [`PopupQueue`]; the UI
//! thread renders the head of the queue once per tick. A request is a two
//! state machine (pending, closed): once its render step reports `closed`,
//! it never renders again and every later poll answers
//! [`RenderOutcome::CLOSED`]. The requester learns the result through the
//! callback it supplied at push time, invoked on the UI thread when the
//! request closes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{distributions::Alphanumeric, Rng};

/// Result of one render step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderOutcome {
    /// The dialog is on screen.
    pub opened: bool,
    /// The user resolved the dialog this tick.
    pub closed: bool,
}

impl RenderOutcome {
    /// What a resolved request reports forever after.
    pub const CLOSED: RenderOutcome = RenderOutcome {
        opened: false,
        closed: true,
    };

    pub const OPEN: RenderOutcome = RenderOutcome {
        opened: true,
        closed: false,
    };
}

/// UI render step; receives the request's correlation id.
pub type RenderFn = Box<dyn FnMut(&str) -> RenderOutcome + Send>;

/// Resolution callback; receives the correlation id.
pub type ResolveFn = Box<dyn FnOnce(&str) + Send>;

struct PopupState {
    open: bool,
    render: Option<RenderFn>,
    on_close: Option<ResolveFn>,
}

pub struct PopupRequest {
    id: String,
    key: Option<String>,
    // Read by the queue under its own lock, so it lives outside `state`.
    shown: AtomicBool,
    state: Mutex<PopupState>,
}

impl PopupRequest {
    /// New pending request with a fresh correlation id.
    ///
    /// Arguments the dialog needs are captured by `render`.
    pub fn new<F>(render: F) -> Self
    where
        F: FnMut(&str) -> RenderOutcome + Send + 'static,
    {
        Self {
            id: correlation_id(),
            key: None,
            shown: AtomicBool::new(false),
            state: Mutex::new(PopupState {
                open: true,
                render: Some(Box::new(render)),
                on_close: None,
            }),
        }
    }

    /// Callback run on the UI thread when the request closes.
    pub fn on_close<F>(self, callback: F) -> Self
    where
        F: FnOnce(&str) + Send + 'static,
    {
        self.lock().on_close = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Run the render step once.
    ///
    /// Only the UI thread may poll an open request. Polling a closed request
    /// is safe from any thread and short-circuits without rendering. The
    /// render step runs with no lock held, so it may touch this request or
    /// the queue freely; polling the request again from inside its own
    /// render step reports nothing rendered.
    pub fn poll(&self) -> RenderOutcome {
        let mut render = {
            let mut state = self.lock();
            if !state.open {
                return RenderOutcome::CLOSED;
            }
            match state.render.take() {
                Some(render) => render,
                None => return RenderOutcome::default(),
            }
        };

        // Rendering puts the request on screen.
        self.shown.store(true, Ordering::Release);
        let outcome = render(&self.id);

        let callback = {
            let mut state = self.lock();
            if !outcome.closed {
                state.render = Some(render);
                return outcome;
            }
            state.open = false;
            state.on_close.take()
        };
        drop(render);
        log::debug!("popup {} closed", self.id);
        if let Some(callback) = callback {
            callback(&self.id);
        }
        outcome
    }

    fn was_shown(&self) -> bool {
        self.shown.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PopupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PopupRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopupRequest")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("open", &self.is_open())
            .finish()
    }
}

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

/// `<counter>_<nanos>_<random>`: unique for the life of the process.
fn correlation_id() -> String {
    let n = NEXT_REQUEST.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let salt: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{n}_{nanos}_{salt}")
}

/// Process-wide queue of pending requests.
///
/// Pushes are non-blocking from any thread. [`PopupQueue::tick`] belongs to
/// the UI thread: the first thread to tick is recorded as the UI thread.
#[derive(Default)]
pub struct PopupQueue {
    pending: Mutex<VecDeque<Arc<PopupRequest>>>,
    ui_thread: OnceLock<ThreadId>,
}

impl PopupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request. The returned handle may be kept and polled later.
    pub fn push(&self, request: PopupRequest) -> Arc<PopupRequest> {
        let request = Arc::new(request);
        self.lock().push_back(Arc::clone(&request));
        request
    }

    /// Insert a request ahead of everything not yet on screen.
    pub fn push_front(&self, request: PopupRequest) -> Arc<PopupRequest> {
        let request = Arc::new(request);
        let mut pending = self.lock();
        let at = match pending.front() {
            Some(head) if head.was_shown() => 1,
            _ => 0,
        };
        pending.insert(at, Arc::clone(&request));
        request
    }

    /// Append a request tagged with `key`, first dropping queued requests
    /// with the same key that have not been shown yet.
    pub fn push_keyed(&self, key: impl Into<String>, mut request: PopupRequest) -> Arc<PopupRequest> {
        let key = key.into();
        request.key = Some(key.clone());
        let request = Arc::new(request);
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|queued| queued.key() != Some(key.as_str()) || queued.was_shown());
        if pending.len() < before {
            log::debug!("replaced {} queued popup(s) keyed {}", before - pending.len(), key);
        }
        pending.push_back(Arc::clone(&request));
        request
    }

    /// Render the head of the queue once, popping it if it closed.
    ///
    /// Returns `None` when the queue is empty. The queue lock is not held
    /// while rendering, so render steps and callbacks may push new requests.
    pub fn tick(&self) -> Option<RenderOutcome> {
        let current = thread::current().id();
        let ui_thread = *self.ui_thread.get_or_init(|| current);
        debug_assert_eq!(ui_thread, current, "popup queue ticked off the UI thread");

        let head = self.lock().front().cloned()?;
        let outcome = head.poll();
        if outcome.closed {
            self.lock().retain(|queued| !Arc::ptr_eq(queued, &head));
        }
        Some(outcome)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every pending request without rendering or resolving it.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<PopupRequest>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
