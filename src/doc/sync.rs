//! Editor synchronization state machine.
//!
//! [`EditorSync`] is the per-editor controller tying everything together:
//! it installs the document into the editor, then alternates between
//! waiting for server changes (long-polled `body_getChangeAfter`) and
//! collecting local edits into `body_update` submissions, rebasing
//! concurrent work with the delta algebra on merge. Transient failures are
//! retried with a bounded error budget; blowing the budget parks the
//! machine in a restartable detached state.
//!
//! Every transition goes through one cooperative event queue: handlers run
//! to completion, and events posted while one runs are processed after it
//! returns. The two long waits (the editor's event chain and the server
//! poll) are spawned tasks guarded by booleans, so at most one of each is
//! ever in flight.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use calliope_client_api_proto::{Change, Delta, RevNum, Snapshot};
use futures::{
    channel::mpsc, future, future::LocalBoxFuture, StreamExt as _,
};
use medea_reactive::{DroppedError, ObservableCell};
use tokio::time::Instant;
use tracerr::Traced;

use crate::{
    doc::{
        caret::CaretTracker,
        session::{DocSession, SessionError},
    },
    editor::{ClientEvent, Editor, EventPayload, Range, Source},
    platform,
    rpc::SessionProxy,
};

/// How long local edits accumulate before being pushed to the server.
const PUSH_DELAY: Duration = Duration::from_millis(1000);

/// Minimum spacing between applying one server change and asking for the
/// next one.
const PULL_DELAY: Duration = Duration::from_millis(1000);

/// Re-poll delay after a benign `timedOut` of the server wait.
const POLLING_DELAY: Duration = Duration::from_millis(1000);

/// Re-check spacing while a stop waits for an in-flight operation.
const STOP_POLL_DELAY: Duration = Duration::from_millis(250);

/// Restart delay after the first failure within an error window.
const RESTART_DELAY_FIRST: Duration = Duration::from_millis(1000);

/// Restart delay for subsequent failures within an error window.
const RESTART_DELAY_REPEAT: Duration = Duration::from_millis(5000);

/// States of the synchronization machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SyncState {
    /// Not attached to a session.
    Detached,

    /// Entering the editable state.
    BecomeEnabled,

    /// Leaving the editable state.
    BecomeDisabled,

    /// Awaiting either a local edit or a server change.
    Idle,

    /// Local edits are accumulating before being sent.
    Collecting,

    /// A `body_update` is in flight.
    Merging,

    /// Transient error; a delayed restart is pending.
    ErrorWait,

    /// Too many failures in the rolling window.
    UnrecoverableError,
}

/// Events of the synchronization machine.
enum SyncEvent {
    /// Attach and start synchronizing.
    Start,

    /// Detach, letting in-flight writes finish first.
    Stop,

    /// A server call failed.
    ApiError {
        /// Method that failed.
        method: &'static str,

        /// The failure itself.
        error: Rc<Traced<SessionError>>,
    },

    /// The server wait produced a change.
    GotChangeAfter {
        /// Revision the wait was issued against.
        base_rev: RevNum,

        /// The server's change.
        change: Change,
    },

    /// The in-flight `body_update` came back.
    GotUpdate {
        /// Delta that was submitted.
        delta: Delta,

        /// The server's corrected change.
        corrected: Change,
    },

    /// The editor emitted past the consumed position.
    GotEditorEvent {
        /// Revision current when the wait was armed.
        base_rev: RevNum,
    },

    /// (Re-)arm the idle waits.
    WantInput,

    /// [`SyncEvent::WantInput`], delayed.
    WantInputAfterDelay {
        /// The delay.
        delay: Duration,
    },

    /// Push the collected local edits.
    WantToUpdate {
        /// Revision the edits were made against.
        base_rev: RevNum,
    },

    /// Something neither the server nor the editor should ever cause.
    Failure {
        /// Description for the log.
        message: String,
    },
}

impl SyncEvent {
    /// Short name for log lines.
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ApiError { .. } => "apiError",
            Self::GotChangeAfter { .. } => "gotChangeAfter",
            Self::GotUpdate { .. } => "gotUpdate",
            Self::GotEditorEvent { .. } => "gotEditorEvent",
            Self::WantInput => "wantInput",
            Self::WantInputAfterDelay { .. } => "wantInputAfterDelay",
            Self::WantToUpdate { .. } => "wantToUpdate",
            Self::Failure { .. } => "failure",
        }
    }
}

/// Rolling window of failure timestamps deciding when retrying stops being
/// worth it.
struct ErrorWindow {
    stamps: Vec<Instant>,
}

impl ErrorWindow {
    /// Length of the rolling window.
    const WINDOW: Duration = Duration::from_secs(180);

    /// Failure rate at which the machine gives up, per minute.
    const MAX_PER_MINUTE: f64 = 3.0;

    /// Minimum time the window must span before giving up is allowed.
    const MIN_TIME: Duration = Duration::from_secs(45);

    fn new() -> Self {
        Self { stamps: Vec::new() }
    }

    /// Records a failure at `now` and expires stamps older than the window.
    fn note(&mut self, now: Instant) {
        self.stamps.push(now);
        self.stamps
            .retain(|stamp| now.duration_since(*stamp) <= Self::WINDOW);
    }

    /// Number of failures currently inside the window.
    fn count(&self) -> usize {
        self.stamps.len()
    }

    /// Decides whether the failure rate is past saving: at least two
    /// failures, spanning at least [`ErrorWindow::MIN_TIME`], at a rate of
    /// [`ErrorWindow::MAX_PER_MINUTE`] or above.
    fn is_unrecoverable(&self, now: Instant) -> bool {
        if self.stamps.len() < 2 {
            return false;
        }
        let span = match self.stamps.first() {
            Some(first) => now.duration_since(*first),
            None => return false,
        };
        if span < Self::MIN_TIME {
            return false;
        }
        let per_minute =
            self.stamps.len() as f64 * 60.0 / span.as_secs_f64();
        per_minute >= Self::MAX_PER_MINUTE
    }

    fn clear(&mut self) {
        self.stamps.clear();
    }
}

/// Per-editor synchronization controller.
///
/// Attach with [`EditorSync::start`], detach with [`EditorSync::stop`].
/// The machine publishes whether the editor should currently be editable
/// through [`EditorSync::should_be_enabled`] and its `when_*` companions;
/// when constructed with `manages_editor`, it also drives the editor's
/// enabled state directly.
pub struct EditorSync {
    /// The editor being synchronized.
    editor: Rc<dyn Editor>,

    /// Session supplying the server side.
    session: Rc<DocSession>,

    /// Caret position pusher fed from selection events.
    caret: CaretTracker,

    /// Queue feeding the dispatch pump.
    tx: mpsc::UnboundedSender<SyncEvent>,

    /// Current machine state.
    state: Cell<SyncState>,

    /// Whether the machine is attached and synchronizing.
    running: Cell<bool>,

    /// Whether this instance drives the editor's enabled state itself.
    manages_editor: bool,

    /// Document state the server has confirmed.
    snapshot: RefCell<Option<Snapshot>>,

    /// Session proxy of the current attachment.
    session_proxy: RefCell<Option<SessionProxy>>,

    /// Last consumed editor event; everything after it is pending input.
    current_event: RefCell<Option<ClientEvent>>,

    /// Guard: a `body_getChangeAfter` wait is in flight.
    pending_change_after: Cell<bool>,

    /// Guard: an editor-chain wait is in flight.
    pending_editor_wait: Cell<bool>,

    /// Failure budget of the current attachment.
    errors: RefCell<ErrorWindow>,

    /// The published editable-state condition.
    should_be_enabled: ObservableCell<bool>,
}

impl EditorSync {
    /// Creates a new [`EditorSync`] driving `editor` against `session`.
    ///
    /// With `manages_editor` set, the machine enables/disables (and
    /// focuses) the editor itself; otherwise it only publishes the
    /// condition for the embedding to act on.
    #[must_use]
    pub fn new(
        editor: Rc<dyn Editor>,
        session: Rc<DocSession>,
        manages_editor: bool,
    ) -> Rc<Self> {
        let (tx, rx) = mpsc::unbounded();
        let this = Rc::new(Self {
            editor,
            caret: CaretTracker::new(Rc::clone(&session)),
            session,
            tx,
            state: Cell::new(SyncState::Detached),
            running: Cell::new(false),
            manages_editor,
            snapshot: RefCell::new(None),
            session_proxy: RefCell::new(None),
            current_event: RefCell::new(None),
            pending_change_after: Cell::new(false),
            pending_editor_wait: Cell::new(false),
            errors: RefCell::new(ErrorWindow::new()),
            should_be_enabled: ObservableCell::new(false),
        });
        this.spawn_pump(rx);
        this
    }

    /// Requests the machine to attach and start synchronizing.
    pub fn start(&self) {
        self.post(SyncEvent::Start);
    }

    /// Requests the machine to detach. In-flight writes are not discarded:
    /// the machine lingers until they complete.
    pub fn stop(&self) {
        self.post(SyncEvent::Stop);
    }

    /// Current value of the editable-state condition.
    #[must_use]
    pub fn should_be_enabled(&self) -> bool {
        self.should_be_enabled.get()
    }

    /// Resolves once the editor should be editable.
    pub fn when_should_be_enabled(
        &self,
    ) -> LocalBoxFuture<'static, Result<(), DroppedError>> {
        self.should_be_enabled.when_eq(true)
    }

    /// Resolves once the editor should be read-only.
    pub fn when_should_be_disabled(
        &self,
    ) -> LocalBoxFuture<'static, Result<(), DroppedError>> {
        self.should_be_enabled.when_eq(false)
    }

    /// Spawns the pump consuming the event queue.
    fn spawn_pump(self: &Rc<Self>, mut rx: mpsc::UnboundedReceiver<SyncEvent>) {
        let weak_this = Rc::downgrade(self);
        platform::spawn(async move {
            while let Some(event) = rx.next().await {
                match weak_this.upgrade() {
                    Some(this) => this.dispatch(event).await,
                    None => break,
                }
            }
        });
    }

    /// Posts an event onto the queue.
    fn post(&self, event: SyncEvent) {
        drop(self.tx.unbounded_send(event));
    }

    /// Dispatches one event against the current state.
    async fn dispatch(self: Rc<Self>, event: SyncEvent) {
        use SyncEvent as E;
        use SyncState as S;

        let state = self.state.get();
        log::debug!("sync: {} in {:?}", event.name(), state);

        match (state, event) {
            (S::Detached | S::ErrorWait, E::Start) => {
                self.handle_start().await;
            }
            (_, E::Stop) => self.handle_stop(),
            (_, E::ApiError { method, error }) => {
                self.handle_api_error(method, &error);
            }
            (S::Idle, E::WantInput) => self.handle_want_input(),
            (S::Idle, E::WantInputAfterDelay { delay }) => {
                self.handle_want_input_after_delay(delay);
            }
            (S::Idle, E::GotChangeAfter { base_rev, change }) => {
                self.handle_got_change_after(base_rev, &change);
            }
            (S::Idle, E::GotEditorEvent { base_rev }) => {
                self.handle_got_editor_event(base_rev);
            }
            (S::Collecting, E::WantToUpdate { base_rev }) => {
                self.handle_want_to_update(base_rev);
            }
            (S::Merging, E::GotUpdate { delta, corrected }) => {
                self.handle_got_update(delta, corrected);
            }
            (_, E::Failure { message }) => {
                log::error!("sync: internal failure: {}", message);
                self.handle_stop();
            }
            (state, event) => {
                log::debug!(
                    "sync: discarding {} in {:?}",
                    event.name(),
                    state,
                );
            }
        }
    }

    /// `start` from a startable state: acquires the session, installs the
    /// snapshot into the editor and enters the polling loop.
    async fn handle_start(self: &Rc<Self>) {
        self.running.set(true);

        let proxy = match self.session.get_session_proxy().await {
            Ok(proxy) => proxy,
            Err(e) => {
                self.post_session_error("getSessionProxy", e);
                return;
            }
        };

        let fetched = future::try_join(
            proxy.get_log_info(),
            proxy.body_get_snapshot(),
        )
        .await
        .map_err(tracerr::map_from_and_wrap!(=> SessionError));
        let (log_info, snapshot) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                self.post_session_error("body_getSnapshot", e);
                return;
            }
        };
        log::debug!(
            "sync: attached at rev {} (log info: {})",
            snapshot.rev_num,
            log_info,
        );

        // Install, preserving any selection, and make sure the user cannot
        // undo past the load.
        let selection = self.editor.selection();
        self.editor
            .set_contents(snapshot.contents.clone(), Source::DocClient);
        if let Some(range) = selection {
            self.editor.set_selection(range);
        }
        self.editor.history_clear();

        // The install above is expected to echo back as our own change;
        // anything else (e.g. an empty document producing no echo) is fine
        // to adopt as the consumption base too.
        let current = self.editor.current_event();
        match current.payload() {
            EventPayload::TextChange {
                source: Source::DocClient,
                ..
            } => (),
            _ => log::debug!("sync: editor reported a foreign install event"),
        }

        *self.current_event.borrow_mut() = Some(current);
        *self.snapshot.borrow_mut() = Some(snapshot);
        *self.session_proxy.borrow_mut() = Some(proxy);

        self.become_enabled();
        self.state.set(SyncState::Idle);
        self.post(SyncEvent::WantInput);
    }

    /// `stop`: detaches immediately from restful states; from `Collecting`
    /// and `Merging` it disables the editor and re-posts itself until the
    /// in-flight operation has completed naturally.
    fn handle_stop(self: &Rc<Self>) {
        match self.state.get() {
            SyncState::Collecting | SyncState::Merging => {
                let state = self.state.get();
                self.become_disabled();
                self.state.set(state);

                let weak_this = Rc::downgrade(self);
                platform::spawn(async move {
                    platform::delay_for(STOP_POLL_DELAY).await;
                    if let Some(this) = weak_this.upgrade() {
                        this.post(SyncEvent::Stop);
                    }
                });
            }
            SyncState::Detached => (),
            _ => {
                self.running.set(false);
                self.become_disabled();
                self.state.set(SyncState::Detached);
            }
        }
    }

    /// `wantInput` in `Idle`: arms the editor wait and the server wait,
    /// each at most once.
    fn handle_want_input(self: &Rc<Self>) {
        if !self.running.get() {
            return;
        }
        let base_rev = match &*self.snapshot.borrow() {
            Some(snapshot) => snapshot.rev_num,
            None => return,
        };

        if !self.pending_editor_wait.get() {
            if let Some(current) = self.current_event.borrow().clone() {
                self.pending_editor_wait.set(true);
                let weak_this = Rc::downgrade(self);
                platform::spawn(async move {
                    let result = current.next().await;
                    if let Some(this) = weak_this.upgrade() {
                        this.pending_editor_wait.set(false);
                        match result {
                            Ok(_) => this
                                .post(SyncEvent::GotEditorEvent { base_rev }),
                            Err(e) => this.post(SyncEvent::Failure {
                                message: e.to_string(),
                            }),
                        }
                    }
                });
            }
        }

        if !self.pending_change_after.get() {
            if let Some(proxy) = self.session_proxy.borrow().clone() {
                self.pending_change_after.set(true);
                let weak_this = Rc::downgrade(self);
                platform::spawn(async move {
                    let result = proxy.body_get_change_after(base_rev).await;
                    let this = match weak_this.upgrade() {
                        Some(this) => this,
                        None => return,
                    };
                    this.pending_change_after.set(false);
                    match result {
                        Ok(change) => this.post(SyncEvent::GotChangeAfter {
                            base_rev,
                            change,
                        }),
                        Err(e) if e.as_ref().is_timed_out() => {
                            this.post(SyncEvent::WantInputAfterDelay {
                                delay: POLLING_DELAY,
                            });
                        }
                        Err(e) => this.post_call_error(
                            "body_getChangeAfter",
                            e,
                        ),
                    }
                });
            }
        }
    }

    /// Delayed re-entry into `wantInput`.
    fn handle_want_input_after_delay(self: &Rc<Self>, delay: Duration) {
        let weak_this = Rc::downgrade(self);
        platform::spawn(async move {
            platform::delay_for(delay).await;
            if let Some(this) = weak_this.upgrade() {
                this.post(SyncEvent::WantInput);
            }
        });
    }

    /// `gotChangeAfter` in `Idle`: folds a server change into the snapshot
    /// and the editor, unless local work got there first.
    fn handle_got_change_after(&self, base_rev: RevNum, change: &Change) {
        if !self.running.get() {
            return;
        }
        let snapshot = match &*self.snapshot.borrow() {
            Some(snapshot) => snapshot.clone(),
            None => return,
        };
        if snapshot.rev_num != base_rev {
            // The snapshot moved while the change was in flight; drop it
            // and ask again from the fresher revision.
            log::debug!(
                "sync: dropping stale change for rev {} at rev {}",
                base_rev,
                snapshot.rev_num,
            );
            self.post(SyncEvent::WantInput);
            return;
        }
        if self.has_pending_text_change() {
            // The user's pending edits take precedence; the server change
            // will come back as a correction of their submission. The
            // queued editor event re-arms the polling on its own.
            return;
        }

        *self.snapshot.borrow_mut() = Some(snapshot.apply(change));

        // Bracket with cutoffs so the remote change cannot amalgamate into
        // the user's undo stack.
        self.editor.history_cutoff();
        self.editor
            .update_contents(change.delta.clone(), Source::DocClient);
        self.editor.history_cutoff();

        self.post(SyncEvent::WantInputAfterDelay {
            delay: POLLING_DELAY.max(PULL_DELAY),
        });
    }

    /// `gotEditorEvent` in `Idle`: classifies the next pending editor event.
    fn handle_got_editor_event(self: &Rc<Self>, base_rev: RevNum) {
        if !self.running.get() {
            return;
        }
        let current = match self.current_event.borrow().clone() {
            Some(current) => current,
            None => return,
        };
        let next = match current.next_now() {
            Some(next) => next,
            None => {
                // Wait resolved but the chain moved on oddly; re-arm.
                self.post(SyncEvent::WantInput);
                return;
            }
        };

        enum Pending {
            OwnEcho,
            UserText,
            Selection(Option<Range>),
        }
        let pending = match next.payload() {
            EventPayload::TextChange {
                source: Source::DocClient,
                ..
            } => Pending::OwnEcho,
            EventPayload::TextChange { .. } => Pending::UserText,
            EventPayload::SelectionChange { range, .. } => {
                Pending::Selection(*range)
            }
        };

        match pending {
            Pending::OwnEcho => {
                // Our own update reflected back; skip it.
                *self.current_event.borrow_mut() = Some(next);
                self.post(SyncEvent::WantInput);
            }
            Pending::UserText => {
                self.state.set(SyncState::Collecting);
                let weak_this = Rc::downgrade(self);
                platform::spawn(async move {
                    platform::delay_for(PUSH_DELAY).await;
                    if let Some(this) = weak_this.upgrade() {
                        this.post(SyncEvent::WantToUpdate { base_rev });
                    }
                });
            }
            Pending::Selection(range) => {
                if let Some(range) = range {
                    self.caret.update(base_rev, range);
                }
                *self.current_event.borrow_mut() = Some(next);
                self.post(SyncEvent::WantInput);
            }
        }
    }

    /// `wantToUpdate` in `Collecting`: composes the accumulated local edits
    /// and submits them against the captured base revision.
    fn handle_want_to_update(self: &Rc<Self>, base_rev: RevNum) {
        let delta = self.consume_local_changes();
        if delta.is_empty() {
            self.state.set(SyncState::Idle);
            self.post(SyncEvent::WantInput);
            return;
        }

        let proxy = match self.session_proxy.borrow().clone() {
            Some(proxy) => proxy,
            None => return,
        };
        self.state.set(SyncState::Merging);

        let weak_this = Rc::downgrade(self);
        platform::spawn(async move {
            let result = proxy.body_update(base_rev, &delta).await;
            if let Some(this) = weak_this.upgrade() {
                match result {
                    Ok(corrected) => {
                        this.post(SyncEvent::GotUpdate { delta, corrected });
                    }
                    Err(e) => this.post_call_error("body_update", e),
                }
            }
        });
    }

    /// `gotUpdate` in `Merging`: reconciles the server's corrected change
    /// with whatever the user typed during the round trip.
    fn handle_got_update(&self, delta: Delta, corrected: Change) {
        let snapshot = match &*self.snapshot.borrow() {
            Some(snapshot) => snapshot.clone(),
            None => return,
        };
        let Change {
            rev_num: v_result,
            delta: d_correction,
        } = corrected;

        if d_correction.is_empty() {
            // No interleaving: the editor already equals the new snapshot.
            *self.snapshot.borrow_mut() = Some(snapshot.apply(&Change {
                rev_num: v_result,
                delta,
            }));
            self.state.set(SyncState::Idle);
            self.post(SyncEvent::WantInput);
            return;
        }

        let corrected_delta = delta.compose(&d_correction);
        let d_more = self.consume_local_changes();

        *self.snapshot.borrow_mut() = Some(snapshot.apply(&Change {
            rev_num: v_result,
            delta: corrected_delta,
        }));

        if d_more.is_empty() {
            self.editor
                .update_contents(d_correction, Source::DocClient);
        } else {
            // The editor sits at base ∘ d_more; rebase the correction over
            // the user's concurrent edits before applying it.
            let d_integrated = d_more.transform(&d_correction, false);
            self.editor
                .update_contents(d_integrated, Source::DocClient);

            // And re-express those edits against the server state, splicing
            // them in as if the user had just typed them.
            let d_new_more = d_correction.transform(&d_more, true);
            let current = self.current_event.borrow().clone();
            if let Some(current) = current {
                let spliced =
                    current.with_synthesized_next(EventPayload::TextChange {
                        delta: d_new_more,
                        old_contents: Delta::new(),
                        source: Source::User,
                    });
                *self.current_event.borrow_mut() = Some(spliced);
            }
        }

        self.state.set(SyncState::Idle);
        self.post(SyncEvent::WantInput);
    }

    /// `apiError` in any state: informational for connection blips, an
    /// error otherwise; retries with a delay until the rolling window says
    /// the situation is past saving.
    fn handle_api_error(
        self: &Rc<Self>,
        method: &'static str,
        error: &Rc<Traced<SessionError>>,
    ) {
        if AsRef::<SessionError>::as_ref(error.as_ref()).is_connection() {
            log::info!("sync: {} failed on connection trouble: {}", method, error);
        } else {
            log::error!("sync: {} failed: {}", method, error);
        }

        let now = Instant::now();
        let (escalate, count) = {
            let mut errors = self.errors.borrow_mut();
            errors.note(now);
            (errors.is_unrecoverable(now), errors.count())
        };

        if escalate {
            log::error!("sync: too many failures, detaching until restarted");
            self.errors.borrow_mut().clear();
            self.session.report_error(Rc::clone(error));
            self.become_disabled();
            self.state.set(SyncState::UnrecoverableError);
            self.running.set(false);
            self.state.set(SyncState::Detached);
        } else {
            let delay = if count <= 1 {
                RESTART_DELAY_FIRST
            } else {
                RESTART_DELAY_REPEAT
            };
            self.become_disabled();
            self.state.set(SyncState::ErrorWait);
            let weak_this = Rc::downgrade(self);
            platform::spawn(async move {
                platform::delay_for(delay).await;
                if let Some(this) = weak_this.upgrade() {
                    this.post(SyncEvent::Start);
                }
            });
        }
    }

    /// Passes through [`SyncState::BecomeEnabled`], publishing the enabled
    /// condition and, when managing the editor, enabling and focusing it.
    fn become_enabled(&self) {
        self.state.set(SyncState::BecomeEnabled);
        self.should_be_enabled.set(true);
        if self.manages_editor {
            self.editor.enable();
            self.editor.focus();
        }
    }

    /// Passes through [`SyncState::BecomeDisabled`], the counterpart of
    /// [`EditorSync::become_enabled`].
    fn become_disabled(&self) {
        self.state.set(SyncState::BecomeDisabled);
        self.should_be_enabled.set(false);
        if self.manages_editor {
            self.editor.disable();
        }
    }

    /// Indicates whether any not-yet-consumed `textChange` is pending on
    /// the editor's chain.
    fn has_pending_text_change(&self) -> bool {
        let mut node = match self.current_event.borrow().clone() {
            Some(node) => node,
            None => return false,
        };
        while let Some(next) = node.next_now() {
            if matches!(next.payload(), EventPayload::TextChange { .. }) {
                return true;
            }
            node = next;
        }
        false
    }

    /// Consumes pending editor events up to (and not including) the next
    /// echo of our own updates, composing the user's text changes into one
    /// delta and forwarding selection moves to the caret tracker.
    fn consume_local_changes(&self) -> Delta {
        let mut current = match self.current_event.borrow().clone() {
            Some(current) => current,
            None => return Delta::new(),
        };
        let mut composed = Delta::new();

        while let Some(next) = current.next_now() {
            match next.payload() {
                EventPayload::TextChange {
                    source: Source::DocClient,
                    ..
                } => break,
                EventPayload::TextChange { delta, .. } => {
                    composed = composed.compose(delta);
                }
                EventPayload::SelectionChange { range, .. } => {
                    if let (Some(range), Some(snapshot)) =
                        (*range, &*self.snapshot.borrow())
                    {
                        self.caret.update(snapshot.rev_num, range);
                    }
                }
            }
            current = next;
        }

        *self.current_event.borrow_mut() = Some(current);
        composed
    }

    /// Posts an `apiError` for a failed session resolution.
    fn post_session_error(
        &self,
        method: &'static str,
        error: Traced<SessionError>,
    ) {
        self.post(SyncEvent::ApiError {
            method,
            error: Rc::new(error),
        });
    }

    /// Posts an `apiError` for a failed server call.
    fn post_call_error(
        &self,
        method: &'static str,
        error: Traced<crate::rpc::CallError>,
    ) {
        let wrap = tracerr::map_from_and_wrap!(=> SessionError);
        self.post_session_error(method, wrap(error));
    }
}
