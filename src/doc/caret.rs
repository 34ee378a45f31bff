//! Coalescing pusher of the local caret position.
//!
//! Selection moves arrive far faster than they are worth transmitting, so
//! the tracker keeps only the latest `(revision, index, length)` and a
//! single worker drains it at a bounded rate. The worker re-resolves the
//! session proxy per outer round to tolerate reconnects, and retires
//! itself after sitting idle for a while; the next update re-arms it.

use std::{cell::RefCell, rc::Rc, time::Duration};

use calliope_client_api_proto::RevNum;
use futures::future;

use crate::{doc::session::DocSession, editor::Range, platform};

/// Minimum spacing between two caret transmissions.
const UPDATE_DELAY: Duration = Duration::from_millis(250);

/// Idle time after which the worker retires.
const MAX_IDLE_TIME: Duration = Duration::from_secs(60);

/// Idle delay ticks the worker waits through before retiring.
const MAX_IDLE_TICKS: u32 =
    (MAX_IDLE_TIME.as_millis() / UPDATE_DELAY.as_millis()) as u32;

/// Latest caret position waiting to be pushed.
#[derive(Clone, Copy, Debug)]
struct CaretState {
    rev_num: RevNum,
    index: usize,
    length: usize,
}

struct Inner {
    /// Session the updates ride on.
    session: Rc<DocSession>,

    /// Pending position; newer updates displace older ones.
    latest: Option<CaretState>,

    /// Whether a worker task is currently alive.
    running: bool,
}

/// Latest-wins pusher of the local caret position.
pub struct CaretTracker(Rc<RefCell<Inner>>);

impl CaretTracker {
    /// Creates a new [`CaretTracker`] pushing over the given session.
    #[must_use]
    pub fn new(session: Rc<DocSession>) -> Self {
        Self(Rc::new(RefCell::new(Inner {
            session,
            latest: None,
            running: false,
        })))
    }

    /// Notes the caret position at the given revision, displacing any
    /// not-yet-transmitted one, and makes sure a worker is draining.
    pub fn update(&self, rev_num: RevNum, range: Range) {
        let mut inner = self.0.borrow_mut();
        inner.latest = Some(CaretState {
            rev_num,
            index: range.index,
            length: range.length,
        });
        if !inner.running {
            inner.running = true;
            drop(inner);
            platform::spawn(run_worker(Rc::clone(&self.0)));
        }
    }
}

/// The draining loop behind [`CaretTracker::update`].
async fn run_worker(inner: Rc<RefCell<Inner>>) {
    'outer: loop {
        let session = Rc::clone(&inner.borrow().session);
        let proxy = match session.get_session_proxy().await {
            Ok(proxy) => proxy,
            Err(e) => {
                // Carets are best-effort; give up until the next update.
                log::info!("caret: session unavailable: {}", e);
                break 'outer;
            }
        };

        let mut idle_ticks: u32 = 0;
        loop {
            let pending = inner.borrow_mut().latest.take();
            if let Some(state) = pending {
                idle_ticks = 0;
                let (sent, ()) = future::join(
                    proxy.caret_update(state.rev_num, state.index, state.length),
                    platform::delay_for(UPDATE_DELAY),
                )
                .await;
                if let Err(e) = sent {
                    log::info!("caret: update failed: {}", e);
                    // Most likely a reconnect; re-resolve the proxy.
                    continue 'outer;
                }
            } else {
                platform::delay_for(UPDATE_DELAY).await;
                idle_ticks += 1;
                if idle_ticks >= MAX_IDLE_TICKS {
                    if inner.borrow().latest.is_some() {
                        continue;
                    }
                    break 'outer;
                }
            }
        }
    }
    inner.borrow_mut().running = false;
}
