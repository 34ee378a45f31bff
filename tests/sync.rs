//! End-to-end tests of the editor synchronization machine against the
//! scripted server and the fake editor.

mod support;

use std::{rc::Rc, time::Duration};

use futures::StreamExt as _;
use serde_json::json;
use tokio::task::LocalSet;

use calliope_scribe::{
    doc::{DocSession, EditorSync, SessionEvent},
    editor::{Editor, Range},
    proto::{Change, CodedError, Delta, RevNum},
    rpc::CloseMsg,
};

use support::{settle, snapshot, FakeEditor, TestServer};

/// A little past the push/pull pacing of the machine.
const PACING: Duration = Duration::from_millis(1100);

async fn attach(
    server: &TestServer,
) -> (Rc<FakeEditor>, Rc<EditorSync>, Rc<DocSession>) {
    let session = server.doc_session();
    let editor = FakeEditor::new();
    let sync = EditorSync::new(
        Rc::clone(&editor) as Rc<dyn Editor>,
        Rc::clone(&session),
        true,
    );
    sync.start();
    settle().await;
    (editor, sync, session)
}

#[tokio::test(start_paused = true)]
async fn startup_installs_snapshot_and_swallows_the_echo() {
    LocalSet::new()
        .run_until(async {
            let server = TestServer::new(snapshot(5, "hello"));
            let (editor, sync, _session) = attach(&server).await;

            assert_eq!(editor.text(), "hello");
            assert!(editor.enabled.get());
            assert!(editor.focused.get() >= 1);
            assert!(editor.history_clears.get() >= 1);
            assert!(sync.should_be_enabled());
            assert_eq!(server.script.borrow().sessions_made, 1);

            // The install echo is consumed, never submitted.
            assert_eq!(server.parked_count("body_update"), 0);

            // Quiescent: exactly one long-poll in flight, at the snapshot
            // revision, and it stays that way.
            tokio::time::sleep(PACING).await;
            tokio::time::sleep(PACING).await;
            settle().await;
            assert_eq!(server.parked_count("body_getChangeAfter"), 1);
            let poll = server.take_call("body_getChangeAfter").unwrap();
            assert_eq!(poll.payload.args, vec![json!(5)]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn local_edit_is_submitted_against_its_base_revision() {
    LocalSet::new()
        .run_until(async {
            let server = TestServer::new(snapshot(5, "abcd"));
            let (editor, _sync, _session) = attach(&server).await;
            let poll = server.wait_call("body_getChangeAfter").await;

            editor.type_text(Delta::new().insert("X"));
            settle().await;
            // Still collecting: nothing sent until the push delay expires.
            assert_eq!(server.parked_count("body_update"), 0);

            tokio::time::sleep(PACING).await;
            let update = server.wait_call("body_update").await;
            assert_eq!(
                update.payload.args,
                vec![json!(5), json!([{ "insert": "X" }])],
            );

            // The server acknowledges at rev 6 with no correction, and the
            // blocked long-poll resolves with our own change.
            server.reply_ok(
                &update,
                &Change {
                    rev_num: RevNum(6),
                    delta: Delta::new(),
                },
            );
            server.reply_ok(
                &poll,
                &Change {
                    rev_num: RevNum(6),
                    delta: Delta::new().insert("X"),
                },
            );
            settle().await;

            // Editor untouched; polling resumes from the new revision.
            assert_eq!(editor.text(), "Xabcd");
            let next_poll = server.wait_call("body_getChangeAfter").await;
            assert_eq!(next_poll.payload.args, vec![json!(6)]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn server_change_is_applied_around_history_cutoffs() {
    LocalSet::new()
        .run_until(async {
            let server = TestServer::new(snapshot(5, "abcd"));
            let (editor, _sync, _session) = attach(&server).await;
            let poll = server.wait_call("body_getChangeAfter").await;

            let cutoffs_before = editor.cutoffs.get();
            server.reply_ok(
                &poll,
                &Change {
                    rev_num: RevNum(6),
                    delta: Delta::new().insert("S"),
                },
            );
            settle().await;

            assert_eq!(editor.text(), "Sabcd");
            assert!(editor.cutoffs.get() >= cutoffs_before + 2);

            // Polling resumes from the new revision.
            tokio::time::sleep(PACING).await;
            let next_poll = server.wait_call("body_getChangeAfter").await;
            assert_eq!(next_poll.payload.args, vec![json!(6)]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_edits_are_rebased_over_the_correction() {
    LocalSet::new()
        .run_until(async {
            let server = TestServer::new(snapshot(5, "abcd"));
            let (editor, _sync, _session) = attach(&server).await;
            drop(server.take_call("body_getChangeAfter"));

            // dL: insert "X" at 0.
            editor.type_text(Delta::new().insert("X"));
            tokio::time::sleep(PACING).await;
            let update = server.wait_call("body_update").await;
            assert_eq!(
                update.payload.args,
                vec![json!(5), json!([{ "insert": "X" }])],
            );

            // dM: the user typed "Z" at 2 while the update was in flight.
            editor.type_text(Delta::new().retain(2).insert("Z"));
            assert_eq!(editor.text(), "XaZbcd");

            // The server interleaved someone else's "Y" at 0: rev 7 with a
            // correction.
            server.reply_ok(
                &update,
                &Change {
                    rev_num: RevNum(7),
                    delta: Delta::new().insert("Y"),
                },
            );
            settle().await;

            // Editor converged to the server state with dM on top.
            assert_eq!(editor.text(), "YXaZbcd");

            // The next iteration resubmits the rebased local edit against
            // the server revision.
            tokio::time::sleep(PACING).await;
            let resubmit = server.wait_call("body_update").await;
            assert_eq!(
                resubmit.payload.args,
                vec![json!(7), json!([{ "retain": 3 }, { "insert": "Z" }])],
            );

            server.reply_ok(
                &resubmit,
                &Change {
                    rev_num: RevNum(8),
                    delta: Delta::new(),
                },
            );
            settle().await;
            assert_eq!(editor.text(), "YXaZbcd");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_merge_waits_for_the_flight_to_land() {
    LocalSet::new()
        .run_until(async {
            let server = TestServer::new(snapshot(5, "abcd"));
            let (editor, sync, _session) = attach(&server).await;
            drop(server.take_call("body_getChangeAfter"));

            editor.type_text(Delta::new().insert("X"));
            tokio::time::sleep(PACING).await;
            let update = server.wait_call("body_update").await;

            // Stop mid-merge: the editor goes read-only immediately, but
            // the write is not discarded.
            sync.stop();
            settle().await;
            assert!(!editor.enabled.get());
            assert!(!sync.should_be_enabled());

            server.reply_ok(
                &update,
                &Change {
                    rev_num: RevNum(6),
                    delta: Delta::new(),
                },
            );
            tokio::time::sleep(Duration::from_millis(400)).await;
            settle().await;

            // Detached now: further typing is not synchronized anymore.
            editor.type_text(Delta::new().insert("Q"));
            tokio::time::sleep(PACING).await;
            settle().await;
            assert_eq!(server.parked_count("body_update"), 0);

            // And restartable.
            sync.start();
            settle().await;
            assert!(sync.should_be_enabled());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn selection_changes_feed_the_caret_tracker() {
    LocalSet::new()
        .run_until(async {
            let server = TestServer::new(snapshot(5, "abcd"));
            let (editor, _sync, _session) = attach(&server).await;

            editor.move_caret(Range {
                index: 2,
                length: 1,
            });
            settle().await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            settle().await;

            let updates = server.script.borrow().caret_updates.clone();
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0], vec![json!(5), json!(2), json!(1)]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_escalate_to_unrecoverable() {
    LocalSet::new()
        .run_until(async {
            let server = TestServer::new(snapshot(5, "abcd"));
            let (editor, sync, session) = attach(&server).await;
            let mut events = session.subscribe();

            // Failure #1 at t≈0: transient, the machine disables and
            // schedules a retry.
            let poll = server.wait_call("body_getChangeAfter").await;
            server.reply_err(&poll, CodedError::new("boom", vec![]));
            settle().await;
            assert!(!sync.should_be_enabled());
            assert!(!editor.enabled.get());

            // Retry after 1 s brings it back.
            tokio::time::sleep(Duration::from_millis(1100)).await;
            settle().await;
            assert!(sync.should_be_enabled());

            // Failure #2 at t≈20 s: still transient (window too young).
            tokio::time::advance(Duration::from_secs(19)).await;
            let poll = server.wait_call("body_getChangeAfter").await;
            server.reply_err(&poll, CodedError::new("boom", vec![]));
            settle().await;
            assert!(!sync.should_be_enabled());

            // Retry after 5 s.
            tokio::time::sleep(Duration::from_millis(5100)).await;
            settle().await;
            assert!(sync.should_be_enabled());

            // Failure #3 at t≈46 s: rate ≈ 3.9/min over a 46 s window,
            // past saving.
            tokio::time::advance(Duration::from_secs(21)).await;
            let poll = server.wait_call("body_getChangeAfter").await;
            server.reply_err(&poll, CodedError::new("boom", vec![]));
            settle().await;

            assert!(!sync.should_be_enabled());
            assert!(!editor.enabled.get());

            // The session event stream carried the error.
            let mut saw_error = false;
            while let std::task::Poll::Ready(Some(event)) =
                futures::poll!(events.next())
            {
                if matches!(event, SessionEvent::Error(_)) {
                    saw_error = true;
                }
            }
            assert!(saw_error);

            // No retry is scheduled anymore.
            tokio::time::sleep(Duration::from_secs(10)).await;
            settle().await;
            assert!(!sync.should_be_enabled());

            // But an explicit start attaches again.
            sync.start();
            settle().await;
            assert!(sync.should_be_enabled());
            assert!(editor.enabled.get());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn transport_loss_reconnects_and_reacquires_the_session() {
    LocalSet::new()
        .run_until(async {
            let server = TestServer::new(snapshot(5, "abcd"));
            let (editor, sync, session) = attach(&server).await;
            let mut events = session.subscribe();
            drop(server.take_call("body_getChangeAfter"));

            server
                .latest_transport()
                .close(CloseMsg::Abnormal(String::from("network blip")));
            settle().await;

            // Connection loss is a transient failure: disabled, retrying.
            assert!(!sync.should_be_enabled());

            tokio::time::sleep(Duration::from_millis(1100)).await;
            settle().await;

            // A second transport was dialed and the session re-acquired
            // through the still-known caret.
            assert_eq!(server.transports.borrow().len(), 2);
            assert!(sync.should_be_enabled());
            assert!(editor.enabled.get());
            assert_eq!(server.script.borrow().sessions_made, 1);

            let mut saw_closed = false;
            let mut saw_open = false;
            while let std::task::Poll::Ready(Some(event)) =
                futures::poll!(events.next())
            {
                match event {
                    SessionEvent::Closed => saw_closed = true,
                    SessionEvent::Open => saw_open = true,
                    _ => (),
                }
            }
            assert!(saw_closed);
            assert!(saw_open);

            let poll = server.wait_call("body_getChangeAfter").await;
            assert_eq!(poll.payload.args, vec![json!(5)]);
        })
        .await;
}
