//! Operator control through the monitoring context.

use std::time::Duration;

use session_monitor::client::view::SessionView;
use session_monitor::client::LocalApi;
use session_monitor::models::control::SessionControlRequest;
use session_monitor::models::session::{ControlAction, SessionState};
use session_monitor::source::SourceCommand;
use session_monitor::AppError;

use super::test_helpers::{test_context, Script, ScriptedSource, PROJECT};

fn request(session_id: &str, action: ControlAction) -> SessionControlRequest {
    SessionControlRequest::new(PROJECT, session_id, action)
}

fn forced(session_id: &str, action: ControlAction) -> SessionControlRequest {
    SessionControlRequest {
        force: Some(true),
        ..request(session_id, action)
    }
}

#[tokio::test(start_paused = true)]
async fn pause_holds_despite_activity_until_resumed() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    let paused = ctx
        .control(&request("s1", ControlAction::Pause))
        .await
        .expect("control");
    assert!(paused.success);
    assert_eq!(paused.new_state, Some(SessionState::Paused));
    assert_eq!(paused.message.as_deref(), Some("session paused"));
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Paused)
    );

    // Live keeps producing tokens; the intent still wins.
    ctx.refresh(PROJECT, true).await.expect("monitored");
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Paused)
    );

    let resumed = ctx
        .control(&request("s1", ControlAction::Resume))
        .await
        .expect("control");
    assert!(resumed.success);
    assert_eq!(resumed.new_state, Some(SessionState::Active));
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Active)
    );
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn resume_reports_detected_state() {
    let quiet_since = chrono::Utc::now() - chrono::Duration::minutes(30);
    let source = ScriptedSource::with_sessions(&[("s1", Script::Quiet(quiet_since))]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    ctx.control(&request("s1", ControlAction::Pause))
        .await
        .expect("control");
    let resumed = ctx
        .control(&request("s1", ControlAction::Resume))
        .await
        .expect("control");
    assert!(resumed.success);
    assert_eq!(resumed.new_state, Some(SessionState::Stalled));
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Stalled)
    );
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn illegal_transitions_are_rejected_results() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    let result = ctx
        .control(&request("s1", ControlAction::Resume))
        .await
        .expect("rejection is not an error");
    assert!(!result.success);
    assert_eq!(result.new_state, None);
    assert_eq!(
        result.message.as_deref(),
        Some("cannot resume session in state active")
    );

    let restart = ctx
        .control(&request("s1", ControlAction::Restart))
        .await
        .expect("control");
    assert!(!restart.success);
    assert!(source.commands().is_empty(), "no side effects for rejections");
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pausing_twice_reports_already_paused() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    ctx.control(&request("s1", ControlAction::Pause))
        .await
        .expect("control");
    let again = ctx
        .control(&request("s1", ControlAction::Pause))
        .await
        .expect("control");
    assert!(!again.success);
    assert_eq!(again.message.as_deref(), Some("session is already paused"));
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_pauses_accept_exactly_one() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    let first = request("s1", ControlAction::Pause);
    let second = request("s1", ControlAction::Pause);
    let (a, b) = tokio::join!(ctx.control(&first), ctx.control(&second));
    let accepted = [a.expect("control"), b.expect("control")]
        .iter()
        .filter(|result| result.success)
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(source.commands(), vec![("s1".to_owned(), SourceCommand::Pause)]);
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn terminate_then_forced_terminate_is_idempotent() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    let first = ctx
        .control(&forced("s1", ControlAction::Terminate))
        .await
        .expect("control");
    assert!(first.success);
    assert_eq!(first.new_state, Some(SessionState::Terminated));

    let second = ctx
        .control(&forced("s1", ControlAction::Terminate))
        .await
        .expect("control");
    assert_eq!(second.success, first.success);
    assert_eq!(second.new_state, first.new_state);
    assert_eq!(second.message.as_deref(), Some("session already terminated"));

    let unforced = ctx
        .control(&request("s1", ControlAction::Terminate))
        .await
        .expect("control");
    assert!(!unforced.success);
    assert_eq!(
        unforced.message.as_deref(),
        Some("cannot terminate session in state terminated")
    );

    assert_eq!(
        source.commands(),
        vec![("s1".to_owned(), SourceCommand::Terminate { force: true })],
        "only the first terminate reaches the source"
    );
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn terminated_session_hides_then_restart_brings_it_back() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live), ("s2", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    ctx.control(&request("s1", ControlAction::Terminate))
        .await
        .expect("control");
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Terminated)
    );

    ctx.refresh(PROJECT, true).await.expect("monitored");
    assert!(ctx.session_update(PROJECT, "s1").is_some(), "second snapshot still shows it");

    ctx.refresh(PROJECT, true).await.expect("monitored");
    let data = ctx.snapshot(PROJECT).expect("snapshot");
    assert!(data.session("s1").is_none(), "hidden after two snapshots");
    assert_eq!(data.stats.total_count, 1);

    let restarted = ctx
        .control(&request("s1", ControlAction::Restart))
        .await
        .expect("control");
    assert!(restarted.success);
    assert_eq!(restarted.new_state, Some(SessionState::Active));
    assert_eq!(restarted.message.as_deref(), Some("session restarted"));
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Active)
    );
    assert_eq!(
        source.commands(),
        vec![
            ("s1".to_owned(), SourceCommand::Terminate { force: false }),
            ("s1".to_owned(), SourceCommand::Restart),
        ]
    );
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_side_effect_rolls_back_intent() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    source.fail_control(true);
    let err = ctx
        .control(&request("s1", ControlAction::Pause))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DetectionFailure(_)));

    ctx.refresh(PROJECT, true).await.expect("monitored");
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Active)
    );

    source.fail_control(false);
    let retried = ctx
        .control(&request("s1", ControlAction::Pause))
        .await
        .expect("control");
    assert!(retried.success, "rolled-back intent does not block a retry");
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_side_effect_keeps_later_intent() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    source.set_control_delay(Duration::from_millis(100));
    source.fail_on(SourceCommand::Pause);
    let pause = request("s1", ControlAction::Pause);
    let terminate = request("s1", ControlAction::Terminate);
    let (paused, terminated) = tokio::join!(ctx.control(&pause), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.control(&terminate).await
    });

    assert!(matches!(paused, Err(AppError::DetectionFailure(_))));
    let terminated = terminated.expect("control");
    assert!(terminated.success);
    assert_eq!(terminated.new_state, Some(SessionState::Terminated));
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Terminated),
        "the failed pause does not undo the terminate"
    );
    assert_eq!(
        source.commands(),
        vec![("s1".to_owned(), SourceCommand::Terminate { force: false })]
    );
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn intent_is_dropped_when_session_disappears() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live), ("s2", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    ctx.control(&request("s1", ControlAction::Pause))
        .await
        .expect("control");
    source.remove("s1");
    ctx.refresh(PROJECT, true).await.expect("monitored");
    assert!(ctx.session_update(PROJECT, "s1").is_none());

    source.set("s1", Script::Live);
    ctx.refresh(PROJECT, true).await.expect("monitored");
    assert_eq!(
        ctx.session_update(PROJECT, "s1").map(|s| s.state),
        Some(SessionState::Active),
        "a reappearing session starts without the old pause"
    );
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_targets_are_not_found() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live)]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    let err = ctx
        .control(&request("ghost", ControlAction::Pause))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let other_project = SessionControlRequest::new("elsewhere", "s1", ControlAction::Pause);
    let err = ctx.control(&other_project).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_and_errored_sessions_can_be_paused() {
    let quiet_since = chrono::Utc::now() - chrono::Duration::minutes(10);
    let source = ScriptedSource::with_sessions(&[
        ("stuck", Script::Quiet(quiet_since)),
        ("broken", Script::Failing),
    ]);
    let ctx = test_context(&source);
    ctx.start_monitoring(PROJECT, None).await.expect("started");

    for session in ["stuck", "broken"] {
        let result = ctx
            .control(&request(session, ControlAction::Pause))
            .await
            .expect("control");
        assert!(result.success, "{session} pausable");
        assert_eq!(
            ctx.session_update(PROJECT, session).map(|s| s.state),
            Some(SessionState::Paused)
        );
    }
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn local_api_drives_session_view() {
    let source = ScriptedSource::with_sessions(&[("s1", Script::Live), ("s2", Script::Live)]);
    let ctx = test_context(&source);
    let api = LocalApi::new(std::sync::Arc::clone(&ctx));
    let mut view = SessionView::new(PROJECT);

    view.refresh(&api).await.expect("refresh");
    assert!(view.data().is_none());

    ctx.start_monitoring(PROJECT, None).await.expect("started");
    view.refresh(&api).await.expect("refresh");
    assert_eq!(view.sessions().len(), 2);

    view.select("s1").expect("listed");
    let result = view
        .execute_control(&api, ControlAction::Terminate, None, true)
        .await
        .expect("control");
    assert!(result.success);
    assert_eq!(view.selected().map(|s| s.state), Some(SessionState::Terminated));
    assert_eq!(
        source.commands(),
        vec![("s1".to_owned(), SourceCommand::Terminate { force: true })]
    );
    ctx.shutdown().await;
}
