mod common;

use common::*;

use agent_relay::events::{AgentEvent, ToolProgressData};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_text_lands_in_thread() {
    let h = harness(vec![vec![
        init_event("sess_1"),
        delta("Hello "),
        delta("world"),
        turn("Hello world"),
        success(0.05, 2),
    ]]);
    let thread = h.start("hi").await;
    h.wait_idle(&thread).await;

    assert!(h.chat.surviving_texts().iter().any(|text| text == "Hello world"));
    assert_eq!(
        h.remote_session_id(&thread).await.as_deref(),
        Some("sess_1")
    );
    let cost = h.commands.cost(&thread).await.unwrap();
    assert!((cost - 0.05).abs() < 1e-9);

    let record = h
        .registry
        .store()
        .load(&thread)
        .await
        .unwrap()
        .expect("durable record");
    assert_eq!(record.remote_session_id.as_deref(), Some("sess_1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_turn_message_is_authoritative() {
    // The full-turn text extends what was streamed; the final message must
    // show the full version, not the delta preview.
    let h = harness(vec![vec![
        init_event("sess_1"),
        delta("Hello wor"),
        turn("Hello world, with a correction."),
        success(0.0, 1),
    ]]);
    let thread = h.start("hi").await;
    h.wait_idle(&thread).await;

    assert!(h
        .chat
        .surviving_texts()
        .iter()
        .any(|text| text == "Hello world, with a correction."));
    assert!(!h.chat.sent_text_containing("Hello wor,"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fast_deltas_produce_bounded_edits() {
    let mut script = vec![init_event("sess_1")];
    let mut full = String::new();
    for i in 0..50 {
        let piece = format!("chunk{i} ");
        full.push_str(&piece);
        script.push(delta(&piece));
    }
    script.push(turn(full.trim_end()));
    script.push(success(0.0, 1));

    let mut config = test_config();
    config.min_flush_interval = std::time::Duration::from_millis(200);
    let h = harness_with_config(vec![script], config);
    let thread = h.start("go").await;
    h.wait_idle(&thread).await;

    // 50 deltas arrive near-instantly; elapsed/interval + 1 allows only a
    // couple of edits, and no text may be lost.
    assert!(h.chat.edit_count() <= 3, "edits: {}", h.chat.edit_count());
    assert!(h
        .chat
        .surviving_texts()
        .iter()
        .any(|text| text.contains("chunk0") && text.contains("chunk49")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_only_turns_leave_status_alone() {
    // A turn that carried no response text keeps the existing thinking
    // indicator instead of reposting it.
    let h = harness(vec![vec![
        init_event("sess_1"),
        turn(""),
        delta("answer"),
        turn("answer"),
        success(0.0, 1),
    ]]);
    let thread = h.start("hi").await;
    h.wait_idle(&thread).await;

    // Once at run start, once after the turn that carried text.
    assert_eq!(h.chat.op_count_containing("Thinking"), 2);
    assert!(h.chat.surviving_texts().iter().any(|text| text == "answer"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_heartbeat_without_block_synthesizes_card() {
    // A heartbeat for a call id with no prior block start still gets a
    // visible card instead of being silently dropped.
    let h = harness(vec![vec![
        init_event("sess_1"),
        ScriptItem::Event(AgentEvent::ToolProgress(ToolProgressData {
            call_id: "call_x".to_string(),
            elapsed_ms: 12_000,
        })),
        turn("done"),
        success(0.0, 1),
    ]]);
    let thread = h.start("hi").await;
    h.wait_idle(&thread).await;

    assert!(h.chat.op_count_containing("**tool**") > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follow_up_resumes_remote_session() {
    let h = harness(vec![
        vec![init_event("sess_1"), turn("first"), success(0.0, 1)],
        vec![init_event("sess_1"), turn("second"), success(0.0, 1)],
    ]);
    let thread = h.start("hi").await;
    h.wait_idle(&thread).await;

    h.reply(&thread, "and another thing").await;
    h.wait_idle(&thread).await;

    assert_eq!(h.runtime.request_count(), 2);
    let second = h.runtime.request(1);
    assert_eq!(second.prompt, "and another thing");
    assert_eq!(second.resume_session_id.as_deref(), Some("sess_1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_session_without_identity_reports_expired() {
    // First run never emits init, so no remote identity is recorded.
    let h = harness(vec![vec![turn("ok"), success(0.0, 1)]]);
    let thread = h.start("hi").await;
    h.wait_idle(&thread).await;

    h.reply(&thread, "hello again").await;
    assert!(h.chat.sent_text_containing("expired"));
    assert_eq!(h.runtime.request_count(), 1);
}
