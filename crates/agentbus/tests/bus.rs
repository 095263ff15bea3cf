use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use agentbus::{
    Bus, BusConfig, DurableLog, Event, EventKind, FileLog, LogBackend, Matcher, Payload, TaskState,
    handler_fn, to_payload,
};

const WAIT: Duration = Duration::from_secs(5);

fn channel_handler() -> (impl agentbus::EventHandler, mpsc::UnboundedReceiver<Arc<Event>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            anyhow::Ok(())
        }
    });
    (handler, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Arc<Event>>) -> Arc<Event> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

fn file_config(dir: &std::path::Path, max_events: usize, segment_events: usize) -> BusConfig {
    let mut config = BusConfig::default();
    config.log.backend = LogBackend::File;
    config.log.path = Some(dir.to_path_buf());
    config.log.max_events = max_events;
    config.log.segment_events = segment_events;
    config
}

#[tokio::test]
async fn test_task_correlation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let correlation_id = {
        let bus = Bus::from_config(file_config(dir.path(), 1000, 100)).await.unwrap();
        let planner = bus.agent("planner");
        let coder = bus.agent("coder");

        let correlation_id = planner.delegate_task("coder", "implement login").await.unwrap();
        coder.accept_task(&correlation_id).await.unwrap();
        planner
            .publish_agent_event(EventKind::REVIEW_REQUESTED, Payload::new())
            .await
            .unwrap();
        coder
            .complete_task(&correlation_id, json!({ "commit": "abc123" }))
            .await
            .unwrap();

        bus.shutdown().await;
        correlation_id
    };

    let bus = Bus::from_config(file_config(dir.path(), 1000, 100)).await.unwrap();
    let history = bus
        .agent("auditor")
        .task_history(&correlation_id, 100)
        .await
        .unwrap()
        .expect("task events were not persisted");

    assert_eq!(history.state, TaskState::Completed);
    assert_eq!(history.task.as_deref(), Some("implement login"));
    assert_eq!(history.assignee.as_deref(), Some("coder"));
    assert_eq!(history.result, Some(json!({ "commit": "abc123" })));
    assert_eq!(
        history.events.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>(),
        vec![
            EventKind::TASK_DELEGATED,
            EventKind::TASK_ACCEPTED,
            EventKind::TASK_COMPLETED
        ]
    );
}

#[tokio::test]
async fn test_replay_is_bounded_and_ascending() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::from_config(file_config(dir.path(), 20, 5)).await.unwrap();
    let agent = bus.agent("counter");

    for n in 0..50 {
        agent
            .publish_agent_event(EventKind::TEST_PASSED, to_payload(&json!({ "n": n })).unwrap())
            .await
            .unwrap();
    }

    let events = bus.broker().replay(100, None).await.unwrap();
    assert_eq!(events.len(), 20);
    let ns: Vec<i64> = events
        .iter()
        .map(|e| e.payload["n"].as_i64().unwrap())
        .collect();
    assert_eq!(ns, (30..50).collect::<Vec<_>>());

    let last = bus.broker().replay(3, Some(EventKind::TEST_PASSED)).await.unwrap();
    assert_eq!(
        last.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect::<Vec<_>>(),
        vec![47, 48, 49]
    );
}

#[tokio::test]
async fn test_corrupt_tail_keeps_valid_records() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = FileLog::open(dir.path(), 100, 100).await.unwrap();
        log.append(&Event::new("task.delegated", "a", Payload::new()))
            .await
            .unwrap();
        log.append(&Event::new("task.accepted", "b", Payload::new()))
            .await
            .unwrap();
    }

    let segment = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .unwrap();
    let mut bytes = std::fs::read(&segment).unwrap();
    bytes.extend_from_slice(b"{\"id\": \"trunc");
    std::fs::write(&segment, bytes).unwrap();

    let bus = Bus::from_config(file_config(dir.path(), 100, 100)).await.unwrap();
    let events = bus.broker().replay(10, None).await.unwrap();
    assert_eq!(
        events.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>(),
        vec!["task.delegated", "task.accepted"]
    );

    // Appends after the torn record stay readable.
    bus.agent("c")
        .publish_agent_event(EventKind::TASK_COMPLETED, Payload::new())
        .await
        .unwrap();
    assert_eq!(bus.broker().replay(10, None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_back_to_back_publishes_reach_every_subscriber_in_order() {
    let bus = Bus::in_memory();
    let a = bus.agent("a");
    let b = bus.agent("b");

    let (handler, mut a_rx) = channel_handler();
    a.register_handler(EventKind::TASK_DELEGATED, handler)
        .await
        .unwrap();
    let (handler, mut b_rx) = channel_handler();
    b.register_handler(EventKind::TASK_DELEGATED, handler)
        .await
        .unwrap();

    for n in 0..100 {
        a.publish_data(EventKind::TASK_DELEGATED, &json!({ "n": n }), None)
            .await
            .unwrap();
    }

    for rx in [&mut a_rx, &mut b_rx] {
        for n in 0..100 {
            let event = next(rx).await;
            assert_eq!(event.source, "a");
            assert_eq!(event.payload["n"], json!(n));
        }
    }

    let stats = bus.broker().stats().await;
    assert_eq!(stats.published, 100);
    assert_eq!(stats.subscriptions, 2);
}

#[tokio::test]
async fn test_workflow_category_scenario() {
    let bus = Bus::from_config(BusConfig::from_toml("").unwrap()).await.unwrap();
    let (handler, mut rx) = channel_handler();
    bus.broker()
        .subscribe(Matcher::category("workflow"), handler)
        .await
        .unwrap();

    bus.broker()
        .emit(
            EventKind::WORKFLOW_EXECUTION_REQUESTED,
            "operator",
            to_payload(&json!({ "workflow": "deploy" })).unwrap(),
            Some("c1".to_string()),
        )
        .await
        .unwrap();

    let event = next(&mut rx).await;
    assert_eq!(event.str_field("workflow"), Some("deploy"));

    let recent = bus
        .broker()
        .replay(10, Some(EventKind::WORKFLOW_EXECUTION_REQUESTED))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].correlation_id, "c1");
    assert_eq!(recent[0].payload, event.payload);
}
