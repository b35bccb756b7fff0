use harvester_core::RunStatus;
use harvester_core::models::ApiResponse;
use harvester_core::testutil::{MockSearchApi, business_body};

use crate::integration::common::{Workspace, fast_config, sorted_keys};

#[tokio::test]
async fn rate_limited_key_still_ends_up_in_output() {
    let ws = Workspace::with_catalog(&["A", "B", "C"]);
    let api = MockSearchApi::new().with_response("B", ApiResponse::new(429, "{}"));

    let summary = ws.run(api, fast_config()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rate_limited, 1);
    assert_eq!(sorted_keys(&ws.records()), ["A", "B", "C"]);
}

#[tokio::test]
async fn second_run_over_same_output_does_nothing() {
    let ws = Workspace::with_catalog(&["A", "B", "C"]);
    ws.run(MockSearchApi::new(), fast_config()).await;

    assert!(ws.worklist().await.is_empty());

    let api = MockSearchApi::new();
    let summary = ws.run(api.clone(), fast_config()).await;
    assert_eq!(summary.attempted, 0);
    assert!(api.calls().is_empty());
    assert_eq!(ws.records().len(), 3);
}

#[tokio::test]
async fn restart_after_abort_only_fetches_what_is_missing() {
    let ws = Workspace::with_catalog(&["A", "B", "C", "D", "E"]);
    let api = MockSearchApi::new()
        .with_response("C", ApiResponse::new(500, "boom"))
        .with_response("D", ApiResponse::new(500, "boom"));
    let config = fast_config().with_concurrency(1).with_fatal_error_ceiling(1);

    let first = ws.run(api, config).await;
    assert_eq!(first.status, RunStatus::Aborted);
    assert_eq!(sorted_keys(&ws.records()), ["A", "B"]);

    let worklist = ws.worklist().await;
    assert_eq!(worklist.completed, 2);
    let remaining: Vec<&str> = worklist.keys.iter().map(|k| k.as_str()).collect();
    assert_eq!(remaining, ["C", "D", "E"]);

    let api = MockSearchApi::new();
    let second = ws.run(api.clone(), fast_config()).await;
    assert_eq!(second.status, RunStatus::Completed);
    let mut calls = api.calls();
    calls.sort();
    assert_eq!(calls, ["C", "D", "E"]);
    assert_eq!(sorted_keys(&ws.records()), ["A", "B", "C", "D", "E"]);
}

#[tokio::test]
async fn partially_written_output_resumes_with_the_rest() {
    let ws = Workspace::with_catalog(&["A", "B"]);
    std::fs::write(
        &ws.output,
        "{\"key\":\"A\",\"fetch_timestamp\":\"2024-01-01T00:00:00Z\",\"payload\":[]}\n",
    )
    .unwrap();

    let worklist = ws.worklist().await;
    let remaining: Vec<&str> = worklist.keys.iter().map(|k| k.as_str()).collect();
    assert_eq!(remaining, ["B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_fetches_write_whole_lines() {
    let ws = Workspace::with_catalog(&["K1", "K2", "K3", "K4", "K5"]);
    let summary = ws.run(MockSearchApi::new(), fast_config().with_concurrency(2)).await;

    assert_eq!(summary.succeeded, 5);
    let text = std::fs::read_to_string(&ws.output).unwrap();
    assert_eq!(text.lines().count(), 5);
    for line in text.lines() {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
}

#[tokio::test]
async fn entries_for_other_keys_are_not_written() {
    let ws = Workspace::with_catalog(&["N1"]);
    let body = serde_json::json!({
        "businesses": [
            {"name": "here", "location": {"zip_code": "N1"}},
            {"name": "next door", "location": {"zip_code": "N2"}},
        ]
    })
    .to_string();
    let api = MockSearchApi::new().with_response("N1", ApiResponse::new(200, body));

    ws.run(api, fast_config()).await;

    let records = ws.records();
    assert_eq!(records.len(), 1);
    let payload = records[0].payload.as_array().unwrap();
    assert_eq!(payload.len(), 1);
    assert_eq!(payload[0]["name"], "here");
}

#[tokio::test]
async fn key_with_no_matching_entries_is_still_marked_done() {
    let ws = Workspace::with_catalog(&["N1"]);
    let body = business_body("N9", &["x"]);
    let api = MockSearchApi::new().with_response("N1", ApiResponse::new(200, body));

    ws.run(api, fast_config()).await;

    let records = ws.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, serde_json::json!([]));
    assert!(ws.worklist().await.is_empty());
}
