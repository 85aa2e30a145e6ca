//! End-to-end flows: raw trace to parse result, and ingestion to served resources

mod support;

use failtrace::serve::ResponseStatus;
use failtrace::{CacheStore, FrameworkRegistry, ParseOptions, TestFramework};
use serde_json::Value;
use support::{Harness, GENERIC_TRACE, PIPELINE, PROJECT};

#[test]
fn test_generic_trace_counts_errors_and_warnings() {
    let registry = FrameworkRegistry::with_defaults();
    let trace = "ERROR: Package installation failed: numpy==1.24.0\nWARNING: deprecated API";

    let (framework, result) = registry.analyze("build", "build", trace, &ParseOptions::default());
    assert_eq!(framework, TestFramework::Generic);
    assert_eq!(result.parser_type, "generic");
    assert_eq!(result.error_count, 1);
    assert_eq!(result.warning_count, 1);
}

#[test]
fn test_unit_tests_job_with_session_banner_is_pytest() {
    let registry = FrameworkRegistry::with_defaults();
    let trace = "==== test session starts ====\ncollected 0 items\n";
    assert_eq!(
        registry.detect_framework("unit-tests", "test", trace),
        TestFramework::Pytest
    );
}

#[tokio::test]
async fn test_missing_key_on_empty_store() {
    let cache = CacheStore::in_memory().await.unwrap();
    assert!(cache.get("missing-key").await.unwrap().is_none());
}

#[test]
fn test_parsing_is_deterministic() {
    let registry = FrameworkRegistry::with_defaults();
    let first = registry.analyze("install", "build", GENERIC_TRACE, &ParseOptions::default());
    let second = registry.analyze("install", "build", GENERIC_TRACE, &ParseOptions::default());
    assert_eq!(first, second);
    let ids: Vec<String> = first.1.errors.iter().map(|e| e.error_id()).collect();
    assert!(ids.iter().all(|id| id.len() == 16));
}

#[tokio::test]
async fn test_not_cached_then_served_after_analysis() {
    let harness = Harness::in_memory().await;
    harness.seed_pipeline(PROJECT, PIPELINE, "failed");
    let uri = format!("gl://pipeline/{PROJECT}/{PIPELINE}");

    let before = harness.server.get_resource(&uri).await;
    assert_eq!(before.status, ResponseStatus::NotCached);
    let action = before.suggested_action.unwrap();
    assert_eq!(action.action, "trigger_analysis");
    assert_eq!(action.project_id, PROJECT);
    assert_eq!(action.pipeline_id, Some(PIPELINE));
    assert_eq!(harness.client.pipeline_calls(), 0);

    let report = harness
        .pipeline
        .trigger_analysis(PROJECT, PIPELINE)
        .await
        .unwrap();

    let after = harness.server.get_resource(&uri).await;
    assert_eq!(after.status, ResponseStatus::Success);
    let data = after.data.unwrap();
    assert_eq!(data["pipeline"]["status"], "failed");
    assert_eq!(data["analysis"]["total_failed_jobs"], 4);

    // Every advertised resource is servable straight from the cache
    let calls = harness.client.trace_calls();
    for resource in &report.resources {
        let response = harness.server.get_resource(resource).await;
        assert_eq!(response.status, ResponseStatus::Success, "{resource}");
    }
    assert_eq!(harness.client.trace_calls(), calls);
}

#[tokio::test]
async fn test_error_drilldown_across_modes() {
    let harness = Harness::in_memory().await;
    harness.seed_pipeline(PROJECT, PIPELINE, "failed");
    harness
        .pipeline
        .trigger_analysis(PROJECT, PIPELINE)
        .await
        .unwrap();
    let job_id = PIPELINE * 10 + 1;

    let errors = harness
        .server
        .get_resource(&format!("gl://job/{PROJECT}/{job_id}/errors"))
        .await
        .data
        .unwrap();
    assert_eq!(errors["error_count"], 3);
    let error_id = errors["errors"][0]["error_id"].as_str().unwrap().to_string();

    let mut sizes = Vec::new();
    for mode in ["minimal", "balanced", "fixing", "full"] {
        let response = harness
            .server
            .get_resource(&format!("gl://error/{PROJECT}/{job_id}/{error_id}?mode={mode}"))
            .await;
        assert_eq!(response.status, ResponseStatus::Success);
        let data = response.data.unwrap();
        assert_eq!(data["error_id"], error_id.as_str());
        sizes.push(data.as_object().map(|o| o.len()).unwrap_or(0));
    }
    assert!(sizes.windows(2).all(|w| w[0] <= w[1]), "{sizes:?}");

    let trace = harness
        .server
        .get_resource(&format!(
            "gl://error/{PROJECT}/{job_id}/{error_id}/trace/minimal"
        ))
        .await
        .data
        .unwrap();
    let lines = trace["trace"]["lines"].as_array().unwrap();
    assert!(!lines.is_empty() && lines.len() <= 11);
    assert!(lines
        .iter()
        .filter_map(Value::as_str)
        .any(|line| line.contains("assert")));
}

#[tokio::test]
async fn test_unknown_address_lists_supported_patterns() {
    let harness = Harness::in_memory().await;
    let response = harness
        .server
        .get_resource(&format!("gl://commit/{PROJECT}/abc"))
        .await;
    assert_eq!(response.status, ResponseStatus::Error);
    let patterns = response.supported_patterns.unwrap();
    assert!(patterns.iter().any(|p| p.starts_with("gl://pipeline/")));
}
