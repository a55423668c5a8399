//! End-to-end consolidated queries against the mock oracle: cache hits,
//! partial success and symbol indexing.

mod helpers;

use std::time::{Duration, Instant};

use helpers::oracle::{
    call_counts, count_of, file_uri, mock_transport, start_service, start_service_with,
};
use oracle_ls::config::CacheConfig;
use oracle_ls::error::ErrorKind;
use oracle_ls::service::facets::FAILURE_ORACLE;
use oracle_ls::service::{AnalyzeParams, Facet};
use serde_json::json;

#[tokio::test]
async fn identical_query_is_served_from_cache() {
    let transport = mock_transport().with_env("MOCK_ORACLE_ANALYZE_DELAY_MS", "300");
    let service = start_service_with(transport, 250, CacheConfig::default()).await;
    let params = AnalyzeParams::new(file_uri("a.pike"), "int x;")
        .with_version(1)
        .with_include([Facet::Parse, Facet::Introspect]);

    let first = service.analyze(params.clone()).await.unwrap();
    let started = Instant::now();
    let second = service.analyze(params).await.unwrap();
    let cached_elapsed = started.elapsed();

    assert_eq!(first, second);
    assert!(first.is_complete());
    assert!(
        cached_elapsed < Duration::from_millis(150),
        "cached query took {:?}",
        cached_elapsed
    );

    let counts = call_counts(service.bridge()).await;
    assert_eq!(count_of(&counts, "analyze"), 1);
    let stats = service.cache_stats();
    assert_eq!(stats.compilation.hits, 1);
    assert_eq!(stats.compilation.size, 1);

    service.shutdown().await;
}

#[tokio::test]
async fn cached_result_matches_forced_recompile() {
    let service = start_service().await;
    let params = AnalyzeParams::new(
        file_uri("b.pike"),
        "inherit Stdio.File; int count; void run();",
    );

    let fresh = service.analyze(params.clone()).await.unwrap();
    let cached = service.analyze(params.clone()).await.unwrap();
    let forced = service.analyze_uncached(params).await.unwrap();

    assert_eq!(cached, fresh);
    assert_eq!(forced, fresh);
    assert_eq!(
        fresh.result[&Facet::Introspect]["symbols"],
        json!([
            {"name": "count", "kind": "variable"},
            {"name": "run", "kind": "function"}
        ])
    );

    service.shutdown().await;
}

#[tokio::test]
async fn failing_facet_does_not_hide_successful_ones() {
    let transport = mock_transport().with_env("MOCK_ORACLE_FAIL_FACETS", "diagnostics");
    let service = start_service_with(transport, 250, CacheConfig::default()).await;
    let params = AnalyzeParams::new(file_uri("c.pike"), "int x;")
        .with_include([Facet::Introspect, Facet::Diagnostics]);

    let response = service.analyze(params).await.unwrap();

    assert!(response.result.contains_key(&Facet::Introspect));
    assert!(!response.result.contains_key(&Facet::Diagnostics));
    let failure = &response.failures[&Facet::Diagnostics];
    assert_eq!(failure.kind, "compile");
    assert!(failure.message.contains("diagnostics"));

    service.shutdown().await;
}

#[tokio::test]
async fn only_missing_facets_are_requested_again() {
    let service = start_service().await;
    let uri = file_uri("d.pike");
    let base = AnalyzeParams::new(uri, "int x;").with_version(4);

    service
        .analyze(base.clone().with_include([Facet::Parse]))
        .await
        .unwrap();
    let response = service
        .analyze(base.with_include([Facet::Parse, Facet::Tokenize]))
        .await
        .unwrap();

    assert_eq!(response.result.len(), 2);
    let counts = call_counts(service.bridge()).await;
    assert_eq!(count_of(&counts, "analyze"), 2);
    // The second round trip extended the cached artifact.
    let again = service
        .analyze(
            AnalyzeParams::new(file_uri("d.pike"), "int x;")
                .with_version(4)
                .with_include([Facet::Tokenize]),
        )
        .await
        .unwrap();
    assert!(again.result.contains_key(&Facet::Tokenize));
    assert_eq!(count_of(&call_counts(service.bridge()).await, "analyze"), 2);

    service.shutdown().await;
}

#[tokio::test]
async fn oracle_rejection_fails_every_requested_facet() {
    let service = start_service().await;
    let params = AnalyzeParams::new(file_uri("e.pike"), "#error")
        .with_include([Facet::Parse, Facet::Diagnostics]);

    let response = service.analyze(params).await.unwrap();

    assert!(response.result.is_empty());
    assert_eq!(response.failures.len(), 2);
    assert!(
        response
            .failures
            .values()
            .all(|f| f.kind == FAILURE_ORACLE && f.message == "compilation failed")
    );

    service.shutdown().await;
}

#[tokio::test]
async fn analysis_indexes_symbols_across_files() {
    let service = start_service().await;
    service
        .analyze(AnalyzeParams::new(file_uri("one.pike"), "int shared; void only_one();"))
        .await
        .unwrap();
    service
        .analyze(AnalyzeParams::new(file_uri("two.pike"), "inherit Base; int shared;"))
        .await
        .unwrap();

    let found: Vec<_> = service
        .find_symbol("shared")
        .into_iter()
        .map(|(uri, _)| uri)
        .collect();
    assert_eq!(found, vec![file_uri("one.pike"), file_uri("two.pike")]);

    // Indexed parents are answered without the oracle.
    let inherits = service
        .get_inherited(&file_uri("two.pike"), None)
        .await
        .unwrap();
    assert_eq!(inherits, vec!["Base".to_string()]);
    let counts = call_counts(service.bridge()).await;
    assert_eq!(count_of(&counts, "get_inherited"), 0);

    service.shutdown().await;
}

#[tokio::test]
async fn unindexed_program_asks_oracle_for_parents_once() {
    let service = start_service().await;
    let uri = file_uri("fresh.pike");

    let first = service
        .get_inherited(&uri, Some("inherit Thread.Mutex;"))
        .await
        .unwrap();
    let second = service.get_inherited(&uri, None).await.unwrap();

    assert_eq!(first, vec!["Thread.Mutex".to_string()]);
    assert_eq!(second, first);
    let counts = call_counts(service.bridge()).await;
    assert_eq!(count_of(&counts, "get_inherited"), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn oracle_metrics_pass_through() {
    let service = start_service().await;

    let metrics = service.oracle_metrics().await.unwrap();

    assert_eq!(metrics["startup"]["pid"], json!(service.bridge().pid()));
    assert!(metrics["cache"]["programs"].is_u64());

    service.shutdown().await;
    let err = service
        .analyze(AnalyzeParams::new(file_uri("late.pike"), "int x;"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotStarted);
}
