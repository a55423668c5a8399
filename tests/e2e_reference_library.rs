//! Standard module resolution through the reference library index.

mod helpers;

use std::time::Duration;

use helpers::oracle::{
    call_counts, count_of, mock_transport, start_service, start_service_with, wait_until,
};
use oracle_ls::cache::Resolution;
use oracle_ls::config::CacheConfig;

#[tokio::test]
async fn resolves_known_module_once() {
    let service = start_service().await;

    let first = service.resolve_module("Stdio").await.unwrap();
    let second = service.resolve_module("Stdio").await.unwrap();

    let symbols = first.symbols().expect("Stdio resolves");
    assert_eq!(symbols.path.as_deref(), Some("/usr/lib/mock/Stdio.pmod"));
    assert!(symbols.symbols.iter().any(|s| s.name == "File"));
    assert_eq!(first, second);
    assert_eq!(count_of(&call_counts(service.bridge()).await, "resolveStdlib"), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn unknown_module_is_negatively_cached() {
    let service = start_service().await;

    assert_eq!(service.resolve_module("NoSuch").await.unwrap(), Resolution::NotFound);
    assert_eq!(service.resolve_module("NoSuch").await.unwrap(), Resolution::NotFound);

    assert_eq!(count_of(&call_counts(service.bridge()).await, "resolveStdlib"), 1);
    assert_eq!(service.cache_stats().reference.negative_entries, 1);

    service.shutdown().await;
}

#[tokio::test]
async fn inheritance_walk_stops_at_cycles() {
    let service = start_service().await;

    let walk = service.resolve_module_tree("Cycle.A").await.unwrap();

    let steps: Vec<_> = walk
        .iter()
        .map(|step| (step.module.as_str(), step.depth, step.resolution.symbols().is_some()))
        .collect();
    assert_eq!(
        steps,
        vec![("Cycle.A", 0, true), ("Cycle.B", 1, true), ("Cycle.A", 2, false)]
    );
    assert_eq!(walk[2].resolution, Resolution::InProgress);

    let chain = service.resolve_module_tree("Stdio.File").await.unwrap();
    let modules: Vec<_> = chain.iter().map(|step| step.module.as_str()).collect();
    assert_eq!(modules, vec!["Stdio.File", "Stdio.Stream"]);

    service.shutdown().await;
}

#[tokio::test]
async fn preload_modules_are_warmed_in_background() {
    let cache = CacheConfig {
        preload_modules: vec!["Stdio".to_string(), "Array".to_string(), "Missing".to_string()],
        ..CacheConfig::default()
    };
    let service = start_service_with(mock_transport(), 250, cache).await;

    let s = &service;
    assert!(
        wait_until(Duration::from_secs(5), move || async move {
            let stats = s.cache_stats().reference;
            stats.entries == 2 && stats.negative_entries == 1
        })
        .await,
        "preload should resolve every configured module"
    );
    service.resolve_module("Array").await.unwrap();
    assert_eq!(count_of(&call_counts(service.bridge()).await, "resolveStdlib"), 3);

    service.shutdown().await;
}
