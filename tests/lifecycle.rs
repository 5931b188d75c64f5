//! Concurrency and shutdown behaviour of the server loop.

use std::time::{Duration, Instant};

use axum::http::StatusCode;

mod common;

use common::TEST_KEY;

#[tokio::test]
async fn test_concurrent_requests_all_relayed() {
    let upstream = common::start_mock_upstream(Duration::ZERO).await;
    let proxy = common::start_proxy(common::proxy_config(upstream.addr, Some(TEST_KEY))).await;

    let concurrency = 20;
    let requests_per_task = 10;
    let client = common::client();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..concurrency {
        let client = client.clone();
        let url = proxy.url("/api-proxy/v1/models");
        tasks.push(tokio::spawn(async move {
            let mut ok = 0;
            for _ in 0..requests_per_task {
                if let Ok(res) = client.get(&url).send().await {
                    if res.status() == StatusCode::OK {
                        ok += 1;
                    }
                }
            }
            ok
        }));
    }

    let mut succeeded = 0;
    for task in tasks {
        succeeded += task.await.unwrap();
    }

    println!(
        "{} requests relayed in {:?}",
        succeeded,
        start.elapsed()
    );
    assert_eq!(succeeded, concurrency * requests_per_task);
    assert_eq!(upstream.recorded().len(), concurrency * requests_per_task);

    proxy.shutdown.trigger();
}

#[tokio::test]
async fn test_shutdown_stops_accepting_and_returns() {
    let upstream = common::start_mock_upstream(Duration::ZERO).await;
    let proxy = common::start_proxy(common::proxy_config(upstream.addr, Some(TEST_KEY))).await;

    let res = common::client()
        .get(proxy.url("/api-proxy/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    proxy.shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .expect("server should drain within the grace period")
        .unwrap();
    assert!(result.is_ok());

    assert!(common::client()
        .get(format!("http://{}/api-proxy/v1/models", proxy.addr))
        .send()
        .await
        .is_err());
}
