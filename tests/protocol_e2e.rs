//! End-to-end tests against a live gateway node on loopback.

use axum::http::StatusCode;
use object_gateway::config::ClusterConfig;
use object_gateway::protocol::envelope::{encode_cookie, EnvelopeFormat};
use object_gateway::storage::{MetadataRecord, ObjectId};

mod common;

use common::{
    acknowledgments, eventually, raw_exchange, strip_acknowledgments, test_config, TestNode,
};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn fail_safe_store_then_ranged_retrieve() {
    let node = TestNode::start().await;
    let client = common::client();
    let data = pattern(2500);

    let res = client
        .post(node.url("/store"))
        .header("x-chunk-size", "1000")
        .body(data.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(res.headers()["x-protocol-version"], "3.0");
    assert_eq!(res.headers()["x-dispatch-target"], "store");
    assert!(res.headers().contains_key("x-request-id"));

    let body = res.bytes().await.unwrap();
    assert_eq!(acknowledgments(&body), vec!["1", "2"]);
    let meta = EnvelopeFormat::Xml
        .decode_object(strip_acknowledgments(&body))
        .unwrap();
    assert_eq!(meta.size, 2500);
    assert_eq!(node.storage.commit_count(&meta.id), Some(2));

    let res = client
        .get(node.url(&format!("/retrieve/{}", meta.id)))
        .header("range", "bytes=100-199")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(res.headers()["content-range"], "bytes 100-199/*");
    assert_eq!(res.bytes().await.unwrap().as_ref(), &data[100..200]);

    let res = client
        .get(node.url(&format!("/retrieve/{}", meta.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.bytes().await.unwrap().as_ref(), &data[..]);

    node.stop().await;
}

#[tokio::test]
async fn query_pages_follow_cookies_on_both_endpoints() {
    let node = TestNode::start().await;
    for i in 0..10 {
        node.storage.insert_object(
            "default",
            b"payload",
            Some(MetadataRecord::new().with("n", i.to_string())),
        );
    }
    let client = common::client();

    for endpoint in ["/query", "/query-plus"] {
        let res = client
            .get(node.url(&format!("{}?binary=1", endpoint)))
            .send()
            .await
            .unwrap();
        let body = res.bytes().await.unwrap();
        let whole = EnvelopeFormat::Binary.decode_query_result(&body).unwrap();
        let expected: Vec<ObjectId> = whole.hits.into_iter().map(|hit| hit.id).collect();
        assert_eq!(expected.len(), 10, "{}", endpoint);

        let mut paged: Vec<ObjectId> = Vec::new();
        let mut pages = Vec::new();
        let mut cookie: Option<Vec<u8>> = None;
        loop {
            let path = match &cookie {
                Some(c) => format!("{}?binary=1&max=4&cookie={}", endpoint, encode_cookie(c)),
                None => format!("{}?binary=1&max=4", endpoint),
            };
            let res = client.get(node.url(&path)).send().await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
            let body = res.bytes().await.unwrap();
            let page = EnvelopeFormat::Binary.decode_query_result(&body).unwrap();
            pages.push(page.hits.len());
            paged.extend(page.hits.into_iter().map(|hit| hit.id));
            match page.terminal.cookie {
                Some(next) => cookie = Some(next),
                None => break,
            }
        }
        assert_eq!(pages, vec![4, 4, 2], "{}", endpoint);
        assert_eq!(paged, expected, "{}", endpoint);
    }

    node.stop().await;
}

#[tokio::test]
async fn stale_clients_receive_the_cluster_blob() {
    let blob = b"generation = 3\naccepting = true\n";
    let node = TestNode::start_with(test_config(1), ClusterConfig::parse(blob).unwrap()).await;
    let client = common::client();

    let res = client
        .get(node.url("/stats"))
        .header("x-config-generation", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()["x-config-blob-length"],
        blob.len().to_string().as_str()
    );
    let body = res.bytes().await.unwrap();
    assert_eq!(&body[..blob.len()], &blob[..]);
    let stats: serde_json::Value = serde_json::from_slice(&body[blob.len()..]).unwrap();
    assert!(stats["store"].is_object());

    let res = client
        .get(node.url("/stats"))
        .header("x-config-generation", "3")
        .send()
        .await
        .unwrap();
    assert!(!res.headers().contains_key("x-config-blob-length"));

    node.stop().await;
}

#[tokio::test]
async fn not_accepting_answers_503() {
    let node = TestNode::start().await;
    let client = common::client();

    node.readiness.set_accepting(false);
    let res = client.get(node.url("/stats")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(res.headers().contains_key("x-error-reason"));

    node.readiness.set_accepting(true);
    node.cluster.replace(ClusterConfig {
        generation: 9,
        accepting: false,
        ..Default::default()
    });
    let res = client.get(node.url("/stats")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    node.stop().await;
}

#[tokio::test]
async fn missing_object_is_a_header_error() {
    let node = TestNode::start().await;
    let res = common::client()
        .get(node.url("/retrieve/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert!(res.headers().contains_key("x-error-reason"));
    assert!(eventually(|| node.stats.snapshot().outcomes.error_header == 1).await);
    node.stop().await;
}

#[tokio::test]
async fn mid_stream_failure_reaches_trailer_readers_as_trailers() {
    let node = TestNode::start().await;
    node.storage.fail_writes_past(1500);

    let head = "POST /store HTTP/1.1\r\n\
                Host: gateway\r\n\
                User-Agent: e2e-client\r\n\
                TE: trailers\r\n\
                x-chunk-size: 1000\r\n\
                Content-Length: 3000\r\n\
                Connection: close\r\n\r\n";
    let raw = raw_exchange(node.addrs[0], head, &[7u8; 3000]).await;
    let text = String::from_utf8_lossy(&raw).to_ascii_lowercase();

    assert!(text.starts_with("http/1.1 201"), "{}", text);
    assert!(text.contains("trailer: x-error-status, x-error-reason"), "{}", text);
    assert!(text.contains("x-error-status: 500"), "{}", text);
    assert!(text.contains("x-error-reason:"), "{}", text);
    assert!(eventually(|| node.stats.snapshot().outcomes.error_trailer == 1).await);

    node.stop().await;
}

#[tokio::test]
async fn mid_stream_failure_without_trailers_drops_the_connection() {
    let node = TestNode::start().await;
    node.storage.fail_writes_past(1500);

    let sent = common::client()
        .post(node.url("/store"))
        .header("x-chunk-size", "1000")
        .body(vec![7u8; 3000])
        .send()
        .await;
    let completed = match sent {
        Ok(res) => res.bytes().await.is_ok(),
        Err(_) => false,
    };
    assert!(!completed);

    // The first chunk was committed before the failure.
    let pending = node.storage.pending_objects();
    assert_eq!(pending.len(), 1);
    assert_eq!(node.storage.commit_count(&pending[0]), Some(1));

    node.stop().await;
}

#[tokio::test]
async fn http_10_is_rejected() {
    let node = TestNode::start().await;
    let head = "GET /stats HTTP/1.0\r\nHost: gateway\r\n\r\n";
    let raw = raw_exchange(node.addrs[0], head, &[]).await;
    let text = String::from_utf8_lossy(&raw);
    let status_line = text.lines().next().unwrap_or_default();
    assert!(status_line.contains(" 505"), "{}", status_line);
    node.stop().await;
}

#[tokio::test]
async fn every_port_serves_the_protocol() {
    let node = TestNode::start_with(test_config(3), ClusterConfig::default()).await;
    assert_eq!(node.addrs.len(), 3);
    let client = common::client();

    for addr in &node.addrs {
        let res = client
            .get(format!("http://{}/stats", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    assert!(eventually(|| node.stats.snapshot().outcomes.ok == 3).await);

    node.stop().await;
}
