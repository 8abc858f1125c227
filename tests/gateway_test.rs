//! Integration tests for the proxy entry point: manifests, segments, CORS.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    header_of, start_endless_origin, start_origin, wait_for_flag, TestGateway, EXPECTED_RANGE,
    SEGMENT_LEN,
};
use iptv_gateway::GatewayConfig;

#[tokio::test]
async fn manifest_is_rewritten_end_to_end() {
    let origin = start_origin().await;
    let gw = TestGateway::start().await;

    let resp = reqwest::get(gw.proxy_url(&format!("http://{}/live.m3u8", origin), ""))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header_of(&resp, "content-type"), "application/vnd.apple.mpegurl");
    assert_eq!(
        resp.text().await.unwrap(),
        "#EXTM3U\n#EXTINF:10,\n/proxy?url=http%3A%2F%2Forigin%2Fa.ts&segment=true\n"
    );
}

#[tokio::test]
async fn relative_segments_follow_the_redirect_target() {
    let origin = start_origin().await;
    let gw = TestGateway::start().await;

    let body = reqwest::get(gw.proxy_url(&format!("http://{}/redirect.m3u8", origin), ""))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let expected = format!("http://localhost:{}/cdn/chunk1.ts", origin.port());
    assert_eq!(
        body.lines().last().unwrap(),
        format!("/proxy?url={}&segment=true", urlencoding::encode(&expected))
    );
}

#[tokio::test]
async fn failed_manifest_fetch_is_json_error() {
    let origin = start_origin().await;
    let gw = TestGateway::start().await;

    let resp = reqwest::get(gw.proxy_url(&format!("http://{}/missing.m3u8", origin), ""))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("404"));
}

#[tokio::test]
async fn unreachable_origin_is_bad_gateway() {
    let gw = TestGateway::start().await;

    // Nothing listens on the discard port locally.
    let resp = reqwest::get(gw.proxy_url("http://127.0.0.1:9/live.m3u8", ""))
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn missing_url_is_bad_request() {
    let gw = TestGateway::start().await;
    let resp = reqwest::get(gw.url("/proxy")).await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn segment_is_streamed_with_player_headers_and_inferred_type() {
    let origin = start_origin().await;
    let gw = TestGateway::start().await;

    // The origin rejects requests without a player UA and same-origin Referer.
    let resp = reqwest::get(gw.proxy_url(&format!("http://{}/seg/a.ts", origin), "&segment=true"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header_of(&resp, "content-type"), "video/mp2t");
    assert_eq!(header_of(&resp, "content-length"), SEGMENT_LEN.to_string());

    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), SEGMENT_LEN);
    assert_eq!(body[251], 0);
}

#[tokio::test]
async fn range_is_forwarded_and_content_range_mirrored() {
    let origin = start_origin().await;
    let gw = TestGateway::start().await;

    let resp = reqwest::Client::new()
        .get(gw.proxy_url(&format!("http://{}/seg/a.ts", origin), "&segment=true"))
        .header("Range", EXPECTED_RANGE)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 206);
    assert_eq!(
        header_of(&resp, "content-range"),
        format!("bytes 100-200/{}", SEGMENT_LEN)
    );
    assert_eq!(header_of(&resp, "content-length"), "101");
    assert_eq!(resp.bytes().await.unwrap().len(), 101);
}

#[tokio::test]
async fn upstream_error_status_is_mirrored_for_segments() {
    let origin = start_origin().await;
    let gw = TestGateway::start().await;

    let resp = reqwest::Client::new()
        .get(gw.proxy_url(&format!("http://{}/seg/a.ts", origin), "&segment=true"))
        .header("Range", "bytes=0-1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);
}

#[tokio::test]
async fn client_disconnect_aborts_upstream_read() {
    let (origin, origin_dropped) = start_endless_origin().await;
    let gw = TestGateway::start().await;

    let mut resp = reqwest::get(gw.proxy_url(
        &format!("http://{}/live/endless.ts", origin),
        "&segment=true",
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header_of(&resp, "content-type"), "video/mp2t");
    let chunk = resp.chunk().await.unwrap().unwrap();
    assert!(!chunk.is_empty());
    assert!(!origin_dropped.load(Ordering::SeqCst));

    drop(resp);

    wait_for_flag(&origin_dropped, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn raw_stream_is_relayed_when_transcoding_disabled() {
    let origin = start_origin().await;
    let config = GatewayConfig {
        no_transcode: true,
        ..GatewayConfig::default()
    };
    let gw = TestGateway::with_config(config, "/nonexistent/ffmpeg").await;

    let resp = reqwest::get(gw.proxy_url(&format!("http://{}/raw/stream", origin), ""))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "raw-bytes");
    assert_eq!(gw.state.transcoder.live_processes(), 0);
}

#[tokio::test]
async fn options_short_circuits_with_cors() {
    let gw = TestGateway::start().await;

    let resp = reqwest::Client::new()
        .request(
            reqwest::Method::OPTIONS,
            gw.proxy_url("http://unreachable.invalid/x.m3u8", ""),
        )
        .header("Origin", "http://player.example")
        .header("Access-Control-Request-Method", "GET")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert_eq!(header_of(&resp, "access-control-allow-origin"), "*");
}

#[tokio::test]
async fn options_keeps_not_found_and_method_not_allowed() {
    let gw = TestGateway::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .request(reqwest::Method::OPTIONS, gw.url("/no-such-route"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .request(reqwest::Method::OPTIONS, gw.url("/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);
}

#[tokio::test]
async fn cors_headers_on_every_response() {
    let origin = start_origin().await;
    let gw = TestGateway::start().await;

    let resp = reqwest::Client::new()
        .get(gw.proxy_url(&format!("http://{}/live.m3u8", origin), ""))
        .header("Origin", "http://player.example")
        .send()
        .await
        .unwrap();
    assert_eq!(header_of(&resp, "access-control-allow-origin"), "*");
    let exposed = header_of(&resp, "access-control-expose-headers").to_ascii_lowercase();
    assert!(exposed.contains("content-range"));
    assert!(exposed.contains("content-length"));

    let resp = reqwest::Client::new()
        .get(gw.url("/proxy"))
        .header("Origin", "http://player.example")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(header_of(&resp, "access-control-allow-origin"), "*");
}
