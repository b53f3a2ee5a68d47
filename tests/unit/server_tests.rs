/* MITM Gateway (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

mod support;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use h2::Reason;
use http::{HeaderMap, Method, Request, StatusCode};
use mitm_gateway::{
    proxy::{Decision, Hook, HookBody, HookRequest, HookResponse, RequestReplacement},
    tls::{CertificateAuthority, CertificateStore, KeySource},
    utils::ProxyResult,
};
use rcgen::KeyPair;
use support::{
    client_tls, connect_tls, fast_store, spawn_control, spawn_gateway, spawn_gateway_with_certs,
    spawn_sink, spawn_upstream, FastKeys, Gateway, GatewayOptions, H1Client,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

/// Observes paths containing `/watched` with interception and `/passed` without.
#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<Option<HookBody>>>,
    responses: Mutex<Vec<(StatusCode, Option<HookBody>)>>,
    matches: AtomicUsize,
}

#[async_trait]
impl Hook for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn match_request(&self, request: &HookRequest) -> Result<Option<Decision>> {
        self.matches.fetch_add(1, Ordering::SeqCst);
        let path = request.url.path();
        Ok(if path.contains("/watched") {
            Some(Decision::intercept())
        } else if path.contains("/passed") {
            Some(Decision::pass())
        } else {
            None
        })
    }

    async fn on_matched_request(
        &self,
        _request: &HookRequest,
        body: Option<&HookBody>,
    ) -> Result<Option<Decision>> {
        self.requests.lock().unwrap().push(body.cloned());
        Ok(None)
    }

    async fn on_matched_response(
        &self,
        response: &HookResponse,
        body: Option<&HookBody>,
    ) -> Result<()> {
        self.responses
            .lock()
            .unwrap()
            .push((response.status, body.cloned()));
        Ok(())
    }
}

/// Errors while matching; `fail_closed` decides whether that blocks the request.
struct Broken {
    fail_closed: bool,
}

#[async_trait]
impl Hook for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn fail_closed(&self) -> bool {
        self.fail_closed
    }

    async fn match_request(&self, _request: &HookRequest) -> Result<Option<Decision>> {
        Err(anyhow!("lookup table unavailable"))
    }
}

/// Sends every request to `/rewritten` on the same host.
struct Rewriter;

#[async_trait]
impl Hook for Rewriter {
    fn name(&self) -> &str {
        "rewriter"
    }

    async fn match_request(&self, request: &HookRequest) -> Result<Option<Decision>> {
        Ok(request.url.path().starts_with("/old").then(|| Decision::PassOnRequest {
            intercept_response: false,
            replace_request: Some(RequestReplacement {
                path: Some("/rewritten".into()),
                ..RequestReplacement::default()
            }),
        }))
    }
}

/// Holds `/slow` requests for a while, then lets them through unmatched.
struct Stall;

#[async_trait]
impl Hook for Stall {
    fn name(&self) -> &str {
        "stall"
    }

    async fn match_request(&self, request: &HookRequest) -> Result<Option<Decision>> {
        if request.url.path() == "/slow" {
            sleep(Duration::from_millis(300)).await;
        }
        Ok(None)
    }
}

/// Records the thread each leaf key was generated on.
#[derive(Debug, Default)]
struct ThreadRecordingKeys {
    threads: Mutex<Vec<std::thread::ThreadId>>,
}

impl KeySource for ThreadRecordingKeys {
    fn generate(&self) -> ProxyResult<KeyPair> {
        self.threads.lock().unwrap().push(std::thread::current().id());
        Ok(KeyPair::generate()?)
    }
}

async fn gateway(
    upstream_ca: &mitm_gateway::tls::CertificateStore,
    hooks: Vec<Arc<dyn Hook>>,
    rules_toml: &str,
) -> Gateway {
    mitm_gateway::utils::try_init_test_tracing();
    spawn_gateway(GatewayOptions {
        upstream_ca,
        control_port: 1,
        rules_toml,
        hooks,
    })
    .await
}

fn text(body: &HookBody) -> &str {
    body.as_text().expect("text body")
}

#[tokio::test]
async fn h2_requests_share_one_pooled_upstream_session() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), true).await;
    let gw = gateway(&ca, Vec::new(), "").await;
    let client = gw.handle.http2_client().expect("client");

    for path in ["/one", "/two"] {
        let response = client
            .send_http2_request(Method::GET, &upstream.url(path), HeaderMap::new(), None, true)
            .await
            .expect("response");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(text(&response.body), format!("upstream GET {path} 0"));
    }

    assert_eq!(upstream.connections(), 1);
    assert_eq!(gw.handle.pool().connect_attempts(), 1);
    assert_eq!(gw.handle.listener_for(&format!("localhost:{}", upstream.port())).unwrap(), gw.handle.primary_addr());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_h2_clients_coalesce_the_upstream_connect() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), true).await;
    let gw = gateway(&ca, Vec::new(), "").await;
    let client = gw.handle.http2_client().expect("client");

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let client = client.clone();
        let url = upstream.url(&format!("/burst/{i}"));
        tasks.spawn(async move {
            client
                .send_http2_request(Method::GET, &url, HeaderMap::new(), None, true)
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let response = joined.expect("join").expect("response");
        assert_eq!(response.status, StatusCode::OK);
    }

    assert_eq!(gw.handle.pool().connect_attempts(), 1);
    assert_eq!(upstream.connections(), 1);
    assert_eq!(upstream.requests(), 8);
}

#[tokio::test]
async fn http1_only_upstream_answers_505_then_goaway() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), false).await;
    let gw = gateway(&ca, Vec::new(), "").await;

    let tls = connect_tls(gw.handle.primary_addr(), "localhost", client_tls(&gw.certs, &[b"h2"])).await;
    let (sender, connection) = h2::client::handshake(tls).await.expect("h2 handshake");
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = closed_tx.send(connection.await);
    });

    let request = Request::get(upstream.url("/legacy")).body(()).unwrap();
    let mut sender = sender.ready().await.expect("ready");
    let (response, _) = sender.send_request(request, true).expect("send");
    let response = response.await.expect("response");
    assert_eq!(response.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
    drop(sender);

    let outcome = timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("gateway closes the session")
        .expect("driver result");
    let err = outcome.expect_err("GOAWAY carries an error code");
    assert_eq!(err.reason(), Some(Reason::HTTP_1_1_REQUIRED));

    let authority = format!("localhost:{}", upstream.port());
    assert_eq!(gw.handle.listener_for(&authority).unwrap(), gw.handle.http1_addr());
    assert_eq!(upstream.requests(), 0);
}

#[tokio::test]
async fn downgrade_lets_sibling_streams_finish_before_goaway() {
    let ca = fast_store();
    let modern = spawn_upstream(ca.clone(), true).await;
    let legacy = spawn_upstream(ca.clone(), false).await;
    let gw = gateway(&ca, vec![Arc::new(Stall)], "").await;

    let tls = connect_tls(gw.handle.primary_addr(), "localhost", client_tls(&gw.certs, &[b"h2"])).await;
    let (sender, connection) = h2::client::handshake(tls).await.expect("h2 handshake");
    let driver = tokio::spawn(connection);

    let mut sender = sender.ready().await.expect("ready");
    let (slow, _) = sender
        .send_request(Request::get(modern.url("/slow")).body(()).unwrap(), true)
        .expect("send slow");
    let mut sender = sender.ready().await.expect("ready");
    let (legacy_response, _) = sender
        .send_request(Request::get(legacy.url("/legacy")).body(()).unwrap(), true)
        .expect("send legacy");
    drop(sender);

    let legacy_response = legacy_response.await.expect("legacy response");
    assert_eq!(legacy_response.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);

    let slow = slow.await.expect("sibling stream survives the downgrade");
    assert_eq!(slow.status(), StatusCode::OK);
    let mut body = slow.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.expect("chunk");
        let _ = body.flow_control().release_capacity(chunk.len());
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"upstream GET /slow 0");

    let err = timeout(Duration::from_secs(5), driver)
        .await
        .expect("gateway closes the session")
        .expect("driver task")
        .expect_err("GOAWAY carries an error code");
    assert_eq!(err.reason(), Some(Reason::HTTP_1_1_REQUIRED));
    assert_eq!(modern.requests(), 1);
}

#[tokio::test]
async fn leaf_certificates_are_minted_off_the_runtime_thread() {
    mitm_gateway::utils::try_init_test_tracing();
    let ca = fast_store();
    let keys = Arc::new(ThreadRecordingKeys::default());
    let authority = CertificateAuthority::generate(&FastKeys).expect("ca");
    let certs = Arc::new(CertificateStore::with_key_source(authority, 64, keys.clone()));
    let gw = spawn_gateway_with_certs(
        GatewayOptions {
            upstream_ca: &ca,
            control_port: 1,
            rules_toml: "",
            hooks: Vec::new(),
        },
        certs,
    )
    .await;

    // The current-thread runtime runs every gateway task on this thread.
    let runtime_thread = std::thread::current().id();
    for _ in 0..2 {
        let tls = connect_tls(
            gw.handle.primary_addr(),
            "fresh.game.test",
            client_tls(&gw.certs, &[b"http/1.1"]),
        )
        .await;
        drop(tls);
    }

    let threads = keys.threads.lock().unwrap().clone();
    assert_eq!(threads.len(), 1, "second handshake reuses the cached leaf");
    assert_ne!(threads[0], runtime_thread);
    assert!(gw.certs.is_cached("fresh.game.test"));
}

#[tokio::test]
async fn one_shot_retries_over_the_http1_bridge() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), false).await;
    let gw = gateway(&ca, Vec::new(), "").await;
    let client = gw.handle.http2_client().expect("client");

    let response = client
        .send_http2_request(
            Method::POST,
            &upstream.url("/bridge"),
            HeaderMap::new(),
            Some(Bytes::from_static(b"payload")),
            true,
        )
        .await
        .expect("response");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(text(&response.body), "upstream POST /bridge 7");
    assert!(gw
        .handle
        .pool()
        .memo()
        .is_http1_only(&format!("https://localhost:{}", upstream.port())));
    assert_eq!(upstream.requests(), 1);
}

#[tokio::test]
async fn http1_client_keeps_alive_using_the_host_header() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), true).await;
    let gw = gateway(&ca, Vec::new(), "").await;

    let tls = connect_tls(
        gw.handle.primary_addr(),
        "localhost",
        client_tls(&gw.certs, &[b"http/1.1"]),
    )
    .await;
    let mut client = H1Client::new(tls);
    assert_eq!(client.negotiated_alpn().as_deref(), Some(&b"http/1.1"[..]));

    let host = format!("localhost:{}", upstream.port());
    let first = client.send(Method::GET, &host, "/a", b"").await;
    assert_eq!(first.status, 200);
    assert_eq!(first.text(), "upstream GET /a 0");

    let second = client.send(Method::POST, &host, "/b", b"hello").await;
    assert_eq!(second.status, 200);
    assert_eq!(second.text(), "upstream POST /b 5");

    // HTTP/1.1 clients always get a fresh HTTP/1.1 upstream socket.
    assert_eq!(upstream.connections(), 2);
    assert_eq!(gw.handle.pool().connect_attempts(), 0);
}

#[tokio::test]
async fn http1_listener_never_negotiates_h2() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), false).await;
    let gw = gateway(&ca, Vec::new(), "").await;

    let tls = connect_tls(
        gw.handle.http1_addr(),
        "localhost",
        client_tls(&gw.certs, &[b"h2", b"http/1.1"]),
    )
    .await;
    let mut client = H1Client::new(tls);
    assert_eq!(client.negotiated_alpn().as_deref(), Some(&b"http/1.1"[..]));

    let response = client
        .send(Method::GET, &format!("localhost:{}", upstream.port()), "/plain", b"")
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "upstream GET /plain 0");
}

#[tokio::test]
async fn fake_rule_never_touches_the_upstream() {
    let ca = fast_store();
    let (sink, connections, bytes) = spawn_sink().await;
    let rules = format!(
        r#"
        [[hooks.rules]]
        name = "block"
        url_prefix = "https://localhost:{port}/blocked"
        action = "fake"
        status = 418
        body = "blocked"
        "#,
        port = sink.port()
    );
    let gw = gateway(&ca, Vec::new(), &rules).await;
    let client = gw.handle.http2_client().expect("client");

    let response = client
        .send_http2_request(
            Method::POST,
            &format!("https://localhost:{}/blocked/report", sink.port()),
            HeaderMap::new(),
            Some(Bytes::from_static(b"crash dump")),
            true,
        )
        .await
        .expect("response");

    assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
    assert_eq!(text(&response.body), "blocked");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 0);
    assert_eq!(bytes.load(Ordering::SeqCst), 0);
    assert_eq!(gw.handle.pool().connect_attempts(), 0);
}

#[tokio::test]
async fn only_intercepting_hooks_receive_decoded_responses() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), true).await;
    let recorder = Arc::new(Recorder::default());
    let gw = gateway(&ca, vec![recorder.clone() as Arc<dyn Hook>], "").await;
    let client = gw.handle.http2_client().expect("client");

    let passed = client
        .send_http2_request(Method::GET, &upstream.url("/passed"), HeaderMap::new(), None, true)
        .await
        .expect("passed");
    assert_eq!(passed.status, StatusCode::OK);
    assert!(recorder.responses.lock().unwrap().is_empty());

    let watched = client
        .send_http2_request(
            Method::POST,
            &upstream.url("/watched/gzip"),
            HeaderMap::new(),
            Some(Bytes::from_static(b"ping")),
            true,
        )
        .await
        .expect("watched");
    assert_eq!(watched.status, StatusCode::OK);
    assert_eq!(text(&watched.body), "upstream POST /watched/gzip 4");

    let requests = recorder.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1], Some(HookBody::Text("ping".into())));

    let responses = recorder.responses.lock().unwrap().clone();
    assert_eq!(responses.len(), 1);
    let (status, body) = &responses[0];
    assert_eq!(*status, StatusCode::OK);
    assert_eq!(
        body.as_ref().and_then(HookBody::as_text),
        Some("upstream POST /watched/gzip 4")
    );
}

#[tokio::test]
async fn fail_closed_hook_error_answers_500() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), true).await;
    let gw = gateway(&ca, vec![Arc::new(Broken { fail_closed: true }) as Arc<dyn Hook>], "").await;
    let client = gw.handle.http2_client().expect("client");

    let response = client
        .send_http2_request(Method::GET, &upstream.url("/guarded"), HeaderMap::new(), None, true)
        .await
        .expect("response");
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(upstream.requests(), 0);
}

#[tokio::test]
async fn failing_hook_is_skipped_when_fail_open() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), true).await;
    let gw = gateway(&ca, vec![Arc::new(Broken { fail_closed: false }) as Arc<dyn Hook>], "").await;
    let client = gw.handle.http2_client().expect("client");

    let response = client
        .send_http2_request(Method::GET, &upstream.url("/open"), HeaderMap::new(), None, true)
        .await
        .expect("response");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(text(&response.body), "upstream GET /open 0");
}

#[tokio::test]
async fn hook_replacement_rewrites_the_upstream_path() {
    let ca = fast_store();
    let upstream = spawn_upstream(ca.clone(), true).await;
    let gw = gateway(&ca, vec![Arc::new(Rewriter) as Arc<dyn Hook>], "").await;
    let client = gw.handle.http2_client().expect("client");

    let response = client
        .send_http2_request(Method::GET, &upstream.url("/old/profile"), HeaderMap::new(), None, true)
        .await
        .expect("response");
    assert_eq!(text(&response.body), "upstream GET /rewritten 0");
}

#[tokio::test]
async fn control_hostname_goes_to_the_control_listener_without_hooks() {
    mitm_gateway::utils::try_init_test_tracing();
    let ca = fast_store();
    let control = spawn_control().await;
    let recorder = Arc::new(Recorder::default());
    let gw = spawn_gateway(GatewayOptions {
        upstream_ca: &ca,
        control_port: control.port(),
        rules_toml: "",
        hooks: vec![recorder.clone() as Arc<dyn Hook>],
    })
    .await;
    let client = gw.handle.http2_client().expect("client");

    let response = client
        .send_http2_request(Method::GET, "https://gateway.local/watched/status", HeaderMap::new(), None, true)
        .await
        .expect("response");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(text(&response.body), "control GET /watched/status 0");
    assert_eq!(recorder.matches.load(Ordering::SeqCst), 0);
    assert_eq!(control.requests(), 1);
}

#[tokio::test]
async fn requests_for_the_gateway_itself_get_a_benign_answer() {
    let ca = fast_store();
    let gw = gateway(&ca, Vec::new(), "").await;
    let client = gw.handle.http2_client().expect("client");

    let url = format!("https://localhost:{}/", gw.handle.primary_addr().port());
    let response = client
        .send_http2_request(Method::GET, &url, HeaderMap::new(), None, true)
        .await
        .expect("response");
    assert_eq!(response.status, StatusCode::OK);
    assert!(text(&response.body).contains("this is the local server"));
}

#[tokio::test]
async fn plaintext_on_the_mitm_listener_gets_400() {
    let ca = fast_store();
    let gw = gateway(&ca, Vec::new(), "").await;

    let mut socket = TcpStream::connect(gw.handle.primary_addr()).await.expect("connect");
    socket
        .write_all(b"GET / HTTP/1.1\r\nhost: example.test\r\n\r\n")
        .await
        .expect("write");
    let mut raw = String::new();
    timeout(Duration::from_secs(5), socket.read_to_string(&mut raw))
        .await
        .expect("server closes")
        .expect("read");
    assert!(raw.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn probe_http2_reports_upstream_support() {
    let ca = fast_store();
    let h2 = spawn_upstream(ca.clone(), true).await;
    let h1 = spawn_upstream(ca.clone(), false).await;
    let gw = gateway(&ca, Vec::new(), "").await;

    assert!(gw.handle.probe_http2(&format!("localhost:{}", h2.port())).await.unwrap());
    assert!(!gw.handle.probe_http2(&format!("localhost:{}", h1.port())).await.unwrap());
    assert_eq!(
        gw.handle.listener_for(&format!("localhost:{}", h1.port())).unwrap(),
        gw.handle.http1_addr()
    );
}
