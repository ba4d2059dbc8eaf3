//! Chat dispatch against a local stub platform, exercising the quota and
//! expiry contract end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;

use simstim::cipher::{CredentialCipher, MasterSecret};
use simstim::credential::{Credential, CredentialPayload};
use simstim::dispatch::{ChatOutcome, DispatchError, RequestDispatcher, UnusableReason};
use simstim::platforms::{self, PlatformId};
use simstim::schema::{ChatRequest, FinishReason};
use simstim::store::{CredentialStore, MemoryStore};

const SECRET: &str = "an adequately long master secret";

// ---------------------------------------------------------------------------
// Stub platform
// ---------------------------------------------------------------------------

/// Local HTTP endpoint answering canned replies in order, counting every
/// accepted connection so tests can assert that no network call was made.
struct StubPlatform {
    url: String,
    hits: Arc<AtomicUsize>,
}

impl StubPlatform {
    async fn serve(replies: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            let mut canned = replies.into_iter();
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = canned
                    .next()
                    .unwrap_or_else(|| json_reply("500 Internal Server Error", "{}"));
                drain_request(&mut socket).await;
                socket.write_all(reply.as_bytes()).await.ok();
                socket.shutdown().await.ok();
            }
        });
        Self { url, hits }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Read the request head plus `Content-Length` bytes of body, so the reply
/// is not written into a half-sent request.
async fn drain_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let header_end = loop {
        let Ok(n) = socket.read(&mut tmp).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body_have = buf.len().saturating_sub(header_end.saturating_add(4));
    while body_have < content_length {
        let Ok(n) = socket.read(&mut tmp).await else {
            return;
        };
        if n == 0 {
            return;
        }
        body_have = body_have.saturating_add(n);
    }
}

fn json_reply(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn sse_reply(frames: &[&str]) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn redirect_reply(location: &str) -> String {
    format!(
        "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    cipher: Arc<CredentialCipher>,
    dispatcher: RequestDispatcher,
}

fn harness(endpoint: &str) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let secret = MasterSecret::new(SECRET).unwrap();
    let cipher = Arc::new(CredentialCipher::new(&secret).unwrap());
    let dispatcher = RequestDispatcher::new(
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        Arc::clone(&cipher),
    )
    .unwrap()
    .override_endpoint(endpoint);
    Harness {
        store,
        cipher,
        dispatcher,
    }
}

/// A freshly issued credential carrying every cookie the platform requires.
fn sample_credential(
    cipher: &CredentialCipher,
    owner: &str,
    platform: PlatformId,
    quota_limit: u64,
) -> Credential {
    let cookies: Vec<(String, String)> = platforms::descriptor(platform)
        .required_cookies
        .iter()
        .map(|name| ((*name).to_owned(), format!("{name}-value")))
        .collect();
    let blob = cipher.encrypt(&CredentialPayload::from_cookies(cookies)).unwrap();
    Credential::fresh(owner, platform, blob, quota_limit)
}

async fn stored(h: &Harness, owner: &str, platform: PlatformId) -> Credential {
    h.store.get(owner, platform).await.unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_buffered_reply_lands_with_quota_charged_and_logged() {
    let stub = StubPlatform::serve(vec![json_reply(
        "200 OK",
        r#"{"choices":[{"message":{"content":"Milan Kundera"},"finish_reason":"stop"}],"model":"qwen-max","usage":{"prompt_tokens":12,"completion_tokens":34}}"#,
    )])
    .await;
    let h = harness(&stub.url);
    let credential = sample_credential(&h.cipher, "ann", PlatformId::ChatQwen, 100_000);
    h.store.upsert(&credential).await.unwrap();

    let request = ChatRequest::from_prompt("who wrote the unbearable lightness of being");
    let outcome = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, request)
        .await
        .unwrap();
    let ChatOutcome::Complete(reply) = outcome else {
        panic!("expected a buffered reply");
    };
    assert_eq!(reply.content, "Milan Kundera");
    assert_eq!(reply.finish_reason, FinishReason::Stop);
    let usage = reply.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 12);
    assert_eq!(usage.completion_tokens, 34);

    let after = stored(&h, "ann", PlatformId::ChatQwen).await;
    assert_eq!(after.quota_used, 46);
    assert!(!after.is_expired);
    assert!(after.last_used_at.is_some());

    let log = h.store.recent_usage("ann", None, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, "ok");
    assert_eq!(log[0].usage.total(), 46);
    assert_eq!(log[0].model, "qwen-max");
    assert_eq!(stub.hits(), 1);
}

#[tokio::test]
async fn a_streamed_reply_settles_quota_when_the_stream_ends() {
    let stub = StubPlatform::serve(vec![sse_reply(&[
        r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
        r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
        r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7}}"#,
    ])])
    .await;
    let h = harness(&stub.url);
    let credential = sample_credential(&h.cipher, "ann", PlatformId::ChatQwen, 100_000);
    h.store.upsert(&credential).await.unwrap();

    let mut request = ChatRequest::from_prompt("say hello");
    request.stream = true;
    let outcome = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, request)
        .await
        .unwrap();
    let ChatOutcome::Stream(mut stream) = outcome else {
        panic!("expected a chunk stream");
    };

    let mut content = String::new();
    let mut finish = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        content.push_str(&chunk.delta);
        if let Some(reason) = chunk.finish_reason {
            finish = Some(reason);
        }
    }
    assert_eq!(content, "Hello");
    assert_eq!(finish, Some(FinishReason::Stop));

    // The sender half is dropped only after settlement, so a drained stream
    // implies the counters are final.
    let after = stored(&h, "ann", PlatformId::ChatQwen).await;
    assert_eq!(after.quota_used, 12);
    let log = h.store.recent_usage("ann", None, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, "ok");
    assert_eq!(log[0].usage.total(), 12);
}

#[tokio::test]
async fn a_wire_streaming_platform_still_answers_buffered_callers() {
    let stub = StubPlatform::serve(vec![sse_reply(&[
        r#"{"text":"case "}"#,
        r#"{"text":"closed","is_finish":true}"#,
    ])])
    .await;
    let h = harness(&stub.url);
    let credential = sample_credential(&h.cipher, "ann", PlatformId::Doubao, 100_000);
    h.store.upsert(&credential).await.unwrap();

    let outcome = h
        .dispatcher
        .chat("ann", PlatformId::Doubao, ChatRequest::from_prompt("hey"))
        .await
        .unwrap();
    let ChatOutcome::Complete(reply) = outcome else {
        panic!("expected the stream to be aggregated for a buffered caller");
    };
    assert_eq!(reply.content, "case closed");
    assert_eq!(reply.finish_reason, FinishReason::Stop);

    // Doubao reports no usage, so tokens are estimated from characters.
    let usage = reply.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 1);
    assert_eq!(usage.completion_tokens, 2);
    let after = stored(&h, "ann", PlatformId::Doubao).await;
    assert_eq!(after.quota_used, 3);
}

#[tokio::test]
async fn a_rejection_flips_the_credential_and_then_fails_fast() {
    let stub = StubPlatform::serve(vec![json_reply(
        "401 Unauthorized",
        r#"{"error":"session expired"}"#,
    )])
    .await;
    let h = harness(&stub.url);
    let credential = sample_credential(&h.cipher, "ann", PlatformId::ChatQwen, 100_000);
    h.store.upsert(&credential).await.unwrap();

    let err = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, ChatRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::CredentialExpired));
    assert!(stored(&h, "ann", PlatformId::ChatQwen).await.is_expired);

    let log = h.store.recent_usage("ann", None, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, "expired");
    assert_eq!(log[0].usage.total(), 0);

    // The flip is durable: the retry is rejected before any network call.
    let err = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, ChatRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::CredentialUnusable {
            reason: UnusableReason::Expired
        }
    ));
    assert_eq!(stub.hits(), 1);
}

#[tokio::test]
async fn a_login_wall_redirect_counts_as_rejection() {
    let stub = StubPlatform::serve(vec![redirect_reply(
        "https://www.doubao.com/login?next=%2Fchat",
    )])
    .await;
    let h = harness(&stub.url);
    let credential = sample_credential(&h.cipher, "ann", PlatformId::Doubao, 100_000);
    h.store.upsert(&credential).await.unwrap();

    let err = h
        .dispatcher
        .chat("ann", PlatformId::Doubao, ChatRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::CredentialExpired));
    assert!(stored(&h, "ann", PlatformId::Doubao).await.is_expired);
}

#[tokio::test]
async fn unusable_credentials_are_rejected_without_any_network_call() {
    let stub = StubPlatform::serve(Vec::new()).await;
    let h = harness(&stub.url);

    // Nothing stored at all.
    let err = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, ChatRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::CredentialUnusable {
            reason: UnusableReason::NotFound
        }
    ));

    // Stored but already marked expired.
    let mut credential = sample_credential(&h.cipher, "ann", PlatformId::ChatQwen, 100_000);
    credential.is_expired = true;
    h.store.upsert(&credential).await.unwrap();
    let err = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, ChatRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::CredentialUnusable {
            reason: UnusableReason::Expired
        }
    ));

    // Stored but out of allowance.
    let mut credential = sample_credential(&h.cipher, "bob", PlatformId::ChatQwen, 500);
    credential.quota_used = 500;
    h.store.upsert(&credential).await.unwrap();
    let err = h
        .dispatcher
        .chat("bob", PlatformId::ChatQwen, ChatRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::CredentialUnusable {
            reason: UnusableReason::QuotaExhausted
        }
    ));

    assert_eq!(stub.hits(), 0);
    assert!(h.store.recent_usage("ann", None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn crossing_the_allowance_marks_the_credential_expired() {
    let stub = StubPlatform::serve(vec![json_reply(
        "200 OK",
        r#"{"choices":[{"message":{"content":"over the line"},"finish_reason":"stop"}],"usage":{"prompt_tokens":6,"completion_tokens":6}}"#,
    )])
    .await;
    let h = harness(&stub.url);
    let credential = sample_credential(&h.cipher, "ann", PlatformId::ChatQwen, 10);
    h.store.upsert(&credential).await.unwrap();

    // The crossing call itself still succeeds; only later calls are barred.
    let outcome = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, ChatRequest::from_prompt("hi"))
        .await
        .unwrap();
    assert!(matches!(outcome, ChatOutcome::Complete(_)));

    let after = stored(&h, "ann", PlatformId::ChatQwen).await;
    assert_eq!(after.quota_used, 12);
    assert!(after.is_expired);

    let err = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, ChatRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::CredentialUnusable {
            reason: UnusableReason::Expired
        }
    ));
    assert_eq!(stub.hits(), 1);
}

#[tokio::test]
async fn an_upstream_error_charges_nothing() {
    let stub = StubPlatform::serve(vec![json_reply(
        "500 Internal Server Error",
        r#"{"error":"overloaded"}"#,
    )])
    .await;
    let h = harness(&stub.url);
    let credential = sample_credential(&h.cipher, "ann", PlatformId::ChatQwen, 100_000);
    h.store.upsert(&credential).await.unwrap();

    let err = h
        .dispatcher
        .chat("ann", PlatformId::ChatQwen, ChatRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    let DispatchError::Upstream { status, .. } = err else {
        panic!("expected an upstream error, got {err:?}");
    };
    assert_eq!(status, 500);

    let after = stored(&h, "ann", PlatformId::ChatQwen).await;
    assert_eq!(after.quota_used, 0);
    assert!(!after.is_expired);
    let log = h.store.recent_usage("ann", None, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, "error");
    assert_eq!(log[0].usage.total(), 0);
    assert!(log[0].error.is_some());
}
