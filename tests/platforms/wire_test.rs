//! Wire requests built by the adapters, exercised through the registry.

use simstim::credential::CredentialPayload;
use simstim::platforms::{self, PlatformId, StreamState};
use simstim::schema::{ChatMessage, ChatRequest, FinishReason};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn payload_for(id: PlatformId) -> CredentialPayload {
    CredentialPayload::from_cookies(
        platforms::descriptor(id)
            .required_cookies
            .iter()
            .map(|name| ((*name).to_owned(), format!("{name}-value"))),
    )
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> &'a str {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
        .unwrap_or_else(|| panic!("header {name} missing"))
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

#[test]
fn every_adapter_sends_its_cookies_and_browser_headers() {
    for id in PlatformId::ALL {
        let adapter = platforms::adapter(id);
        let descriptor = platforms::descriptor(id);
        let payload = payload_for(id);
        let wire = adapter
            .build_chat_request(&payload, &ChatRequest::from_prompt("hello"))
            .unwrap();

        let cookie = header(&wire.headers, "Cookie");
        for required in descriptor.required_cookies {
            assert!(
                cookie.contains(&format!("{required}={required}-value")),
                "{id} cookie header lacks {required}"
            );
        }
        assert_eq!(header(&wire.headers, "Origin"), descriptor.origin);
        assert_eq!(header(&wire.headers, "Referer"), descriptor.referer);
        assert!(!header(&wire.headers, "User-Agent").is_empty());
        assert!(wire.url.starts_with("https://"), "{id} wire url not https");
    }
}

#[test]
fn the_harvested_user_agent_wins_over_the_default() {
    let mut payload = payload_for(PlatformId::ChatQwen);
    payload.user_agent = Some("Mozilla/5.0 (harvested)".to_owned());
    let wire = platforms::adapter(PlatformId::ChatQwen)
        .build_chat_request(&payload, &ChatRequest::from_prompt("hi"))
        .unwrap();
    assert_eq!(
        header(&wire.headers, "User-Agent"),
        "Mozilla/5.0 (harvested)"
    );
}

// ---------------------------------------------------------------------------
// Model resolution
// ---------------------------------------------------------------------------

#[test]
fn model_override_wins_and_absence_falls_back_to_the_default() {
    let descriptor = platforms::descriptor(PlatformId::ChatQwen);

    let mut request = ChatRequest::from_prompt("hi");
    assert_eq!(descriptor.resolve_model(&request), descriptor.default_model);

    request.model = Some("qwen-turbo".to_owned());
    assert_eq!(descriptor.resolve_model(&request), "qwen-turbo");

    request.model = Some(String::new());
    assert_eq!(descriptor.resolve_model(&request), descriptor.default_model);
}

// ---------------------------------------------------------------------------
// Stream-only platforms
// ---------------------------------------------------------------------------

#[test]
fn doubao_always_streams_on_the_wire_regardless_of_the_request() {
    let payload = payload_for(PlatformId::Doubao);
    let request = ChatRequest::from_prompt("hello");
    assert!(!request.stream);

    let wire = platforms::adapter(PlatformId::Doubao)
        .build_chat_request(&payload, &request)
        .unwrap();
    assert!(wire.stream);
    assert_eq!(wire.body["stream"], true);
}

#[test]
fn chatqwen_wire_stream_flag_follows_the_request() {
    let payload = payload_for(PlatformId::ChatQwen);
    let adapter = platforms::adapter(PlatformId::ChatQwen);

    let buffered = adapter
        .build_chat_request(&payload, &ChatRequest::from_prompt("hi"))
        .unwrap();
    assert!(!buffered.stream);

    let mut streaming = ChatRequest::from_prompt("hi");
    streaming.stream = true;
    let wire = adapter.build_chat_request(&payload, &streaming).unwrap();
    assert!(wire.stream);
}

// ---------------------------------------------------------------------------
// Conversation flattening
// ---------------------------------------------------------------------------

#[test]
fn multi_turn_conversations_flatten_with_role_prefixes_for_doubao() {
    let payload = payload_for(PlatformId::Doubao);
    let request = ChatRequest {
        messages: vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("what is 2+2?"),
        ],
        model: None,
        stream: false,
        temperature: None,
        max_tokens: None,
    };
    let wire = platforms::adapter(PlatformId::Doubao)
        .build_chat_request(&payload, &request)
        .unwrap();
    let input = wire.body["user_input"].as_str().unwrap();
    assert!(input.contains("be brief"));
    assert!(input.contains("what is 2+2?"));
}

// ---------------------------------------------------------------------------
// Stream payload parsing through the registry
// ---------------------------------------------------------------------------

#[test]
fn streaming_adapters_skip_unrecognized_frames_rather_than_failing() {
    for id in PlatformId::ALL {
        let adapter = platforms::adapter(id);
        let mut streaming = ChatRequest::from_prompt("hi");
        streaming.stream = true;
        let wire = adapter
            .build_chat_request(&payload_for(id), &streaming)
            .unwrap();
        if !wire.stream {
            // Buffered-only platform; stream parsing is never reached.
            continue;
        }
        let mut state = StreamState::new();
        // Heartbeat-ish noise no platform claims.
        let parsed = adapter.parse_stream_payload("{}", &mut state).unwrap();
        assert!(
            parsed.is_none() || parsed.is_some_and(|chunk| chunk.delta.is_empty()),
            "{id} invented content from an empty frame"
        );
    }
}

#[test]
fn chatqwen_stream_finish_reason_maps_to_the_canonical_enum() {
    let mut state = StreamState::new();
    let chunk = platforms::adapter(PlatformId::ChatQwen)
        .parse_stream_payload(
            r#"{"choices":[{"delta":{"content":""},"finish_reason":"length"}]}"#,
            &mut state,
        )
        .unwrap()
        .unwrap();
    assert_eq!(chunk.finish_reason, Some(FinishReason::Length));
}
