//! End-to-end tests for the transport session against a mocked backend and
//! a local live-channel server.

mod common;

use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    drain, fast_config, flaky_channel, refusing_channel, wait_for_event, ChannelServer, Seen,
};
use live_transcribe::{BackendClient, RealtimeClient, SessionEvent, SessionStatus};

async fn mount_create(server: &MockServer, join_url: Option<&str>) {
    let mut body = json!({ "sessionId": "b-1", "taskId": "t-1" });
    if let Some(url) = join_url {
        body["meetingJoinUrl"] = json!(url);
    }

    Mock::given(method("POST"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_complete(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/sessions/b-1/complete"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(server)
        .await;
}

fn spawn_client(server: &MockServer) -> (RealtimeClient, live_transcribe::EventReceiver) {
    let config = fast_config(server.uri());
    let backend = BackendClient::new(&config).unwrap();
    RealtimeClient::spawn("meeting-1", config, backend)
}

#[tokio::test]
async fn test_audio_before_ready_is_flushed_in_order() {
    let backend = MockServer::start().await;
    let mut channel = ChannelServer::start().await;
    mount_create(&backend, Some(&channel.url)).await;

    let (client, _events) = spawn_client(&backend);

    // Submitted before the task even exists
    let first: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let second = vec![0xAB; 10];
    client.send_audio(first.clone());
    client.send_audio(second.clone());

    assert!(client.create_task(Some("Weekly sync")).await);
    assert!(client.connect().await);
    assert_eq!(client.status(), SessionStatus::Transcribing);

    let third = vec![0xCD; 3000];
    client.send_audio(third.clone());

    assert_eq!(channel.next_seen().await, Seen::Connected);
    let Seen::Text(start) = channel.next_seen().await else {
        panic!("expected the start command before any audio");
    };
    let start: serde_json::Value = serde_json::from_str(&start).unwrap();
    assert_eq!(start["header"]["name"], "StartTranscription");
    assert_eq!(start["header"]["task_id"], "t-1");

    let frames = channel.binary_until(8010).await;
    assert!(frames.iter().all(|f| f.len() <= 4096));
    assert_eq!(frames.concat(), [first, second, third].concat());
}

#[tokio::test]
async fn test_inbound_messages_become_events() {
    let backend = MockServer::start().await;
    let mut channel = ChannelServer::start().await;
    mount_create(&backend, Some(&channel.url)).await;

    let (client, mut events) = spawn_client(&backend);
    assert!(client.create_task(None).await);
    assert!(client.connect().await);
    assert_eq!(channel.next_seen().await, Seen::Connected);

    channel.push("TranscriptionStarted", json!({}));
    channel.push_raw("{ this is not json");
    channel.push("SomethingNew", json!({ "result": "ignored" }));
    channel.push("SentenceBegin", json!({ "index": 1 }));
    channel.push(
        "TranscriptionResultChanged",
        json!({ "index": 1, "result": "hel" }),
    );
    channel.push(
        "SentenceEnd",
        json!({ "index": 1, "result": "hello", "begin_time": 120, "end_time": 980, "confidence": 0.8 }),
    );
    channel.push(
        "SentenceEnd",
        json!({ "index": 2, "result": "again", "begin_time": 50, "end_time": 60 }),
    );
    channel.push(
        "TranscriptionResultChanged",
        json!({ "index": 3, "result": "um" }),
    );
    channel.push("SentenceEnd", json!({ "index": 3, "result": "" }));
    channel.push("TaskFailed", json!({ "result": "quota exceeded" }));

    assert_eq!(
        wait_for_event(&mut events, |e| *e == SessionEvent::Started).await,
        SessionEvent::Started
    );
    assert_eq!(
        wait_for_event(&mut events, |e| !matches!(e, SessionEvent::Status(_))).await,
        SessionEvent::SegmentBegin
    );
    assert_eq!(
        wait_for_event(&mut events, |_| true).await,
        SessionEvent::Interim {
            text: "hel".to_string(),
            index: 1
        }
    );
    assert_eq!(client.interim_text(), Some("hel".to_string()));

    let SessionEvent::Segment(first) = wait_for_event(&mut events, |_| true).await else {
        panic!("expected a segment");
    };
    assert_eq!(first.id, "seg-meeting-1-0");
    assert_eq!(first.text, "hello");
    assert_eq!((first.start_ms, first.end_ms), (120, 980));
    assert!(first.is_final);
    assert_eq!(client.interim_text(), None);

    // Ids follow arrival order even when offsets go backwards
    let SessionEvent::Segment(second) = wait_for_event(&mut events, |_| true).await else {
        panic!("expected a segment");
    };
    assert_eq!(second.id, "seg-meeting-1-1");
    assert_eq!(second.confidence, 0.9);

    // A sentence that ends empty voids the hypothesis without a segment
    assert_eq!(
        wait_for_event(&mut events, |_| true).await,
        SessionEvent::Interim {
            text: "um".to_string(),
            index: 3
        }
    );
    assert_eq!(
        wait_for_event(&mut events, |_| true).await,
        SessionEvent::InterimCleared
    );
    assert_eq!(client.interim_text(), None);

    assert_eq!(
        wait_for_event(&mut events, |_| true).await,
        SessionEvent::Error("quota exceeded".to_string())
    );

    // A task failure alone does not end the session
    assert_eq!(client.status(), SessionStatus::Transcribing);
}

#[tokio::test]
async fn test_stop_sends_stop_command_and_completes_session() {
    let backend = MockServer::start().await;
    let mut channel = ChannelServer::start().await;
    mount_create(&backend, Some(&channel.url)).await;
    mount_complete(&backend).await;

    let (client, mut events) = spawn_client(&backend);
    assert!(client.create_task(None).await);
    assert!(client.connect().await);

    channel.push(
        "TranscriptionResultChanged",
        json!({ "index": 1, "result": "unfinished" }),
    );
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::Interim { .. })).await;
    assert_eq!(client.interim_text(), Some("unfinished".to_string()));

    client.stop().await;
    assert_eq!(client.status(), SessionStatus::Stopped);
    assert_eq!(client.interim_text(), None);

    let mut names = Vec::new();
    loop {
        match channel.next_seen().await {
            Seen::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                names.push(value["header"]["name"].as_str().unwrap().to_string());
            }
            Seen::Closed => break,
            _ => {}
        }
    }
    assert_eq!(names, vec!["StartTranscription", "StopTranscription"]);

    wait_for_event(&mut events, |e| *e == SessionEvent::Status(SessionStatus::Stopped)).await;

    // Idempotent, and audio after stop goes nowhere
    client.stop().await;
    client.send_audio(vec![1, 2, 3]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.status(), SessionStatus::Stopped);
}

#[tokio::test]
async fn test_missing_join_address_uses_http_audio_and_polling() {
    let backend = MockServer::start().await;
    mount_create(&backend, None).await;

    Mock::given(method("POST"))
        .and(path("/sessions/b-1/audio"))
        .and(body_json(json!({ "chunk": "AQID" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backend)
        .await;

    Mock::given(method("GET"))
        .and(path("/sessions/b-1/transcripts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "segments": [{ "text": "a" }, { "text": "b" }]
        })))
        .up_to_n_times(1)
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/b-1/transcripts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "segments": [{ "text": "a" }, { "text": "b" }, { "content": "c", "begin_time": 40 }]
        })))
        .mount(&backend)
        .await;

    let (client, mut events) = spawn_client(&backend);
    assert!(client.create_task(None).await);
    assert!(client.connect().await);
    assert!(client.session().is_degraded());
    assert_eq!(client.status(), SessionStatus::Connected);

    client.send_audio(vec![1, 2, 3]);

    let mut texts = Vec::new();
    while texts.len() < 3 {
        if let SessionEvent::Segment(segment) =
            wait_for_event(&mut events, |e| matches!(e, SessionEvent::Segment(_))).await
        {
            texts.push(segment.text);
        }
    }
    assert_eq!(texts, vec!["a", "b", "c"]);

    // Later polls return the same set and emit nothing new
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Segment(_))));
}

#[tokio::test]
async fn test_reconnect_gives_up_after_three_attempts() {
    let backend = MockServer::start().await;
    let (join_url, attempts) = refusing_channel().await;
    mount_create(&backend, Some(&join_url)).await;
    mount_complete(&backend).await;

    let (client, mut events) = spawn_client(&backend);
    assert!(client.create_task(None).await);

    // Initial attempt plus three retries at 20, 40 and 60 ms
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(client.status(), SessionStatus::Connecting);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Error(_))));

    client.stop().await;
    assert_eq!(client.status(), SessionStatus::Stopped);
}

#[tokio::test]
async fn test_reconnect_bound_spans_successful_opens() {
    let backend = MockServer::start().await;
    let (join_url, opened) = flaky_channel().await;
    mount_create(&backend, Some(&join_url)).await;
    mount_complete(&backend).await;

    let (client, _events) = spawn_client(&backend);
    assert!(client.create_task(None).await);

    // Every channel opens and then drops: the first open plus three reconnects
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(opened.load(Ordering::SeqCst), 4);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(opened.load(Ordering::SeqCst), 4);

    client.stop().await;
    assert_eq!(client.status(), SessionStatus::Stopped);
}

#[tokio::test]
async fn test_audio_during_outage_is_flushed_in_order_after_reopen() {
    let backend = MockServer::start().await;
    let mut channel = ChannelServer::closing_after(2).await;
    mount_create(&backend, Some(&channel.url)).await;

    let mut config = fast_config(backend.uri());
    config.reconnect_base_delay_ms = 300;
    let http = BackendClient::new(&config).unwrap();
    let (client, _events) = RealtimeClient::spawn("meeting-1", config, http);
    assert!(client.create_task(None).await);
    assert!(client.connect().await);

    // Two frames reach the first channel, then the server drops it
    let before = vec![0x11; 8192];
    client.send_audio(before.clone());
    assert_eq!(channel.next_seen().await, Seen::Connected);
    assert!(matches!(channel.next_seen().await, Seen::Text(_)));
    assert_eq!(channel.binary_until(8192).await.concat(), before);
    assert_eq!(channel.next_seen().await, Seen::Closed);

    // Well inside the 300 ms reconnect delay
    tokio::time::sleep(Duration::from_millis(100)).await;
    let during: Vec<Vec<u8>> = (1..=3u8).map(|i| vec![i; 3000]).collect();
    for buffer in &during {
        client.send_audio(buffer.clone());
    }

    assert_eq!(channel.next_seen().await, Seen::Connected);
    let Seen::Text(start) = channel.next_seen().await else {
        panic!("expected the start command before queued audio");
    };
    assert!(start.contains("StartTranscription"));

    let frames = channel.binary_until(9000).await;
    assert!(frames.iter().all(|f| f.len() <= 4096));
    assert_eq!(frames.concat(), during.concat());

    // The queue went out once; new audio follows directly
    let after = vec![0x22; 10];
    client.send_audio(after.clone());
    assert_eq!(channel.binary_until(10).await.concat(), after);
    assert_eq!(client.status(), SessionStatus::Transcribing);
}

#[tokio::test]
async fn test_failed_task_creation() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&backend)
        .await;

    let (client, mut events) = spawn_client(&backend);
    assert!(!client.create_task(None).await);
    assert!(!client.connect().await);
    assert_eq!(client.status(), SessionStatus::Error);

    let SessionEvent::Error(message) =
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::Error(_))).await
    else {
        unreachable!()
    };
    assert!(message.contains("503"));
}
