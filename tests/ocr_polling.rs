mod support;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use redink::models::essay::ImagePayload;
use redink::services::error::ProcessingError;
use redink::services::ocr::OcrClient;

use support::{OcrScript, OcrStub};

fn sample_image() -> ImagePayload {
    ImagePayload {
        bytes: vec![0xFF, 0xD8, 0xFF, 0xE0],
        mime: "image/jpeg".to_string(),
        filename: "essay.jpg".to_string(),
        source_path: None,
    }
}

#[tokio::test]
async fn transcript_ready_after_three_polls() {
    let stub = OcrStub::start(OcrScript { pending_polls: 2, ..OcrScript::default() }).await;
    let client = OcrClient::new(stub.settings(), None).expect("client");

    let transcript =
        client.transcribe(&sample_image(), &CancellationToken::new()).await.expect("transcript");

    assert_eq!(transcript, "Hello\n\nWorld");
    assert_eq!(stub.uploads(), 1);
    assert_eq!(stub.polls(), 3);
}

#[tokio::test]
async fn rate_limited_poll_waits_at_least_retry_after() {
    let stub =
        OcrStub::start(OcrScript { rate_limit_first: Some(1), ..OcrScript::default() }).await;
    let client = OcrClient::new(stub.settings(), None).expect("client");

    let started = Instant::now();
    let transcript =
        client.transcribe(&sample_image(), &CancellationToken::new()).await.expect("transcript");

    assert_eq!(transcript, "Hello\n\nWorld");
    // The 429 came with Retry-After: 1, so the second poll waited a full
    // second even though the base delay is 10ms.
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(stub.polls(), 2);
}

#[tokio::test]
async fn exhausted_attempt_budget_names_the_document() {
    let stub = OcrStub::start(OcrScript { never_complete: true, ..OcrScript::default() }).await;
    let mut settings = stub.settings();
    settings.max_poll_attempts = 3;

    let client = OcrClient::new(settings, None).expect("client");
    let err = client
        .transcribe(&sample_image(), &CancellationToken::new())
        .await
        .expect_err("should time out");

    match err {
        ProcessingError::OcrTimeout { document_id } => assert_eq!(document_id, "doc-123"),
        other => panic!("expected timeout, got {other}"),
    }
    assert_eq!(stub.polls(), 3);
}

#[tokio::test]
async fn exhausted_wall_clock_budget_names_the_document() {
    let stub = OcrStub::start(OcrScript { never_complete: true, ..OcrScript::default() }).await;
    let mut settings = stub.settings();
    settings.wall_clock_cap = Duration::from_millis(50);

    let client = OcrClient::new(settings, None).expect("client");
    let err = client
        .transcribe(&sample_image(), &CancellationToken::new())
        .await
        .expect_err("should time out");

    assert!(matches!(err, ProcessingError::OcrTimeout { ref document_id } if document_id == "doc-123"));
}

#[tokio::test]
async fn cancellation_interrupts_polling() {
    let stub = OcrStub::start(OcrScript {
        never_complete: true,
        poll_latency: Duration::from_millis(200),
        ..OcrScript::default()
    })
    .await;
    let client = OcrClient::new(stub.settings(), None).expect("client");

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = client.transcribe(&sample_image(), &token).await.expect_err("should cancel");

    assert!(err.is_cancelled(), "expected cancelled, got {err}");
    // Cancellation cut the in-flight poll short instead of waiting for the
    // stub's artificial latency plus the remaining attempts.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn vendor_failure_surfaces_the_message() {
    let stub =
        OcrStub::start(OcrScript { fail_with: Some("page unreadable"), ..OcrScript::default() })
            .await;
    let client = OcrClient::new(stub.settings(), None).expect("client");

    let err = client
        .transcribe(&sample_image(), &CancellationToken::new())
        .await
        .expect_err("vendor reported failure");

    assert!(err.to_string().contains("page unreadable"), "got {err}");
}

#[tokio::test]
async fn missing_key_fails_before_any_request() {
    let stub = OcrStub::start(OcrScript::default()).await;
    let mut settings = stub.settings();
    settings.api_key = String::new();

    let client = OcrClient::new(settings, None).expect("client");
    let err = client
        .transcribe(&sample_image(), &CancellationToken::new())
        .await
        .expect_err("missing key");

    assert!(matches!(err, ProcessingError::MissingApiKey { provider: "ocr" }));
    assert_eq!(stub.uploads(), 0);
    assert_eq!(stub.polls(), 0);
}
