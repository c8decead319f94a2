use std::sync::Arc;
use std::time::Duration;

use ato_core::config::ProvidersConfig;
use ato_intelligence::{
    GenerateRequest, LlmError, MockProvider, ModelGateway, RequestKind, RuntimeDiagnostics,
};
use tokio_util::sync::CancellationToken;

fn slow_local() -> Arc<MockProvider> {
    Arc::new(
        MockProvider::new()
            .local()
            .with_delay(Duration::from_millis(300))
            .with_text("first")
            .with_text("second"),
    )
}

fn gateway(provider: Arc<MockProvider>, diagnostics: RuntimeDiagnostics) -> ModelGateway {
    ModelGateway::new(provider, diagnostics, ProvidersConfig::default())
}

#[tokio::test]
async fn second_local_request_is_rejected_until_first_finishes() {
    let gw = gateway(slow_local(), RuntimeDiagnostics::new());

    let first = {
        let gw = gw.clone();
        tokio::spawn(async move {
            gw.generate(
                GenerateRequest::new(RequestKind::Plan, "plan"),
                &CancellationToken::new(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = gw
        .generate(
            GenerateRequest::new(RequestKind::Chat, "hi"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::AlreadyRunning { .. }));
    assert!(err.to_string().contains("already running"));

    assert_eq!(first.await.unwrap().unwrap(), "first");

    let retry = gw
        .generate(
            GenerateRequest::new(RequestKind::Chat, "hi"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(retry, "second");
}

#[tokio::test]
async fn gate_is_shared_across_gateways_with_same_diagnostics() {
    let diagnostics = RuntimeDiagnostics::new();
    let a = gateway(slow_local(), diagnostics.clone());
    let b = gateway(slow_local(), diagnostics.clone());

    let running = tokio::spawn(async move {
        a.generate(
            GenerateRequest::new(RequestKind::StepAction, "x"),
            &CancellationToken::new(),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = b
        .generate(
            GenerateRequest::new(RequestKind::Chat, "y"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::AlreadyRunning { .. }));
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn remote_requests_are_not_gated() {
    let provider = Arc::new(
        MockProvider::new()
            .with_delay(Duration::from_millis(200))
            .with_text("a")
            .with_text("b"),
    );
    let gw = gateway(provider, RuntimeDiagnostics::new());

    let token = CancellationToken::new();
    let req = || GenerateRequest::new(RequestKind::Chat, "hi");
    let (a, b) = tokio::join!(gw.generate(req(), &token), gw.generate(req(), &token));
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(gw.diagnostics().active_request_count(), 0);
}

#[tokio::test]
async fn in_flight_requests_show_in_snapshot() {
    let gw = gateway(slow_local(), RuntimeDiagnostics::new());
    let diagnostics = gw.diagnostics().clone();

    let handle = tokio::spawn(async move {
        gw.generate(
            GenerateRequest::new(RequestKind::Plan, "plan"),
            &CancellationToken::new(),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snap = diagnostics.snapshot();
    assert_eq!(snap.active_request_count, 1);
    assert_eq!(snap.requests[0].kind, RequestKind::Plan);
    assert_eq!(snap.requests[0].provider, "local");

    handle.await.unwrap().unwrap();
    assert_eq!(diagnostics.snapshot().active_request_count, 0);
}

#[tokio::test]
async fn switching_local_models_unloads_the_previous_one() {
    let provider = Arc::new(MockProvider::new().local().with_text("a").with_text("b"));
    let gw = gateway(provider.clone(), RuntimeDiagnostics::new());
    let token = CancellationToken::new();

    gw.generate(
        GenerateRequest::new(RequestKind::Chat, "hi").with_model("small"),
        &token,
    )
    .await
    .unwrap();
    assert!(provider.unloaded_models().is_empty());
    assert!(gw.diagnostics().last_unload_at().is_none());

    gw.generate(
        GenerateRequest::new(RequestKind::Chat, "hi").with_model("large"),
        &token,
    )
    .await
    .unwrap();
    assert_eq!(provider.unloaded_models(), vec!["small".to_string()]);
    assert!(gw.diagnostics().last_unload_at().is_some());
    assert_eq!(gw.diagnostics().last_local_model().as_deref(), Some("large"));
}

#[tokio::test]
async fn cancellation_aborts_in_flight_request_and_frees_slot() {
    let provider = Arc::new(
        MockProvider::new()
            .local()
            .with_delay(Duration::from_secs(30)),
    );
    let gw = gateway(provider, RuntimeDiagnostics::new());
    let token = CancellationToken::new();

    let handle = {
        let gw = gw.clone();
        let token = token.clone();
        tokio::spawn(async move {
            gw.generate(GenerateRequest::new(RequestKind::StepAction, "x"), &token)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("cancel should return promptly")
        .unwrap();
    assert!(matches!(result, Err(LlmError::Cancelled)));
    assert_eq!(gw.diagnostics().active_request_count(), 0);
    assert!(gw.diagnostics().try_acquire_local("m").is_ok());
}
