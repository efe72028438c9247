use std::time::Duration;

use super::support::{registry_with, EmptyRemote};
use crate::{
    Binder, CallArg, CallError, CancellationToken, LocalService, RemoteShape, RpcError, Signature,
    Stub,
};

struct SleepyRemote {
    sleepy: Stub<String>,
    echo: Stub<String>,
}

impl RemoteShape for SleepyRemote {
    fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
        Ok(Self {
            sleepy: binder.stub("Sleepy", Signature::new(0, 2))?,
            echo: binder.stub("Echo", Signature::new(1, 2))?,
        })
    }
}

fn sleepy_service(sleep: Duration) -> LocalService {
    let mut service = LocalService::new();
    service.register("Sleepy", 0, move |_ctx, _args| async move {
        tokio::time::sleep(sleep).await;
        Ok::<_, CallError>("late".to_string())
    });
    service.register("Echo", 1, |_ctx, args| async move {
        let message: String = args.value(0)?;
        Ok::<_, CallError>(message)
    });
    service
}

#[tokio::test]
async fn slow_handlers_time_the_call_out_and_the_late_response_is_discarded() {
    let (left, _right) = super::support::pair::<SleepyRemote, EmptyRemote>(
        LocalService::new(),
        sleepy_service(Duration::from_millis(400)),
        Duration::from_millis(100),
    )
    .await;

    let err = left.remote.sleepy.call(Vec::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::CallTimedOut));

    // let the handler finish and its response arrive with nobody waiting
    tokio::time::sleep(Duration::from_millis(500)).await;

    let echoed = left
        .remote
        .echo
        .call(vec![CallArg::value("still alive").unwrap()])
        .await
        .unwrap();
    assert_eq!(echoed, "still alive");
    assert!(!left.link.is_finished());
}

#[tokio::test]
async fn cancelling_the_link_context_fails_pending_and_future_calls() {
    let cancel = CancellationToken::new();
    let (left_stream, right_stream) = tokio::io::duplex(1 << 16);

    let (left_registry, mut left_connected) = registry_with::<SleepyRemote>(
        LocalService::new(),
        Duration::from_secs(10),
        cancel.clone(),
    );
    let (right_registry, _right_connected) = registry_with::<EmptyRemote>(
        sleepy_service(Duration::from_secs(10)),
        Duration::from_secs(10),
        CancellationToken::new(),
    );

    tokio::spawn({
        let registry = left_registry.clone();
        async move { registry.link(left_stream).await }
    });
    tokio::spawn({
        let registry = right_registry.clone();
        async move { registry.link(right_stream).await }
    });

    let left_id = left_connected.recv().await.expect("left link connects");
    let remote = left_registry.peers().remove(&left_id).expect("left stubs");

    let pending = tokio::spawn({
        let remote = remote.clone();
        async move { remote.sleepy.call(Vec::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::Cancelled));

    let err = remote.sleepy.call(Vec::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::Cancelled));
}
