use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::support::{echo_service, pair, EchoRemote, EmptyRemote};
use crate::{Binder, CallArg, CallError, LocalService, RemoteShape, RpcError, Signature, Stub};

#[tokio::test]
async fn concurrent_calls_resolve_by_call_id() {
    let (left, _right) = pair::<EchoRemote, EmptyRemote>(
        LocalService::new(),
        echo_service(),
        Duration::from_secs(10),
    )
    .await;

    let mut calls = Vec::new();
    for i in 0..64 {
        let remote = left.remote.clone();
        calls.push(tokio::spawn(async move {
            let payload = format!("payload-{i}");
            let echoed = remote
                .echo
                .call(vec![CallArg::value(&payload).unwrap()])
                .await
                .unwrap();
            assert_eq!(echoed, payload);
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
}

#[tokio::test]
async fn a_thousand_concurrent_increments_each_get_a_distinct_value() {
    struct CounterRemote {
        increment: Stub<i64>,
    }
    impl RemoteShape for CounterRemote {
        fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
            Ok(Self {
                increment: binder.stub("Increment", Signature::new(1, 2))?,
            })
        }
    }

    let counter = Arc::new(AtomicI64::new(0));
    let mut service = LocalService::new();
    {
        let counter = counter.clone();
        service.register("Increment", 1, move |_ctx, args| {
            let counter = counter.clone();
            async move {
                let delta: i64 = args.value(0)?;
                Ok::<_, CallError>(counter.fetch_add(delta, Ordering::SeqCst) + delta)
            }
        });
    }

    let (left, _right) =
        pair::<CounterRemote, EmptyRemote>(LocalService::new(), service, Duration::from_secs(30))
            .await;

    let mut calls = Vec::new();
    for _ in 0..1000 {
        let remote = left.remote.clone();
        calls.push(tokio::spawn(async move {
            remote
                .increment
                .call(vec![CallArg::value(&1i64).unwrap()])
                .await
                .unwrap()
        }));
    }

    let mut seen = BTreeSet::new();
    for call in calls {
        let value = call.await.unwrap();
        assert!(seen.insert(value), "value {value} returned twice");
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1000);
    assert_eq!(seen.first(), Some(&1));
    assert_eq!(seen.last(), Some(&1000));
}
