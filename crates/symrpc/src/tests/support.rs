use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    Binder, CallError, CancellationToken, LocalService, Options, Registry, RemoteShape, RpcError,
    Signature, Stub,
};

/// One half of a linked pair: the registry, the stubs it bound for its peer,
/// and the join handle of the link task.
pub(super) struct TestPeer<R: RemoteShape> {
    pub(super) registry: Registry<R>,
    pub(super) remote: Arc<R>,
    pub(super) remote_id: String,
    pub(super) link: JoinHandle<Result<(), RpcError>>,
}

/// Links two registries over an in-memory duplex stream and waits until both
/// connect hooks have fired. `L` is what the left side calls on the right,
/// `R` the reverse.
pub(super) async fn pair<L, R>(
    left_service: LocalService,
    right_service: LocalService,
    timeout: Duration,
) -> (TestPeer<L>, TestPeer<R>)
where
    L: RemoteShape,
    R: RemoteShape,
{
    let (left_stream, right_stream) = tokio::io::duplex(1 << 16);

    let (left_registry, mut left_connected) = registry::<L>(left_service, timeout);
    let (right_registry, mut right_connected) = registry::<R>(right_service, timeout);

    let left_link = tokio::spawn({
        let registry = left_registry.clone();
        async move { registry.link(left_stream).await }
    });
    let right_link = tokio::spawn({
        let registry = right_registry.clone();
        async move { registry.link(right_stream).await }
    });

    let left_id = left_connected.recv().await.expect("left link connects");
    let right_id = right_connected.recv().await.expect("right link connects");

    let left_remote = left_registry.peers().remove(&left_id).expect("left stubs");
    let right_remote = right_registry
        .peers()
        .remove(&right_id)
        .expect("right stubs");

    (
        TestPeer {
            registry: left_registry,
            remote: left_remote,
            remote_id: left_id,
            link: left_link,
        },
        TestPeer {
            registry: right_registry,
            remote: right_remote,
            remote_id: right_id,
            link: right_link,
        },
    )
}

/// A registry whose connect hook reports remote IDs on the returned channel.
pub(super) fn registry<R: RemoteShape>(
    service: LocalService,
    timeout: Duration,
) -> (Registry<R>, mpsc::UnboundedReceiver<String>) {
    registry_with(service, timeout, CancellationToken::new())
}

pub(super) fn registry_with<R: RemoteShape>(
    service: LocalService,
    timeout: Duration,
    cancel: CancellationToken,
) -> (Registry<R>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = Options {
        on_connect: Some(Arc::new(move |id: &str| {
            let _ = tx.send(id.to_string());
        })),
        ..Options::default()
    };
    (Registry::new(service, timeout, cancel, options), rx)
}

pub(super) struct EchoRemote {
    pub(super) echo: Stub<String>,
}

impl RemoteShape for EchoRemote {
    fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
        Ok(Self {
            echo: binder.stub("Echo", Signature::new(1, 2))?,
        })
    }
}

pub(super) fn echo_service() -> LocalService {
    let mut service = LocalService::new();
    service.register("Echo", 1, |_ctx, args| async move {
        let message: String = args.value(0)?;
        Ok::<_, CallError>(message)
    });
    service
}

/// Shape for sides that never call out.
pub(super) struct EmptyRemote;

impl RemoteShape for EmptyRemote {
    fn bind(_binder: &mut Binder) -> Result<Self, RpcError> {
        Ok(Self)
    }
}
