use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::support::{pair, registry, EmptyRemote};
use crate::{
    Binder, CancellationToken, LocalService, MessageTransport, Options, Registry, RemoteShape,
    RpcError, Signature, Stub,
};

#[tokio::test]
async fn the_peer_table_mirrors_connect_and_disconnect() {
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();

    let options = Options {
        on_connect: Some(Arc::new({
            let connects = connects.clone();
            move |id: &str| {
                connects.fetch_add(1, Ordering::SeqCst);
                let _ = connected_tx.send(id.to_string());
            }
        })),
        on_disconnect: Some(Arc::new({
            let disconnects = disconnects.clone();
            move |_id: &str| {
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        })),
        ..Options::default()
    };

    let registry: Registry<EmptyRemote> = Registry::new(
        LocalService::new(),
        Duration::from_secs(1),
        CancellationToken::new(),
        options,
    );

    let (near, far) = tokio::io::duplex(4096);
    let link = tokio::spawn({
        let registry = registry.clone();
        async move { registry.link(near).await }
    });

    let remote_id = connected_rx.recv().await.expect("connect hook fires");
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    assert!(registry.peers().contains_key(&remote_id));

    // closing the transport tears the link down
    drop(far);

    let err = link.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(registry.peers().is_empty());
}

struct BadReturnShape {
    bad: Stub<()>,
}

impl RemoteShape for BadReturnShape {
    fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
        Ok(Self {
            bad: binder.stub(
                "Bad",
                Signature {
                    params: 0,
                    returns: 3,
                    context: true,
                },
            )?,
        })
    }
}

struct NoContextShape {
    bad: Stub<()>,
}

impl RemoteShape for NoContextShape {
    fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
        Ok(Self {
            bad: binder.stub(
                "Bad",
                Signature {
                    params: 0,
                    returns: 1,
                    context: false,
                },
            )?,
        })
    }
}

fn recording_transport() -> (
    MessageTransport,
    mpsc::UnboundedReceiver<Vec<u8>>,
    mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (request_out_tx, request_out_rx) = mpsc::unbounded_channel();
    let (response_out_tx, response_out_rx) = mpsc::unbounded_channel();
    let (_request_in_tx, request_in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (_response_in_tx, response_in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    (
        MessageTransport::new(request_out_tx, response_out_tx, request_in_rx, response_in_rx),
        request_out_rx,
        response_out_rx,
    )
}

#[tokio::test]
async fn an_invalid_return_shape_fails_before_any_io() {
    let registry: Registry<BadReturnShape> = Registry::new(
        LocalService::new(),
        Duration::from_secs(1),
        CancellationToken::new(),
        Options::default(),
    );

    let (transport, mut requests, mut responses) = recording_transport();
    let err = registry.link_message(transport).await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidReturn));
    assert!(requests.try_recv().is_err());
    assert!(responses.try_recv().is_err());
    assert!(registry.peers().is_empty());
}

#[tokio::test]
async fn a_shape_without_a_context_parameter_fails_before_any_io() {
    let registry: Registry<NoContextShape> = Registry::new(
        LocalService::new(),
        Duration::from_secs(1),
        CancellationToken::new(),
        Options::default(),
    );

    let (transport, mut requests, _responses) = recording_transport();
    let err = registry.link_message(transport).await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidArgs));
    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn requests_for_unknown_functions_terminate_the_link() {
    struct MissingRemote {
        nope: Stub<()>,
    }
    impl RemoteShape for MissingRemote {
        fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
            Ok(Self {
                nope: binder.stub("Nope", Signature::new(0, 1))?,
            })
        }
    }

    let (left, right) = pair::<MissingRemote, EmptyRemote>(
        LocalService::new(),
        LocalService::new(),
        Duration::from_millis(200),
    )
    .await;

    // the callee tears its link down, which also ends the caller's link
    // before the call can time out
    let err = left.remote.nope.call(Vec::new()).await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::ChannelClosed | RpcError::CallTimedOut
    ));

    let err = right.link.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::CannotCallNonFunction));
}

#[tokio::test]
async fn each_link_gets_its_own_peer_entry() {
    let (registry, mut connected) =
        registry::<EmptyRemote>(LocalService::new(), Duration::from_secs(1));

    let (near_a, _far_a) = tokio::io::duplex(4096);
    let (near_b, _far_b) = tokio::io::duplex(4096);

    tokio::spawn({
        let registry = registry.clone();
        async move { registry.link(near_a).await }
    });
    tokio::spawn({
        let registry = registry.clone();
        async move { registry.link(near_b).await }
    });

    let first = connected.recv().await.expect("first link connects");
    let second = connected.recv().await.expect("second link connects");
    assert_ne!(first, second);
    assert_eq!(registry.peers().len(), 2);
}
