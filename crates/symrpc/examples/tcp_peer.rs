//! Symmetric TCP peer: run one side with `--listen`, any number of others
//! without it, and watch every peer increment every other peer's counter.
//!
//! ```text
//! cargo run --example tcp_peer -- --listen 127.0.0.1:1337
//! cargo run --example tcp_peer -- 127.0.0.1:1337
//! ```

use std::env;
use std::error::Error;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use symrpc::{
    Binder, CallArg, CallError, CancellationToken, LocalService, Options, Registry, RemoteShape,
    RpcError, Signature, Stub,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

struct Remote {
    increment: Stub<i64>,
}

impl RemoteShape for Remote {
    fn bind(binder: &mut Binder) -> Result<Self, RpcError> {
        Ok(Self {
            increment: binder.stub("Increment", Signature::new(1, 2))?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut listen = false;
    let mut addr = "127.0.0.1:1337".to_string();
    for arg in env::args().skip(1) {
        if arg == "--listen" {
            listen = true;
        } else {
            addr = arg;
        }
    }

    let counter = Arc::new(AtomicI64::new(0));
    let mut service = LocalService::new();
    {
        let counter = counter.clone();
        service.register("Increment", 1, move |ctx, args| {
            let counter = counter.clone();
            async move {
                let delta: i64 = args.value(0)?;
                let total = counter.fetch_add(delta, Ordering::SeqCst) + delta;
                info!(peer = %ctx.remote_id(), delta, total, "incremented");
                Ok::<_, CallError>(total)
            }
        });
    }

    let registry: Registry<Remote> = Registry::new(
        service,
        Duration::from_secs(10),
        CancellationToken::new(),
        Options {
            on_connect: Some(Arc::new(|id: &str| info!(peer = %id, "peer connected"))),
            on_disconnect: Some(Arc::new(|id: &str| info!(peer = %id, "peer disconnected"))),
            ..Options::default()
        },
    );

    // fan out an increment to every connected peer once a second
    tokio::spawn({
        let registry = registry.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                for (peer_id, peer) in registry.peers() {
                    let arg = match CallArg::value(&1i64) {
                        Ok(arg) => arg,
                        Err(err) => {
                            warn!(%err, "encode failed");
                            continue;
                        }
                    };
                    match peer.increment.call(vec![arg]).await {
                        Ok(total) => info!(peer = %peer_id, total, "peer's counter"),
                        Err(err) => warn!(peer = %peer_id, %err, "increment failed"),
                    }
                }
            }
        }
    });

    if listen {
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "listening");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let registry = registry.clone();
            tokio::spawn(async move {
                if let Err(err) = registry.link(stream).await {
                    warn!(%peer_addr, %err, "link ended");
                }
            });
        }
    } else {
        let stream = TcpStream::connect(&addr).await?;
        info!(%addr, "connected");
        registry.link(stream).await?;
    }
    Ok(())
}
