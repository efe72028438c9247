use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CallError;
use crate::service::CallContext;
use crate::BoxFuture;

/// A function value parked on its owner's side while the wire carries only
/// its ID. Argument type-adaptation happens inside the stored closure (see
/// [`CallArg::func`](crate::CallArg::func)).
pub(crate) type StoredClosure =
    Arc<dyn Fn(CallContext, Vec<Value>) -> BoxFuture<Result<Value, CallError>> + Send + Sync>;

/// Table of closures currently reachable from a peer. Shared by every link of
/// a registry; entries live exactly as long as the outbound call that
/// registered them.
#[derive(Default)]
pub(crate) struct ClosureManager {
    closures: Mutex<HashMap<String, StoredClosure>>,
}

impl ClosureManager {
    pub(crate) fn register(self: &Arc<Self>, closure: StoredClosure) -> (String, FreeHandle) {
        let id = Uuid::new_v4().to_string();
        self.closures.lock().insert(id.clone(), closure);
        let free = FreeHandle {
            id: id.clone(),
            manager: self.clone(),
        };
        (id, free)
    }

    pub(crate) async fn call(
        &self,
        ctx: CallContext,
        id: &str,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        let closure = self.closures.lock().get(id).cloned();
        match closure {
            Some(closure) => closure(ctx, args).await,
            None => Err(CallError::new(format!("closure {id} not found"))),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.closures.lock().len()
    }
}

/// Removes one closure entry when dropped. Freeing twice is a no-op.
pub(crate) struct FreeHandle {
    id: String,
    manager: Arc<ClosureManager>,
}

impl FreeHandle {
    pub(crate) fn free(&self) {
        self.manager.closures.lock().remove(&self.id);
    }
}

impl Drop for FreeHandle {
    fn drop(&mut self) {
        self.free();
    }
}
