use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

tokio::task_local! {
    /// Ambient identity of the resolution currently driving this task.
    static CURRENT: ContextId;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the logical execution context a production runs in.
///
/// Two resolutions share an id only when one is nested inside the other's
/// producer. The deadlock check compares these ids whenever a token
/// acquisition finds the key already owned: same id means the caller would
/// be waiting on itself.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Returns the ambient context id, if the current task is already inside a
/// resolution.
pub(crate) fn current() -> Option<ContextId> {
    CURRENT.try_with(|id| *id).ok()
}

/// Runs `fut` with `id` as the ambient context id.
///
/// Everything awaited inside `fut` sees the id, including producer futures
/// and any nested resolutions they start. Tasks spawned from within are
/// their own contexts; a spawned task waiting on its parent's key blocks
/// like any other independent caller would.
pub(crate) fn scope<F: Future>(id: ContextId, fut: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(id, fut)
}
