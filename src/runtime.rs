use std::future::Future;

/// Spawns a task onto the current tokio runtime, if one is running.
///
/// Used for fire-and-forget work triggered from `Drop` implementations
/// (killCursors, session check-in), where no runtime may be available during
/// program teardown.
pub(crate) fn spawn<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(fut);
    }
}
