use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

type CleanupFuture = Pin<Box<dyn Future<Output = Vec<String>> + Send>>;
type CleanupAction = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Scoped release of an ephemeral resource (a clone, a guest temp dir).
///
/// The owner awaits [`CleanupGuard::run`] on every normal exit path. If the
/// guard is dropped while still armed (the enclosing future was cancelled or
/// panicked), the action is spawned onto the current runtime instead.
/// Warnings the action returns are logged and added to the shared failure
/// counter.
pub struct CleanupGuard {
    label: String,
    action: Option<CleanupAction>,
    failures: Arc<AtomicUsize>,
}

impl CleanupGuard {
    pub fn new<F, Fut>(label: impl Into<String>, failures: Arc<AtomicUsize>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Vec<String>> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Some(Box::new(move || Box::pin(action()) as CleanupFuture)),
            failures,
        }
    }

    /// Release the resource now. Returns the warnings, already logged and counted.
    pub async fn run(mut self) -> Vec<String> {
        let Some(action) = self.action.take() else {
            return Vec::new();
        };
        tracing::debug!(resource = %self.label, "releasing");
        let warnings = action().await;
        record(&self.label, &warnings, &self.failures);
        warnings
    }

    /// Keep the resource (debug/keep requested).
    pub fn disarm(mut self) {
        if self.action.take().is_some() {
            tracing::info!(resource = %self.label, "keeping resource");
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(action) = self.action.take() else {
            return;
        };
        let label = std::mem::take(&mut self.label);
        let failures = self.failures.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(resource = %label, "operation aborted, releasing in background");
                handle.spawn(async move {
                    let warnings = action().await;
                    record(&label, &warnings, &failures);
                });
            }
            Err(_) => {
                let warnings = vec![format!("{label}: no runtime left to release it")];
                record(&label, &warnings, &failures);
            }
        }
    }
}

fn record(label: &str, warnings: &[String], failures: &AtomicUsize) {
    for warning in warnings {
        tracing::warn!(resource = %label, %warning, "cleanup failed");
    }
    failures.fetch_add(warnings.len(), Ordering::SeqCst);
}
