use crate::redirect::RedirectResolver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavigationFailure {
    /// The web container hit its own redirect limit.
    RedirectLimit,
    Other,
}

/// What the web container should load instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reload {
    pub url: Url,
    pub bypass_cache: bool,
}

/// Recovers web container navigation from redirect-limit failures by
/// resolving the chain manually.
pub struct NavigationRecovery {
    resolver: RedirectResolver,
    root: Url,
    last_main_frame: Mutex<Option<Url>>,
    resolving: AtomicBool,
}

impl NavigationRecovery {
    /// `root` is the destination the container was opened with.
    pub fn new(resolver: RedirectResolver, root: Url) -> Self {
        NavigationRecovery {
            resolver,
            root,
            last_main_frame: Mutex::new(None),
            resolving: AtomicBool::new(false),
        }
    }

    /// Called for every main-frame navigation the container starts.
    pub fn record_main_frame(&self, url: Url) {
        *self.last_main_frame.lock() = Some(url);
    }

    /// Only redirect-limit failures are handled, one resolution at a time.
    pub async fn on_failure(&self, failure: NavigationFailure) -> Option<Reload> {
        if failure != NavigationFailure::RedirectLimit {
            return None;
        }
        if self
            .resolving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Redirect resolution already in progress");
            return None;
        }
        let _guard = ResolvingGuard(&self.resolving);

        let start = self
            .last_main_frame
            .lock()
            .clone()
            .unwrap_or_else(|| self.root.clone());
        tracing::info!(start = %start, "Resolving redirect chain after navigation failure");

        let url = self.resolver.resolve(start).await;
        Some(Reload {
            url,
            bypass_cache: true,
        })
    }
}

struct ResolvingGuard<'a>(&'a AtomicBool);

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
