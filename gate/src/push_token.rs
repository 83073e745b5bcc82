use shared::store::KeyValueStore;
use std::sync::Arc;
use tokio::sync::watch;

pub const PUSH_TOKEN_KEY: &str = "push.token";

/// The current push token, persisted across restarts and observable.
#[derive(Clone)]
pub struct PushTokenStore {
    inner: Arc<PushTokenInner>,
}

struct PushTokenInner {
    store: Arc<dyn KeyValueStore>,
    current: watch::Sender<Option<String>>,
}

impl PushTokenStore {
    /// Starts from the persisted token, if any.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let persisted = match store.get(PUSH_TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted push token");
                None
            }
        };

        let (current, _) = watch::channel(persisted);
        PushTokenStore {
            inner: Arc::new(PushTokenInner { store, current }),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.inner.current.borrow().clone()
    }

    /// Trims and publishes a new token. Blank tokens clear the in-memory
    /// value but leave the last persisted token in place.
    pub fn update(&self, token: Option<&str>) {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from);

        if let Some(token) = &token
            && let Err(e) = self.inner.store.set(PUSH_TOKEN_KEY, token)
        {
            tracing::error!(error = %e, "Failed to persist push token");
        }

        tracing::debug!(present = token.is_some(), "Push token updated");
        self.inner.current.send_replace(token);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.inner.current.subscribe()
    }
}
