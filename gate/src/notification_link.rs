use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

/// Payload locations that may carry a link, in lookup order.
const LINK_PATHS: &[&[&str]] = &[
    &["url"],
    &["data", "url"],
    &["message", "url"],
    &["message", "data", "url"],
    &["link"],
    &["deep_link"],
];

/// Holds the link from the most recently opened notification until the web
/// container consumes it.
#[derive(Default)]
pub struct NotificationLinkStore {
    pending: Mutex<Option<Url>>,
}

impl NotificationLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracts and stores the link from a notification payload. Payloads
    /// without a usable link leave the pending link untouched.
    pub fn store_from_payload(&self, payload: &Value) -> Option<Url> {
        let url = extract_link(payload)?;
        self.store(url.clone());
        Some(url)
    }

    pub fn store(&self, url: Url) {
        tracing::debug!(url = %url, "Stored notification link");
        *self.pending.lock() = Some(url);
    }

    pub fn consume(&self) -> Option<Url> {
        self.pending.lock().take()
    }
}

/// The first non-empty string at a known location decides. If it does not
/// parse as a URL there is no link.
pub fn extract_link(payload: &Value) -> Option<Url> {
    let raw = LINK_PATHS
        .iter()
        .filter_map(|path| lookup(payload, path))
        .find(|candidate| !candidate.is_empty())?;

    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::debug!(value = raw, error = %e, "Notification link is not a URL");
            None
        }
    }
}

fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(payload, |value, key| value.get(key))?
        .as_str()
}
