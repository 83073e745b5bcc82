use crate::metrics_defs::{FRAGMENTS_RECEIVED, KEYS_MERGED};
use crate::value::{Payload, sanitize_map};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use shared::counter;
use shared::store::KeyValueStore;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const INSTALL_ID_KEY: &str = "attribution.install_id";
/// Marks identifiers this process synthesized rather than received from a source.
pub const GENERATED_ID_PREFIX: &str = "af-";

const EVENT_CAPACITY: usize = 64;

/// Where a fragment came from. Only used for logging and metrics, every
/// source is merged with the same policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentSource {
    Conversion,
    DeepLink,
    Referrer,
    Other,
}

impl FragmentSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FragmentSource::Conversion => "conversion",
            FragmentSource::DeepLink => "deep_link",
            FragmentSource::Referrer => "referrer",
            FragmentSource::Other => "other",
        }
    }
}

impl FromStr for FragmentSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "conversion" => Ok(FragmentSource::Conversion),
            "deep_link" => Ok(FragmentSource::DeepLink),
            "referrer" => Ok(FragmentSource::Referrer),
            "other" => Ok(FragmentSource::Other),
            other => Err(format!("unknown attribution source: {other}")),
        }
    }
}

impl fmt::Display for FragmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributionEvent {
    FragmentMerged {
        source: FragmentSource,
        new_keys: usize,
    },
    /// A source supplied a new install id. Generated ids are not announced.
    InstallIdAssigned,
}

/// The canonical attribution map. Grows monotonically and is never pruned.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AttributionRecord(IndexMap<String, Value>);

impl AttributionRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn to_json_map(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Keeps the first non-null value seen for every key. Returns how many
    /// keys received a value.
    fn merge_first_received(&mut self, fragment: Map<String, Value>) -> usize {
        let mut merged = 0;
        for (key, value) in fragment {
            let claimed = match self.0.get(&key) {
                Some(existing) => !existing.is_null() || value.is_null(),
                None => false,
            };
            if claimed {
                continue;
            }
            self.0.insert(key, value);
            merged += 1;
        }
        merged
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for AttributionRecord {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        AttributionRecord(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

struct AggregatorInner {
    record: RwLock<AttributionRecord>,
    install_id: RwLock<Option<String>>,
    store: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<AttributionEvent>,
}

/// Merges attribution fragments from every source into one record and owns
/// the install identifier sent alongside it.
#[derive(Clone)]
pub struct AttributionAggregator {
    inner: Arc<AggregatorInner>,
}

impl AttributionAggregator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let install_id = match store.get(INSTALL_ID_KEY) {
            Ok(id) => id.filter(|id| !id.is_empty()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read persisted install id");
                None
            }
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        AttributionAggregator {
            inner: Arc::new(AggregatorInner {
                record: RwLock::new(AttributionRecord::default()),
                install_id: RwLock::new(install_id),
                store,
                events,
            }),
        }
    }

    /// Sanitizes the payload and merges it first-write-wins per top-level key.
    /// Fields that cannot be represented are dropped individually. Returns the
    /// number of keys that received a value.
    pub fn update(&self, source: FragmentSource, payload: &Payload) -> usize {
        let fragment = sanitize_map(payload);
        let dropped = payload.len() - fragment.len();
        let new_keys = self.inner.record.write().merge_first_received(fragment);

        counter!(FRAGMENTS_RECEIVED, "source" => source.as_str()).increment(1);
        counter!(KEYS_MERGED).increment(new_keys as u64);
        tracing::debug!(%source, new_keys, dropped, "Merged attribution fragment");

        // Nobody listening is fine
        let _ = self
            .inner
            .events
            .send(AttributionEvent::FragmentMerged { source, new_keys });

        new_keys
    }

    /// Accepts a stable identifier from an attribution source. Empty ids are ignored.
    pub fn set_install_id(&self, id: Option<&str>) {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return;
        };

        {
            let mut current = self.inner.install_id.write();
            if current.as_deref() == Some(id) {
                return;
            }
            *current = Some(id.to_string());
        }

        self.persist_install_id(id);
        tracing::info!(install_id = id, "Install id received from attribution source");
        let _ = self.inner.events.send(AttributionEvent::InstallIdAssigned);
    }

    pub fn install_id(&self) -> Option<String> {
        self.inner.install_id.read().clone()
    }

    /// Returns the known install id, generating and persisting one if no
    /// source supplied it. Stable once generated.
    pub fn ensure_install_id(&self) -> String {
        if let Some(id) = self.inner.install_id.read().clone() {
            return id;
        }

        let mut current = self.inner.install_id.write();
        // Another caller may have won the race for the write lock
        if let Some(id) = current.clone() {
            return id;
        }

        match self.inner.store.get(INSTALL_ID_KEY) {
            Ok(Some(stored)) if !stored.is_empty() => {
                *current = Some(stored.clone());
                return stored;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not read persisted install id"),
        }

        let generated = format!("{GENERATED_ID_PREFIX}{}", Uuid::new_v4());
        self.persist_install_id(&generated);
        *current = Some(generated.clone());
        drop(current);

        tracing::info!(install_id = %generated, "Generated install id");
        generated
    }

    pub fn snapshot(&self) -> AttributionRecord {
        self.inner.record.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttributionEvent> {
        self.inner.events.subscribe()
    }

    fn persist_install_id(&self, id: &str) {
        if let Err(e) = self.inner.store.set(INSTALL_ID_KEY, id) {
            tracing::warn!(error = %e, "Could not persist install id");
        }
    }
}
