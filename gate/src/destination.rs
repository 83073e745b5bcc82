//! Decorates the approved destination with attribution and device parameters
//! before it is handed to the web container.

use crate::client::DeviceContext;
use attribution::AttributionRecord;
use serde_json::Value;
use std::collections::HashSet;
use url::Url;

const SUB_ID_SLOTS: usize = 5;

/// Appends the query parameters the destination expects. Parameters already
/// present on the URL are never overwritten, so applying this twice yields
/// the same URL.
pub fn augment(
    url: &Url,
    attribution: &AttributionRecord,
    install_id: &str,
    context: &DeviceContext,
) -> Url {
    let existing: HashSet<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
    let additions: Vec<(String, String)> = parameters(attribution, install_id, context)
        .into_iter()
        .filter(|(key, value)| !value.is_empty() && !existing.contains(key))
        .collect();

    if additions.is_empty() {
        return url.clone();
    }

    tracing::debug!(added = additions.len(), "Augmenting destination");
    let mut augmented = url.clone();
    augmented.query_pairs_mut().extend_pairs(&additions);
    augmented
}

fn parameters(
    attribution: &AttributionRecord,
    install_id: &str,
    context: &DeviceContext,
) -> Vec<(String, String)> {
    let mut params = Vec::new();

    for slot in 1..=SUB_ID_SLOTS {
        if let Some(value) = scalar(attribution, &format!("af_sub{slot}")) {
            params.push((format!("sub_id_{slot}"), value));
        }
    }
    if let Some(value) = scalar(attribution, "deep_link_value") {
        params.push(("deep_link_value".to_string(), value));
    }
    params.push(("extra_param".to_string(), extra_param(attribution, install_id)));

    if let Some(bundle_id) = &context.bundle_id {
        params.push(("bundle_id".to_string(), bundle_id.clone()));
    }
    params.push(("os".to_string(), context.platform.clone()));
    params.push(("locale".to_string(), context.locale.clone()));
    if let Some(store_id) = &context.store_id {
        params.push(("store_id".to_string(), store_id.clone()));
    }

    params
}

/// `af_id:<id>;campaign:<c>;media_source:<m>`, skipping unknown parts.
fn extra_param(attribution: &AttributionRecord, install_id: &str) -> String {
    let mut parts = vec![format!("af_id:{install_id}")];
    for key in ["campaign", "media_source"] {
        if let Some(value) = scalar(attribution, key) {
            parts.push(format!("{key}:{value}"));
        }
    }
    parts.join(";")
}

fn scalar(attribution: &AttributionRecord, key: &str) -> Option<String> {
    match attribution.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
