//! Metrics definitions for attribution aggregation.

use shared::metrics_defs::{MetricDef, MetricType};

pub const FRAGMENTS_RECEIVED: MetricDef = MetricDef {
    name: "attribution.fragments",
    metric_type: MetricType::Counter,
    description: "Attribution fragments received. Tagged with source.",
};

pub const KEYS_MERGED: MetricDef = MetricDef {
    name: "attribution.keys_merged",
    metric_type: MetricType::Counter,
    description: "Keys that received their first value in the attribution record",
};

pub const ALL_METRICS: &[MetricDef] = &[FRAGMENTS_RECEIVED, KEYS_MERGED];
