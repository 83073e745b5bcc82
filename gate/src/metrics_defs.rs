//! Metrics definitions for the gate.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CONFIG_FETCH_DURATION: MetricDef = MetricDef {
    name: "config.fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of routing config fetches in seconds, excluding the minimum loading hold",
};

pub const CONFIG_FETCH_OUTCOME: MetricDef = MetricDef {
    name: "config.fetch.outcome",
    metric_type: MetricType::Counter,
    description: "Routing config fetch outcomes. Tagged with outcome.",
};

pub const GATE_ROUTE: MetricDef = MetricDef {
    name: "gate.route",
    metric_type: MetricType::Counter,
    description: "Gate route transitions. Tagged with route.",
};

pub const GATE_TRIGGERS: MetricDef = MetricDef {
    name: "gate.triggers",
    metric_type: MetricType::Counter,
    description: "Gate triggers received. Tagged with trigger and outcome.",
};

pub const REDIRECT_HOPS: MetricDef = MetricDef {
    name: "redirect.hops",
    metric_type: MetricType::Histogram,
    description: "Number of hops followed per redirect chain resolution",
};

pub const REDIRECT_RESOLUTIONS: MetricDef = MetricDef {
    name: "redirect.resolutions",
    metric_type: MetricType::Counter,
    description: "Redirect chain resolutions. Tagged with termination.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CONFIG_FETCH_DURATION,
    CONFIG_FETCH_OUTCOME,
    GATE_ROUTE,
    GATE_TRIGGERS,
    REDIRECT_HOPS,
    REDIRECT_RESOLUTIONS,
];
