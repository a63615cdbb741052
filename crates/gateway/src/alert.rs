// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alert rule evaluation with edge-based notification suppression.
//!
//! Rules are loaded per device instance. Each snapshot evaluation produces at
//! most one TRIGGERED notification per rising edge and one RESOLVED per
//! falling edge; steady states stay silent. Missing source data yields no
//! result at all — never a false positive.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::composite::{CompositeNode, Operator, RawNode};
use crate::composite_eval::{CompositeEvaluator, EvalContext};
use crate::event::{AlertEdge, AlertNotice, AlertSeverity};
use crate::snapshot::{is_missing, Snapshot, MISSING};
use crate::work_hours::WorkHoursEvaluator;

/// How the condition value is derived from the sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertValueKind {
    Threshold,
    Average,
    Sum,
    Min,
    Max,
}

impl AlertValueKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Average => "average",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// A validated alert rule.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub code: String,
    pub name: String,
    pub severity: AlertSeverity,
    pub kind: AlertRuleKind,
}

#[derive(Debug, Clone)]
pub enum AlertRuleKind {
    Value {
        value_kind: AlertValueKind,
        sources: Vec<String>,
        operator: Operator,
        threshold: f64,
    },
    ScheduleExpectedState {
        source: String,
        expected_state: f64,
    },
    Composite {
        node: CompositeNode,
        sources: Vec<String>,
    },
}

/// On-disk rule shape before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertRuleConfig {
    pub code: String,
    pub name: String,
    pub severity: AlertSeverity,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub expected_state: Option<f64>,
    #[serde(default)]
    pub composite: Option<RawNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelAlerts {
    #[serde(default)]
    pub instances: HashMap<String, Vec<AlertRuleConfig>>,
}

/// Full alert configuration: model -> slave id -> rules.
pub type AlertConfig = HashMap<String, ModelAlerts>;

impl AlertRuleConfig {
    fn build(self) -> Result<AlertRule, crate::error::ConfigError> {
        let kind = match self.kind.as_str() {
            "threshold" | "average" | "sum" | "min" | "max" => {
                let value_kind = match self.kind.as_str() {
                    "threshold" => AlertValueKind::Threshold,
                    "average" => AlertValueKind::Average,
                    "sum" => AlertValueKind::Sum,
                    "min" => AlertValueKind::Min,
                    _ => AlertValueKind::Max,
                };
                if self.sources.is_empty() {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "alert '{}': sources must not be empty",
                        self.code
                    )));
                }
                if value_kind == AlertValueKind::Threshold && self.sources.len() != 1 {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "alert '{}': threshold takes exactly one source",
                        self.code
                    )));
                }
                let (Some(operator), Some(threshold)) = (self.operator, self.threshold) else {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "alert '{}': operator and threshold are required",
                        self.code
                    )));
                };
                AlertRuleKind::Value { value_kind, sources: self.sources, operator, threshold }
            }
            "schedule_expected_state" => {
                let Some(source) = self.sources.first().cloned() else {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "alert '{}': schedule_expected_state requires one source",
                        self.code
                    )));
                };
                let Some(expected_state) = self.expected_state else {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "alert '{}': expected_state is required",
                        self.code
                    )));
                };
                AlertRuleKind::ScheduleExpectedState { source, expected_state }
            }
            "composite" => {
                let Some(raw) = self.composite else {
                    return Err(crate::error::ConfigError::Invalid(format!(
                        "alert '{}': composite tree is required",
                        self.code
                    )));
                };
                AlertRuleKind::Composite { node: raw.build()?, sources: self.sources }
            }
            other => {
                return Err(crate::error::ConfigError::Invalid(format!(
                    "alert '{}': unknown alert type '{other}'",
                    self.code
                )))
            }
        };
        Ok(AlertRule { code: self.code, name: self.name, severity: self.severity, kind })
    }
}

/// Tracks per-(device, code) alert state and decides notification edges.
#[derive(Default)]
pub struct AlertStateManager {
    states: parking_lot::Mutex<HashMap<(String, String), bool>>,
}

impl AlertStateManager {
    /// Returns the edge to notify, if any. Repeated evaluations in the same
    /// state are suppressed.
    pub fn should_notify(&self, device_id: &str, code: &str, triggered: bool) -> Option<AlertEdge> {
        let key = (device_id.to_owned(), code.to_owned());
        let mut states = self.states.lock();
        let previous = states.insert(key, triggered);
        match (previous.unwrap_or(false), triggered) {
            (false, true) => Some(AlertEdge::Triggered),
            (true, false) => Some(AlertEdge::Resolved),
            _ => None,
        }
    }

    pub fn current_state(&self, device_id: &str, code: &str) -> Option<bool> {
        self.states.lock().get(&(device_id.to_owned(), code.to_owned())).copied()
    }
}

/// Evaluates configured alert rules against device snapshots.
pub struct AlertEvaluator {
    rules: HashMap<String, Vec<AlertRule>>,
    state: AlertStateManager,
    work_hours: Option<Arc<WorkHoursEvaluator>>,
    composite: CompositeEvaluator,
}

impl AlertEvaluator {
    /// Build from configuration, dropping rules for unknown devices and
    /// rules that fail validation.
    pub fn new(
        config: AlertConfig,
        valid_device_ids: &std::collections::HashSet<String>,
        work_hours: Option<Arc<WorkHoursEvaluator>>,
    ) -> Self {
        let mut rules: HashMap<String, Vec<AlertRule>> = HashMap::new();
        let mut total = 0usize;
        let mut skipped_devices = 0usize;

        for (model, model_config) in config {
            for (slave_id, rule_configs) in model_config.instances {
                let device_id = format!("{model}_{slave_id}");
                if !valid_device_ids.contains(&device_id) {
                    warn!(device = %device_id, "unknown device in alert config, skipping");
                    skipped_devices += 1;
                    continue;
                }
                let mut built = Vec::new();
                let mut codes = std::collections::HashSet::new();
                for rule_config in rule_configs {
                    let code = rule_config.code.clone();
                    if !codes.insert(code.clone()) {
                        warn!(device = %device_id, code = %code, "duplicate alert code, skipping");
                        continue;
                    }
                    match rule_config.build() {
                        Ok(rule) => built.push(rule),
                        Err(e) => {
                            warn!(device = %device_id, code = %code, "invalid alert rule dropped: {e}")
                        }
                    }
                }
                if !built.is_empty() {
                    info!(device = %device_id, count = built.len(), "alerts loaded");
                    total += built.len();
                    rules.insert(device_id, built);
                }
            }
        }
        info!(
            devices = rules.len(),
            alerts = total,
            skipped_devices,
            "alert evaluator initialized"
        );

        Self {
            rules,
            state: AlertStateManager::default(),
            work_hours,
            composite: CompositeEvaluator::new(None, None),
        }
    }

    /// Evaluate every rule configured for the snapshot's device.
    pub fn evaluate(&self, snapshot: &Snapshot) -> Vec<AlertNotice> {
        let Some(rules) = self.rules.get(&snapshot.device_id) else {
            debug!(device = %snapshot.device_id, "no alert config for device");
            return Vec::new();
        };

        let mut notices = Vec::new();
        for rule in rules {
            let Some((triggered, value)) = self.evaluate_rule(rule, snapshot) else {
                continue;
            };
            let Some(edge) = self.state.should_notify(&snapshot.device_id, &rule.code, triggered)
            else {
                continue;
            };
            notices.push(AlertNotice {
                device_id: snapshot.device_id.clone(),
                code: rule.code.clone(),
                message: self.build_message(rule, value, edge),
                severity: rule.severity,
                edge,
                value,
            });
        }
        notices
    }

    fn evaluate_rule(&self, rule: &AlertRule, snapshot: &Snapshot) -> Option<(bool, f64)> {
        match &rule.kind {
            AlertRuleKind::Value { value_kind, sources, operator, threshold } => {
                let mut values = Vec::with_capacity(sources.len());
                for source in sources {
                    match snapshot.values.get(source) {
                        Some(v) => values.push(*v),
                        None => {
                            warn!(
                                device = %snapshot.device_id,
                                code = %rule.code,
                                source = %source,
                                "missing source in snapshot"
                            );
                            return None;
                        }
                    }
                }
                let value = match value_kind {
                    AlertValueKind::Threshold => values[0],
                    AlertValueKind::Average => values.iter().sum::<f64>() / values.len() as f64,
                    AlertValueKind::Sum => values.iter().sum(),
                    AlertValueKind::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                    AlertValueKind::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                let triggered = match operator {
                    Operator::Gt => value > *threshold,
                    Operator::Gte => value >= *threshold,
                    Operator::Lt => value < *threshold,
                    Operator::Lte => value <= *threshold,
                    Operator::Eq => value == *threshold,
                    Operator::Neq => value != *threshold,
                    Operator::Between => return None,
                };
                Some((triggered, value))
            }
            AlertRuleKind::ScheduleExpectedState { source, expected_state } => {
                let work_hours = self.work_hours.as_ref()?;
                let actual = *snapshot.values.get(source)?;
                if work_hours.allow(&snapshot.device_id) {
                    // Inside work hours the device may run freely.
                    return Some((false, actual));
                }
                Some((actual != *expected_state, actual))
            }
            AlertRuleKind::Composite { node, sources } => {
                let (model, slave_id) =
                    crate::snapshot::split_device_id(&snapshot.device_id).or_else(|| {
                        warn!(device = %snapshot.device_id, "malformed device id, skipping rule");
                        None
                    })?;
                let get = |key: &str| {
                    snapshot.values.get(key).copied().filter(|v| !is_missing(*v))
                };
                let ctx = EvalContext {
                    rule_code: &rule.code,
                    device_model: model,
                    device_slave_id: slave_id,
                };
                let triggered = self.composite.evaluate(node, &ctx, &get);
                let value = sources
                    .iter()
                    .find_map(|s| snapshot.values.get(s).copied())
                    .unwrap_or(MISSING);
                Some((triggered, value))
            }
        }
    }

    fn build_message(&self, rule: &AlertRule, value: f64, edge: AlertEdge) -> String {
        match (&rule.kind, edge) {
            (AlertRuleKind::ScheduleExpectedState { source, expected_state }, AlertEdge::Triggered) => {
                let state_text = if value == 1.0 { "ON" } else { "OFF" };
                let expected_text = if *expected_state == 1.0 { "ON" } else { "OFF" };
                format!(
                    "[{}] {}: {source}={state_text} (expected {expected_text}) during shutdown period",
                    rule.severity.as_str(),
                    rule.name
                )
            }
            (AlertRuleKind::ScheduleExpectedState { source, .. }, AlertEdge::Resolved) => {
                let state_text = if value == 1.0 { "ON" } else { "OFF" };
                format!("[RESOLVED] {}: {source}={state_text} returned to expected state", rule.name)
            }
            (AlertRuleKind::Value { value_kind, sources, operator, threshold }, edge) => {
                let display = if sources.len() > 1 {
                    format!("{}({})", value_kind.as_str(), sources.join(", "))
                } else {
                    sources.first().cloned().unwrap_or_default()
                };
                match edge {
                    AlertEdge::Triggered => format!(
                        "[{}] {}: {display}={value:.2} violates {} {threshold}",
                        rule.severity.as_str(),
                        rule.name,
                        operator.as_str()
                    ),
                    AlertEdge::Resolved => format!(
                        "[RESOLVED] {}: {display}={value:.2} returned to normal (threshold: {threshold})",
                        rule.name
                    ),
                }
            }
            (AlertRuleKind::Composite { node, .. }, AlertEdge::Triggered) => {
                format!("[{}] {}: {}", rule.severity.as_str(), rule.name, node.reason_summary())
            }
            (AlertRuleKind::Composite { .. }, AlertEdge::Resolved) => {
                format!("[RESOLVED] {}: condition cleared", rule.name)
            }
        }
    }
}

#[cfg(test)]
#[path = "alert_tests.rs"]
mod tests;
