// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Composite condition evaluation with hysteresis, debounce, and
//! time-elapsed leaves.
//!
//! Stabilization state is keyed by `(rule_code, leaf path)` so structurally
//! identical trees rebuilt between evaluations keep their latch and debounce
//! state. The execution store for time-elapsed leaves is a constructor
//! dependency, not ambient context.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::composite::{CompositeNode, Leaf, LeafKind, Operator};
use crate::snapshot::now_ts;

/// Reads a pin value from the current snapshot; `None` for absent or missing.
pub type ValueGetter<'a> = &'a dyn Fn(&str) -> Option<f64>;

/// Identifies the rule and device being evaluated. Required for
/// time-elapsed leaves; harmless otherwise.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub rule_code: &'a str,
    pub device_model: &'a str,
    pub device_slave_id: u8,
}

/// Persistent record of the last firing of a time-elapsed rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecutionRecord {
    pub rule_code: String,
    pub device_model: String,
    pub device_slave_id: u8,
    pub last_execution_time: DateTime<Local>,
}

/// Persistence seam for time-elapsed leaves.
pub trait ExecutionStore: Send + Sync {
    fn last_execution(&self, rule_code: &str) -> Option<DateTime<Local>>;
    fn record_execution(&self, record: RuleExecutionRecord);
}

/// In-memory store for tests and stateless deployments.
#[derive(Default)]
pub struct MemoryExecutionStore {
    records: parking_lot::Mutex<HashMap<String, RuleExecutionRecord>>,
}

impl ExecutionStore for MemoryExecutionStore {
    fn last_execution(&self, rule_code: &str) -> Option<DateTime<Local>> {
        self.records.lock().get(rule_code).map(|r| r.last_execution_time)
    }

    fn record_execution(&self, record: RuleExecutionRecord) {
        self.records.lock().insert(record.rule_code.clone(), record);
    }
}

/// File-backed store: records append as JSONL, loading takes the last entry
/// per rule code. Survives restarts without any compaction step.
pub struct FileExecutionStore {
    path: PathBuf,
    records: parking_lot::Mutex<HashMap<String, RuleExecutionRecord>>,
}

impl FileExecutionStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut records = HashMap::new();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            for line in contents.lines() {
                if let Ok(record) = serde_json::from_str::<RuleExecutionRecord>(line) {
                    records.insert(record.rule_code.clone(), record);
                }
            }
        }
        if !records.is_empty() {
            info!(path = %path.display(), rules = records.len(), "execution store loaded");
        }
        Self { path, records: parking_lot::Mutex::new(records) }
    }
}

impl ExecutionStore for FileExecutionStore {
    fn last_execution(&self, rule_code: &str) -> Option<DateTime<Local>> {
        self.records.lock().get(rule_code).map(|r| r.last_execution_time)
    }

    fn record_execution(&self, record: RuleExecutionRecord) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string(&record) {
            Ok(mut line) => {
                line.push('\n');
                match std::fs::OpenOptions::new().create(true).append(true).open(&self.path) {
                    Ok(mut file) => {
                        let _ = file.write_all(line.as_bytes());
                    }
                    Err(e) => warn!(path = %self.path.display(), "execution store append failed: {e}"),
                }
            }
            Err(e) => warn!("execution record serialize failed: {e}"),
        }
        self.records.lock().insert(record.rule_code.clone(), record);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LeafState {
    is_true: bool,
    pending_since: Option<f64>,
}

/// Recursive evaluator shared by the control and alert engines.
pub struct CompositeEvaluator {
    comparison_tolerance: Option<f64>,
    store: Option<Arc<dyn ExecutionStore>>,
    leaf_states: parking_lot::Mutex<HashMap<(String, String), LeafState>>,
}

impl CompositeEvaluator {
    pub fn new(comparison_tolerance: Option<f64>, store: Option<Arc<dyn ExecutionStore>>) -> Self {
        Self { comparison_tolerance, store, leaf_states: parking_lot::Mutex::new(HashMap::new()) }
    }

    /// Evaluate a tree against the current snapshot.
    pub fn evaluate(&self, node: &CompositeNode, ctx: &EvalContext<'_>, get: ValueGetter<'_>) -> bool {
        self.evaluate_at(node, ctx, get, now_ts(), Local::now())
    }

    /// Evaluation entry point with explicit clocks, for deterministic tests.
    pub fn evaluate_at(
        &self,
        node: &CompositeNode,
        ctx: &EvalContext<'_>,
        get: ValueGetter<'_>,
        now: f64,
        wall: DateTime<Local>,
    ) -> bool {
        self.eval_node(node, ctx, get, now, wall, "r")
    }

    fn eval_node(
        &self,
        node: &CompositeNode,
        ctx: &EvalContext<'_>,
        get: ValueGetter<'_>,
        now: f64,
        wall: DateTime<Local>,
        path: &str,
    ) -> bool {
        match node {
            CompositeNode::All(children) => children
                .iter()
                .enumerate()
                .all(|(i, child)| self.eval_node(child, ctx, get, now, wall, &format!("{path}.{i}"))),
            CompositeNode::Any(children) => children
                .iter()
                .enumerate()
                .any(|(i, child)| self.eval_node(child, ctx, get, now, wall, &format!("{path}.{i}"))),
            CompositeNode::Not(child) => {
                !self.eval_node(child, ctx, get, now, wall, &format!("{path}.n"))
            }
            CompositeNode::Leaf(leaf) => self.eval_leaf(leaf, ctx, get, now, wall, path),
        }
    }

    fn eval_leaf(
        &self,
        leaf: &Leaf,
        ctx: &EvalContext<'_>,
        get: ValueGetter<'_>,
        now: f64,
        wall: DateTime<Local>,
        path: &str,
    ) -> bool {
        let value = match leaf.kind {
            LeafKind::Threshold => {
                let Some(value) = leaf.sources.first().and_then(|s| get(s)) else {
                    return false;
                };
                if value.is_nan() {
                    return false;
                }
                value
            }
            LeafKind::Difference => {
                let (Some(a), Some(b)) =
                    (leaf.sources.first().and_then(|s| get(s)), leaf.sources.get(1).and_then(|s| get(s)))
                else {
                    return false;
                };
                if a.is_nan() || b.is_nan() {
                    return false;
                }
                let diff = a - b;
                if leaf.abs {
                    diff.abs()
                } else {
                    diff
                }
            }
            LeafKind::Average | LeafKind::Sum | LeafKind::Min | LeafKind::Max => {
                let values: Vec<f64> = leaf
                    .sources
                    .iter()
                    .filter_map(|s| get(s))
                    .filter(|v| !v.is_nan())
                    .collect();
                if values.is_empty() {
                    return false;
                }
                match leaf.kind {
                    LeafKind::Average => values.iter().sum::<f64>() / values.len() as f64,
                    LeafKind::Sum => values.iter().sum(),
                    LeafKind::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                    _ => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                }
            }
            LeafKind::TimeElapsed => return self.eval_time_elapsed(leaf, ctx, wall),
        };

        let raw = self.compare(leaf.operator, value, leaf.threshold, leaf.min, leaf.max);
        self.stabilize(leaf, ctx, path, value, raw, now)
    }

    fn compare(
        &self,
        operator: Option<Operator>,
        value: f64,
        threshold: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> bool {
        match operator {
            Some(Operator::Gt) => threshold.map(|t| value > t).unwrap_or(false),
            Some(Operator::Gte) => threshold.map(|t| value >= t).unwrap_or(false),
            Some(Operator::Lt) => threshold.map(|t| value < t).unwrap_or(false),
            Some(Operator::Lte) => threshold.map(|t| value <= t).unwrap_or(false),
            Some(Operator::Eq) => threshold
                .map(|t| match self.comparison_tolerance {
                    Some(tolerance) => (value - t).abs() <= tolerance,
                    None => value == t,
                })
                .unwrap_or(false),
            Some(Operator::Neq) => threshold
                .map(|t| match self.comparison_tolerance {
                    Some(tolerance) => (value - t).abs() > tolerance,
                    None => value != t,
                })
                .unwrap_or(false),
            Some(Operator::Between) => match (min, max) {
                (Some(low), Some(high)) => low <= value && value <= high,
                _ => false,
            },
            None => false,
        }
    }

    fn eval_time_elapsed(&self, leaf: &Leaf, ctx: &EvalContext<'_>, wall: DateTime<Local>) -> bool {
        let Some(store) = &self.store else {
            error!("time_elapsed leaf evaluated without an execution store");
            return false;
        };
        let Some(interval_hours) = leaf.interval_hours.filter(|h| *h > 0.0) else {
            error!("time_elapsed leaf has invalid interval_hours");
            return false;
        };

        match store.last_execution(ctx.rule_code) {
            None => {
                info!(
                    rule = ctx.rule_code,
                    device = %format!("{}_{}", ctx.device_model, ctx.device_slave_id),
                    "time_elapsed first execution"
                );
                store.record_execution(RuleExecutionRecord {
                    rule_code: ctx.rule_code.to_owned(),
                    device_model: ctx.device_model.to_owned(),
                    device_slave_id: ctx.device_slave_id,
                    last_execution_time: wall,
                });
                true
            }
            Some(last) => {
                let elapsed_hours = (wall - last).num_milliseconds() as f64 / 3_600_000.0;
                if elapsed_hours >= interval_hours {
                    info!(
                        rule = ctx.rule_code,
                        elapsed_hours,
                        interval_hours,
                        "time_elapsed triggered"
                    );
                    store.record_execution(RuleExecutionRecord {
                        rule_code: ctx.rule_code.to_owned(),
                        device_model: ctx.device_model.to_owned(),
                        device_slave_id: ctx.device_slave_id,
                        last_execution_time: wall,
                    });
                    true
                } else {
                    debug!(
                        rule = ctx.rule_code,
                        elapsed_hours,
                        remaining_hours = interval_hours - elapsed_hours,
                        "time_elapsed not yet due"
                    );
                    false
                }
            }
        }
    }

    /// Apply hysteresis against the previous latched state, then debounce.
    fn stabilize(
        &self,
        leaf: &Leaf,
        ctx: &EvalContext<'_>,
        path: &str,
        value: f64,
        mut raw_true: bool,
        now: f64,
    ) -> bool {
        let key = (ctx.rule_code.to_owned(), path.to_owned());
        let mut states = self.leaf_states.lock();
        let state = states.entry(key).or_default();
        let held = state.is_true;

        if leaf.hysteresis > 0.0 {
            let hysteresis = leaf.hysteresis;
            raw_true = match (leaf.operator, leaf.threshold) {
                (Some(Operator::Gt), Some(t)) => {
                    if held {
                        value >= t - hysteresis
                    } else {
                        value > t
                    }
                }
                (Some(Operator::Gte), Some(t)) => {
                    if held {
                        value >= t - hysteresis
                    } else {
                        value >= t
                    }
                }
                (Some(Operator::Lt), Some(t)) => {
                    if held {
                        value <= t + hysteresis
                    } else {
                        value < t
                    }
                }
                (Some(Operator::Lte), Some(t)) => {
                    if held {
                        value <= t + hysteresis
                    } else {
                        value <= t
                    }
                }
                (Some(Operator::Between), _) => match (leaf.min, leaf.max) {
                    (Some(low), Some(high)) => {
                        if held {
                            low - hysteresis <= value && value <= high + hysteresis
                        } else {
                            low <= value && value <= high
                        }
                    }
                    _ => raw_true,
                },
                (Some(Operator::Eq), Some(t)) => {
                    let eps = self.comparison_tolerance.unwrap_or(1e-9);
                    if held {
                        (value - t).abs() <= eps + hysteresis
                    } else {
                        (value - t).abs() <= eps
                    }
                }
                _ => raw_true,
            };
        }

        if leaf.debounce_sec > 0.0 {
            if raw_true {
                match state.pending_since {
                    None => {
                        state.pending_since = Some(now);
                        state.is_true = false;
                        return false;
                    }
                    Some(since) if now - since >= leaf.debounce_sec => {
                        state.is_true = true;
                        return true;
                    }
                    Some(_) => {
                        state.is_true = false;
                        return false;
                    }
                }
            }
            state.pending_since = None;
            state.is_true = false;
            return false;
        }

        if !raw_true {
            state.pending_since = None;
        }
        state.is_true = raw_true;
        state.is_true
    }
}

#[cfg(test)]
#[path = "composite_eval_tests.rs"]
mod tests;
