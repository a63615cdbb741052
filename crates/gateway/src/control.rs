// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control rule evaluation: composite gates, policies, constraint clamping,
//! and priority-ordered action emission.
//!
//! Rules run in priority order (lower number first, declaration order within
//! equal priority). A matched blocking rule suppresses everything below it.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::composite::{CompositeNode, RawNode};
use crate::composite_eval::{CompositeEvaluator, EvalContext};
use crate::device::ValueRange;
use crate::snapshot::is_missing;

/// Action verbs a control rule can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SetFrequency,
    AdjustFrequency,
    WriteDo,
    Reset,
    TurnOn,
    TurnOff,
}

impl ActionType {
    /// Conventional target register when the action does not name one.
    pub fn default_target(&self) -> Option<&'static str> {
        match self {
            Self::SetFrequency | Self::AdjustFrequency => Some("RW_HZ"),
            Self::WriteDo => Some("RW_DO"),
            Self::Reset => Some("RW_RESET"),
            Self::TurnOn | Self::TurnOff => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetFrequency => "set_frequency",
            Self::AdjustFrequency => "adjust_frequency",
            Self::WriteDo => "write_do",
            Self::Reset => "reset",
            Self::TurnOn => "turn_on",
            Self::TurnOff => "turn_off",
        }
    }
}

/// Value policy applied to a matched rule's actions.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Keep the configured value as-is.
    DiscreteSetpoint,
    /// `value = base_freq + (observed - base_temp) * gain_hz_per_unit`.
    AbsoluteLinear {
        condition_type: PolicyConditionType,
        sources: Vec<String>,
        base_temp: f64,
        base_freq: f64,
        gain_hz_per_unit: f64,
    },
    /// Emit an adjust_frequency of `gain_hz_per_unit`.
    IncrementalLinear {
        condition_type: PolicyConditionType,
        sources: Vec<String>,
        gain_hz_per_unit: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyConditionType {
    Threshold,
    Difference,
}

/// Configured action template.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    pub model: String,
    pub slave_id: u8,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub emergency_override: bool,
}

/// A runtime action, value resolved and reason attached.
#[derive(Debug, Clone)]
pub struct ControlAction {
    pub model: String,
    pub slave_id: u8,
    pub action_type: ActionType,
    pub target: Option<String>,
    pub value: Option<f64>,
    pub priority: u32,
    pub reason: String,
    pub emergency_override: bool,
}

impl ControlAction {
    pub fn device_id(&self) -> String {
        crate::snapshot::device_id(&self.model, self.slave_id)
    }

    /// Rule code embedded in the reason string, `"[CODE] name | ..."`.
    pub fn rule_code(&self) -> &str {
        let reason = self.reason.as_str();
        if let Some(start) = reason.find('[') {
            if let Some(end) = reason[start + 1..].find(']') {
                return &reason[start + 1..start + 1 + end];
            }
        }
        "<unknown>"
    }
}

/// On-disk rule shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRuleConfig {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub blocking: bool,
    pub composite: RawNode,
    #[serde(default)]
    pub policy: Option<PolicyConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelControls {
    #[serde(default)]
    pub instances: HashMap<String, Vec<ControlRuleConfig>>,
}

/// Full control configuration: model -> slave id -> rules.
pub type ControlConfig = HashMap<String, ModelControls>;

/// A validated rule.
#[derive(Debug, Clone)]
pub struct ControlRule {
    pub code: String,
    pub name: String,
    pub priority: u32,
    pub blocking: bool,
    pub composite: CompositeNode,
    pub policy: Option<PolicyConfig>,
    pub actions: Vec<ActionConfig>,
}

impl ControlRuleConfig {
    fn build(self) -> Result<ControlRule, crate::error::ConfigError> {
        if self.actions.is_empty() {
            return Err(crate::error::ConfigError::Invalid(format!(
                "rule '{}': no actions defined",
                self.code
            )));
        }
        Ok(ControlRule {
            code: self.code,
            name: self.name,
            priority: self.priority,
            blocking: self.blocking,
            composite: self.composite.build()?,
            policy: self.policy,
            actions: self.actions,
        })
    }
}

// ---- constraints ----

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceConstraints {
    #[serde(default)]
    pub constraints: HashMap<String, ValueRange>,
    #[serde(default)]
    pub use_default_constraints: bool,
    #[serde(default)]
    pub startup_frequency: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConstraints {
    #[serde(default)]
    pub default_constraints: HashMap<String, ValueRange>,
    #[serde(default)]
    pub instances: HashMap<String, InstanceConstraints>,
}

/// Per-model write constraints: model -> instance -> pin ranges.
pub type ConstraintConfig = HashMap<String, ModelConstraints>;

/// Resolve the effective range for a target register, instance overrides
/// first, model defaults otherwise.
pub fn resolve_constraint(
    config: &ConstraintConfig,
    model: &str,
    slave_id: u8,
    target: &str,
) -> Option<ValueRange> {
    let model_constraints = config.get(model)?;
    if let Some(instance) = model_constraints.instances.get(&slave_id.to_string()) {
        if let Some(range) = instance.constraints.get(target) {
            return Some(*range);
        }
    }
    model_constraints.default_constraints.get(target).copied()
}

/// Evaluates control rules for each device snapshot.
pub struct ControlEvaluator {
    rules: HashMap<String, Vec<ControlRule>>,
    constraints: ConstraintConfig,
    composite: CompositeEvaluator,
}

impl ControlEvaluator {
    pub fn new(
        config: ControlConfig,
        constraints: ConstraintConfig,
        composite: CompositeEvaluator,
    ) -> Self {
        let mut rules: HashMap<String, Vec<ControlRule>> = HashMap::new();
        for (model, model_config) in config {
            for (slave_id, rule_configs) in model_config.instances {
                let device_id = format!("{model}_{slave_id}");
                let mut built = Vec::new();
                for rule_config in rule_configs {
                    let code = rule_config.code.clone();
                    match rule_config.build() {
                        Ok(rule) => built.push(rule),
                        Err(e) => {
                            warn!(device = %device_id, code = %code, "invalid control rule dropped: {e}")
                        }
                    }
                }
                if !built.is_empty() {
                    // Stable sort keeps declaration order within a priority.
                    built.sort_by_key(|rule| rule.priority);
                    info!(device = %device_id, count = built.len(), "control rules loaded");
                    rules.insert(device_id, built);
                }
            }
        }
        Self { rules, constraints, composite }
    }

    pub fn has_rules_for(&self, device_id: &str) -> bool {
        self.rules.contains_key(device_id)
    }

    /// Produce the ordered action list for one snapshot.
    pub fn evaluate(
        &self,
        model: &str,
        slave_id: u8,
        values: &indexmap::IndexMap<String, f64>,
    ) -> Vec<ControlAction> {
        let device_id = crate::snapshot::device_id(model, slave_id);
        let Some(rules) = self.rules.get(&device_id) else {
            return Vec::new();
        };

        let get = |key: &str| values.get(key).copied().filter(|v| !is_missing(*v));
        let mut actions = Vec::new();

        for rule in rules {
            let ctx = EvalContext {
                rule_code: &rule.code,
                device_model: model,
                device_slave_id: slave_id,
            };
            if !self.composite.evaluate(&rule.composite, &ctx, &get) {
                continue;
            }
            let summary = rule.composite.reason_summary();
            let reason = format!("[{}] {} | {}", rule.code, rule.name, summary);
            debug!(device = %device_id, rule = %rule.code, priority = rule.priority, "control rule matched");

            for template in &rule.actions {
                if let Some(action) = self.resolve_action(rule, template, values, &reason) {
                    actions.push(action);
                }
            }

            if rule.blocking {
                info!(device = %device_id, rule = %rule.code, "blocking rule matched, suppressing lower priorities");
                break;
            }
        }
        actions
    }

    fn resolve_action(
        &self,
        rule: &ControlRule,
        template: &ActionConfig,
        values: &indexmap::IndexMap<String, f64>,
        reason: &str,
    ) -> Option<ControlAction> {
        let mut action = ControlAction {
            model: template.model.clone(),
            slave_id: template.slave_id,
            action_type: template.action_type,
            target: template
                .target
                .clone()
                .or_else(|| template.action_type.default_target().map(str::to_owned)),
            value: template.value,
            priority: rule.priority,
            reason: reason.to_owned(),
            emergency_override: template.emergency_override,
        };

        match &rule.policy {
            None | Some(PolicyConfig::DiscreteSetpoint) => {}
            Some(PolicyConfig::AbsoluteLinear {
                condition_type,
                sources,
                base_temp,
                base_freq,
                gain_hz_per_unit,
            }) => {
                let Some(observed) = condition_value(*condition_type, sources, values) else {
                    warn!(rule = %rule.code, "policy sources missing from snapshot, keeping configured action");
                    return Some(action);
                };
                action.action_type = ActionType::SetFrequency;
                action.value = Some(base_freq + (observed - base_temp) * gain_hz_per_unit);
            }
            Some(PolicyConfig::IncrementalLinear { condition_type, sources, gain_hz_per_unit }) => {
                if condition_value(*condition_type, sources, values).is_none() {
                    warn!(rule = %rule.code, "policy sources missing from snapshot, keeping configured action");
                    return Some(action);
                }
                action.action_type = ActionType::AdjustFrequency;
                action.value = Some(*gain_hz_per_unit);
            }
        }

        self.apply_constraints(&mut action);
        Some(action)
    }

    /// Clamp resolved frequencies into the device's constraint range, unless
    /// the action is an emergency override.
    fn apply_constraints(&self, action: &mut ControlAction) {
        if action.action_type != ActionType::SetFrequency {
            return;
        }
        let (Some(target), Some(value)) = (action.target.as_deref(), action.value) else {
            return;
        };
        let Some(range) = resolve_constraint(&self.constraints, &action.model, action.slave_id, target)
        else {
            return;
        };

        if action.emergency_override {
            if !action.reason.contains("[EMERGENCY_OVERRIDE]") {
                action.reason.push_str(" [EMERGENCY_OVERRIDE]");
            }
            // The emergency target wins; an explicit max at or above it is
            // already satisfied, one below it is bypassed on purpose.
            return;
        }

        let mut clamped = value;
        if let Some(min) = range.min {
            clamped = clamped.max(min);
        }
        if let Some(max) = range.max {
            clamped = clamped.min(max);
        }
        if clamped != value {
            info!(
                device = %action.device_id(),
                target,
                from = value,
                to = clamped,
                "frequency clamped by constraint"
            );
            action.value = Some(clamped);
        }
    }
}

/// Observed value for a policy: single source or a two-source difference.
fn condition_value(
    condition_type: PolicyConditionType,
    sources: &[String],
    values: &indexmap::IndexMap<String, f64>,
) -> Option<f64> {
    let get = |key: &String| values.get(key).copied().filter(|v| !is_missing(*v));
    match condition_type {
        PolicyConditionType::Threshold => sources.first().and_then(get),
        PolicyConditionType::Difference => {
            let a = sources.first().and_then(get)?;
            let b = sources.get(1).and_then(get)?;
            Some(a - b)
        }
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
