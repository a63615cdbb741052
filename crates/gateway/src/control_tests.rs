// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::composite_eval::CompositeEvaluator;
use indexmap::IndexMap;

fn values(pairs: &[(&str, f64)]) -> IndexMap<String, f64> {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
}

fn constraint_config() -> ConstraintConfig {
    serde_json::from_str(
        r#"{
            "LITEON_EVO6800": {
                "default_constraints": {"RW_HZ": {"min": 30, "max": 55}},
                "instances": {
                    "1": {"constraints": {"RW_HZ": {"min": 55, "max": 57}}},
                    "2": {"use_default_constraints": true}
                }
            }
        }"#,
    )
    .expect("constraint config")
}

fn evaluator_with_rules(device_id: &str, rules_json: &str) -> ControlEvaluator {
    let (model, slave) = crate::snapshot::split_device_id(device_id).expect("device id");
    let rules: Vec<ControlRuleConfig> = serde_json::from_str(rules_json).expect("rules json");
    let mut config = ControlConfig::new();
    let mut instances = HashMap::new();
    instances.insert(slave.to_string(), rules);
    config.insert(model.to_owned(), ModelControls { instances });
    ControlEvaluator::new(config, constraint_config(), CompositeEvaluator::new(None, None))
}

#[test]
fn resolve_constraint_instance_overrides_default() {
    let config = constraint_config();
    let instance = resolve_constraint(&config, "LITEON_EVO6800", 1, "RW_HZ").expect("range");
    assert_eq!(instance.min, Some(55.0));
    assert_eq!(instance.max, Some(57.0));

    let default = resolve_constraint(&config, "LITEON_EVO6800", 2, "RW_HZ").expect("range");
    assert_eq!(default.min, Some(30.0));
    assert_eq!(default.max, Some(55.0));

    assert!(resolve_constraint(&config, "UNKNOWN", 1, "RW_HZ").is_none());
}

#[test]
fn discrete_setpoint_keeps_configured_value() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "HIGH_TEMP", "name": "High Temperature Shutdown", "priority": 80,
            "composite": {"type": "threshold", "sources": ["AIn01"], "operator": "gt", "threshold": 25.0},
            "policy": {"type": "discrete_setpoint"},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 45.0}]
        }]"#,
    );

    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("AIn01", 42.0)]));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::SetFrequency);
    assert_eq!(actions[0].value, Some(45.0));
    assert_eq!(actions[0].priority, 80);
    assert!(actions[0].reason.contains("[HIGH_TEMP]"));
    assert!(actions[0].reason.contains("threshold(AIn01 gt 25)"));
}

#[test]
fn absolute_linear_computes_frequency() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "ABS_TEMP01", "name": "Linear control", "priority": 90,
            "composite": {"type": "threshold", "sources": ["AIn01"], "operator": "gt", "threshold": 25.0},
            "policy": {"type": "absolute_linear", "condition_type": "threshold", "sources": ["AIn01"],
                       "base_freq": 40.0, "base_temp": 25.0, "gain_hz_per_unit": 1.2},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ"}]
        }]"#,
    );

    // base_freq + (29 - 25) * 1.2 = 44.8
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("AIn01", 29.0)]));
    assert_eq!(actions.len(), 1);
    assert!((actions[0].value.expect("value") - 44.8).abs() < 1e-9);
    assert_eq!(actions[0].action_type, ActionType::SetFrequency);
}

#[test]
fn absolute_linear_at_base_temp_uses_base_frequency() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "ABS_TEMP01", "name": "Linear control", "priority": 90,
            "composite": {"type": "threshold", "sources": ["AIn01"], "operator": "gte", "threshold": 25.0},
            "policy": {"type": "absolute_linear", "condition_type": "threshold", "sources": ["AIn01"],
                       "base_freq": 40.0, "base_temp": 25.0, "gain_hz_per_unit": 1.2},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ"}]
        }]"#,
    );
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("AIn01", 25.0)]));
    assert_eq!(actions[0].value, Some(40.0));
}

#[test]
fn incremental_linear_emits_adjustment() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "INC01", "name": "Delta control", "priority": 100,
            "composite": {"type": "difference", "sources": ["AIn01", "AIn02"], "operator": "gt", "threshold": 5.0},
            "policy": {"type": "incremental_linear", "condition_type": "difference",
                       "sources": ["AIn01", "AIn02"], "gain_hz_per_unit": 1.5},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "adjust_frequency", "target": "RW_HZ"}]
        }]"#,
    );

    // 27 - 20 = 7 > 5: matched; adjustment is the configured gain.
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("AIn01", 27.0), ("AIn02", 20.0)]));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::AdjustFrequency);
    assert_eq!(actions[0].value, Some(1.5));
}

#[test]
fn negative_gain_steps_down() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "INC02", "name": "Cooldown", "priority": 100,
            "composite": {"type": "difference", "sources": ["AIn01", "AIn02"], "operator": "lt", "threshold": -5.0},
            "policy": {"type": "incremental_linear", "condition_type": "difference",
                       "sources": ["AIn01", "AIn02"], "gain_hz_per_unit": -1.5},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "adjust_frequency", "target": "RW_HZ"}]
        }]"#,
    );
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("AIn01", 18.0), ("AIn02", 25.0)]));
    assert_eq!(actions[0].value, Some(-1.5));
}

#[test]
fn unmatched_condition_emits_nothing() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "HIGH_TEMP", "name": "x", "priority": 80,
            "composite": {"type": "threshold", "sources": ["AIn01"], "operator": "gt", "threshold": 25.0},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 45.0}]
        }]"#,
    );
    assert!(evaluator.evaluate("TECO_VFD", 2, &values(&[("AIn01", 20.0)])).is_empty());
}

#[test]
fn rules_evaluate_in_priority_order() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[
            {"code": "LOW", "name": "low", "priority": 151,
             "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
             "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 30.0}]},
            {"code": "HIGH", "name": "high", "priority": 95,
             "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
             "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 60.0}]}
        ]"#,
    );
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("A", 1.0)]));
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].priority, 95);
    assert_eq!(actions[1].priority, 151);
}

#[test]
fn blocking_rule_suppresses_lower_priorities() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[
            {"code": "EMERGENCY", "name": "stop", "priority": 1, "blocking": true,
             "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 90.0},
             "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "turn_off"}]},
            {"code": "NORMAL", "name": "run", "priority": 100,
             "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
             "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 50.0}]}
        ]"#,
    );

    // Emergency condition met: only the blocking rule's action appears.
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("A", 95.0)]));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::TurnOff);

    // Emergency not met: the lower-priority rule runs.
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("A", 50.0)]));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::SetFrequency);
}

#[test]
fn frequency_clamped_to_instance_constraints() {
    let evaluator = evaluator_with_rules(
        "LITEON_EVO6800_2",
        r#"[{
            "code": "SET", "name": "set", "priority": 50,
            "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
            "actions": [{"model": "LITEON_EVO6800", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 80.0}]
        }]"#,
    );
    let actions = evaluator.evaluate("LITEON_EVO6800", 2, &values(&[("A", 1.0)]));
    // Default constraints max 55.
    assert_eq!(actions[0].value, Some(55.0));
}

#[test]
fn emergency_override_bypasses_clamp() {
    let evaluator = evaluator_with_rules(
        "LITEON_EVO6800_2",
        r#"[{
            "code": "EMERG", "name": "full speed", "priority": 1,
            "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
            "actions": [{"model": "LITEON_EVO6800", "slave_id": 2, "type": "set_frequency",
                         "target": "RW_HZ", "value": 60.0, "emergency_override": true}]
        }]"#,
    );
    let actions = evaluator.evaluate("LITEON_EVO6800", 2, &values(&[("A", 1.0)]));
    assert_eq!(actions[0].value, Some(60.0));
    assert!(actions[0].reason.contains("[EMERGENCY_OVERRIDE]"));
}

#[test]
fn missing_policy_sources_keep_configured_action() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "ABS", "name": "abs", "priority": 90,
            "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
            "policy": {"type": "absolute_linear", "condition_type": "difference", "sources": ["X", "Y"],
                       "base_freq": 40.0, "base_temp": 25.0, "gain_hz_per_unit": 1.2},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 33.0}]
        }]"#,
    );
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("A", 1.0)]));
    assert_eq!(actions[0].value, Some(33.0));
}

#[test]
fn rule_without_actions_is_dropped() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "NOACT", "name": "no actions", "priority": 10,
            "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
            "actions": []
        }]"#,
    );
    assert!(!evaluator.has_rules_for("TECO_VFD_2"));
}

#[test]
fn invalid_composite_drops_rule_not_siblings() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[
            {"code": "BAD", "name": "bad tree", "priority": 10,
             "composite": {"type": "threshold", "sources": [], "operator": "gt", "threshold": 1.0},
             "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 10.0}]},
            {"code": "GOOD", "name": "good", "priority": 20,
             "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
             "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "set_frequency", "target": "RW_HZ", "value": 20.0}]}
        ]"#,
    );
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("A", 1.0)]));
    assert_eq!(actions.len(), 1);
    assert!(actions[0].reason.contains("[GOOD]"));
}

#[test]
fn default_targets_fill_in() {
    let evaluator = evaluator_with_rules(
        "TECO_VFD_2",
        r#"[{
            "code": "DO1", "name": "digital out", "priority": 10,
            "composite": {"type": "threshold", "sources": ["A"], "operator": "gt", "threshold": 0.0},
            "actions": [{"model": "TECO_VFD", "slave_id": 2, "type": "write_do", "value": 1.0}]
        }]"#,
    );
    let actions = evaluator.evaluate("TECO_VFD", 2, &values(&[("A", 1.0)]));
    assert_eq!(actions[0].target.as_deref(), Some("RW_DO"));
}

#[test]
fn rule_code_extraction() {
    let action = ControlAction {
        model: "M".into(),
        slave_id: 1,
        action_type: ActionType::SetFrequency,
        target: None,
        value: None,
        priority: 1,
        reason: "[FREQ_STEPDOWN_4H] Step down | time_elapsed(interval=4h)".into(),
        emergency_override: false,
    };
    assert_eq!(action.rule_code(), "FREQ_STEPDOWN_4H");

    let no_code = ControlAction { reason: "no brackets".into(), ..action };
    assert_eq!(no_code.rule_code(), "<unknown>");
}
