// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Composite condition trees for alert and control rules.
//!
//! A node is either a logical group (`all` / `any` / `not`) or a leaf
//! condition. Nodes are validated at construction; a rule whose tree fails
//! validation is rejected at load time and never evaluated. The owned tree
//! shape makes cycles unrepresentable, so only depth and width need checking.

use serde::Deserialize;

use crate::error::ConfigError;

pub const MAX_NESTING_DEPTH: usize = 10;
pub const MAX_CHILDREN_PER_NODE: usize = 20;

/// Comparison operator for leaf conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
    Between,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Between => "between",
        }
    }
}

/// Kind of a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafKind {
    Threshold,
    Difference,
    Average,
    Sum,
    Min,
    Max,
    TimeElapsed,
}

impl LeafKind {
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Average | Self::Sum | Self::Min | Self::Max)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Difference => "difference",
            Self::Average => "average",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::TimeElapsed => "time_elapsed",
        }
    }
}

/// A leaf condition with optional stabilization.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub kind: LeafKind,
    pub sources: Vec<String>,
    pub operator: Option<Operator>,
    pub threshold: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub abs: bool,
    pub hysteresis: f64,
    pub debounce_sec: f64,
    pub interval_hours: Option<f64>,
}

/// A validated condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositeNode {
    All(Vec<CompositeNode>),
    Any(Vec<CompositeNode>),
    Not(Box<CompositeNode>),
    Leaf(Leaf),
}

impl CompositeNode {
    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Not(child) => 1 + child.depth(),
            Self::All(children) | Self::Any(children) => {
                1 + children.iter().map(Self::depth).max().unwrap_or(0)
            }
        }
    }

    /// Human-readable condition summary, used in action reason strings.
    pub fn reason_summary(&self) -> String {
        match self {
            Self::All(children) => {
                let parts: Vec<String> = children.iter().map(Self::reason_summary).collect();
                format!("({})", parts.join(" AND "))
            }
            Self::Any(children) => {
                let parts: Vec<String> = children.iter().map(Self::reason_summary).collect();
                format!("({})", parts.join(" OR "))
            }
            Self::Not(child) => format!("NOT({})", child.reason_summary()),
            Self::Leaf(leaf) => leaf.reason_summary(),
        }
    }
}

impl Leaf {
    fn reason_summary(&self) -> String {
        match self.kind {
            LeafKind::Threshold => {
                let sensor = self.sources.first().map(String::as_str).unwrap_or("unknown");
                match self.operator {
                    Some(Operator::Between) => format!(
                        "threshold({sensor} between {}..{})",
                        self.min.unwrap_or_default(),
                        self.max.unwrap_or_default()
                    ),
                    Some(op) => format!(
                        "threshold({sensor} {} {})",
                        op.as_str(),
                        self.threshold.unwrap_or_default()
                    ),
                    None => format!("threshold({sensor})"),
                }
            }
            LeafKind::Difference => {
                let sources = self.sources.join(",");
                let suffix = if self.abs { " abs" } else { "" };
                match self.operator {
                    Some(Operator::Between) => format!(
                        "difference([{sources}] between {}..{}{suffix})",
                        self.min.unwrap_or_default(),
                        self.max.unwrap_or_default()
                    ),
                    Some(op) => format!(
                        "difference([{sources}] {} {}{suffix})",
                        op.as_str(),
                        self.threshold.unwrap_or_default()
                    ),
                    None => format!("difference([{sources}])"),
                }
            }
            LeafKind::TimeElapsed => {
                format!("time_elapsed(interval={}h)", self.interval_hours.unwrap_or_default())
            }
            kind => {
                let sources = self.sources.join(",");
                match self.operator {
                    Some(Operator::Between) => format!(
                        "{}([{sources}]) between {}..{}",
                        kind.as_str(),
                        self.min.unwrap_or_default(),
                        self.max.unwrap_or_default()
                    ),
                    Some(op) => format!(
                        "{}([{sources}]) {} {}",
                        kind.as_str(),
                        op.as_str(),
                        self.threshold.unwrap_or_default()
                    ),
                    None => format!("{}([{sources}])", kind.as_str()),
                }
            }
        }
    }
}

/// On-disk shape of a node before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNode {
    #[serde(default)]
    pub all: Option<Vec<RawNode>>,
    #[serde(default)]
    pub any: Option<Vec<RawNode>>,
    #[serde(default, rename = "not")]
    pub not_: Option<Box<RawNode>>,
    #[serde(default, rename = "type")]
    pub kind: Option<LeafKind>,
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub abs: Option<bool>,
    #[serde(default)]
    pub hysteresis: Option<f64>,
    #[serde(default)]
    pub debounce_sec: Option<f64>,
    #[serde(default)]
    pub interval_hours: Option<f64>,
}

impl RawNode {
    /// Validate and convert into an owned tree. Any structural problem makes
    /// the whole rule invalid.
    pub fn build(self) -> Result<CompositeNode, ConfigError> {
        let node = self.build_inner()?;
        let depth = node.depth();
        if depth > MAX_NESTING_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "composite structure exceeds maximum nesting depth ({MAX_NESTING_DEPTH})"
            )));
        }
        Ok(node)
    }

    fn build_inner(self) -> Result<CompositeNode, ConfigError> {
        let group_count =
            usize::from(self.all.is_some()) + usize::from(self.any.is_some()) + usize::from(self.not_.is_some());
        let is_leaf = self.kind.is_some();

        match (group_count, is_leaf) {
            (1, false) => self.build_group(),
            (0, true) => self.build_leaf(),
            _ => Err(ConfigError::Invalid(
                "node must be either group(all/any/not) or leaf(type=...)".to_owned(),
            )),
        }
    }

    fn build_group(self) -> Result<CompositeNode, ConfigError> {
        if let Some(children) = self.all {
            return Ok(CompositeNode::All(Self::build_children("all", children)?));
        }
        if let Some(children) = self.any {
            return Ok(CompositeNode::Any(Self::build_children("any", children)?));
        }
        if let Some(child) = self.not_ {
            return Ok(CompositeNode::Not(Box::new(child.build_inner()?)));
        }
        Err(ConfigError::Invalid("empty group node".to_owned()))
    }

    fn build_children(
        group: &str,
        children: Vec<RawNode>,
    ) -> Result<Vec<CompositeNode>, ConfigError> {
        if children.is_empty() {
            return Err(ConfigError::Invalid(format!("'{group}' must contain at least one child")));
        }
        if children.len() > MAX_CHILDREN_PER_NODE {
            return Err(ConfigError::Invalid(format!(
                "'{group}' cannot have more than {MAX_CHILDREN_PER_NODE} children"
            )));
        }
        children.into_iter().map(RawNode::build_inner).collect()
    }

    fn build_leaf(self) -> Result<CompositeNode, ConfigError> {
        let Some(kind) = self.kind else {
            return Err(ConfigError::Invalid("leaf node must have 'type'".to_owned()));
        };
        let sources = self
            .sources
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        match kind {
            LeafKind::Threshold => {
                if sources.len() != 1 {
                    return Err(ConfigError::Invalid(
                        "threshold condition requires exactly 1 source".to_owned(),
                    ));
                }
                Self::check_operator_fields(kind, self.operator, self.threshold, self.min, self.max)?;
            }
            LeafKind::Difference => {
                if sources.len() != 2 {
                    return Err(ConfigError::Invalid(
                        "difference condition requires exactly 2 sources".to_owned(),
                    ));
                }
                if sources[0] == sources[1] {
                    return Err(ConfigError::Invalid(
                        "difference condition sources must be different".to_owned(),
                    ));
                }
                Self::check_operator_fields(kind, self.operator, self.threshold, self.min, self.max)?;
            }
            LeafKind::Average | LeafKind::Sum | LeafKind::Min | LeafKind::Max => {
                if sources.len() < 2 {
                    return Err(ConfigError::Invalid(format!(
                        "{} condition requires at least 2 sources",
                        kind.as_str()
                    )));
                }
                let mut unique = sources.clone();
                unique.sort();
                unique.dedup();
                if unique.len() != sources.len() {
                    return Err(ConfigError::Invalid(format!(
                        "{} condition sources must be unique",
                        kind.as_str()
                    )));
                }
                Self::check_operator_fields(kind, self.operator, self.threshold, self.min, self.max)?;
            }
            LeafKind::TimeElapsed => {
                match self.interval_hours {
                    Some(hours) if hours > 0.0 => {}
                    _ => {
                        return Err(ConfigError::Invalid(
                            "time_elapsed condition requires a positive 'interval_hours'".to_owned(),
                        ))
                    }
                }
                if self.operator.is_some()
                    || !sources.is_empty()
                    || self.threshold.is_some()
                    || self.min.is_some()
                    || self.max.is_some()
                {
                    return Err(ConfigError::Invalid(
                        "time_elapsed condition takes only 'interval_hours'".to_owned(),
                    ));
                }
            }
        }

        Ok(CompositeNode::Leaf(Leaf {
            kind,
            sources,
            operator: self.operator,
            threshold: self.threshold,
            min: self.min,
            max: self.max,
            abs: self.abs.unwrap_or(false),
            hysteresis: self.hysteresis.unwrap_or(0.0),
            debounce_sec: self.debounce_sec.unwrap_or(0.0),
            interval_hours: self.interval_hours,
        }))
    }

    fn check_operator_fields(
        kind: LeafKind,
        operator: Option<Operator>,
        threshold: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Result<(), ConfigError> {
        let Some(operator) = operator else {
            return Err(ConfigError::Invalid(format!(
                "{} condition requires 'operator'",
                kind.as_str()
            )));
        };
        match operator {
            Operator::Between => {
                let (Some(low), Some(high)) = (min, max) else {
                    return Err(ConfigError::Invalid(
                        "BETWEEN operator requires both 'min' and 'max' values".to_owned(),
                    ));
                };
                if low >= high {
                    return Err(ConfigError::Invalid(
                        "for BETWEEN operator, 'min' must be less than 'max'".to_owned(),
                    ));
                }
                if threshold.is_some() {
                    return Err(ConfigError::Invalid(
                        "BETWEEN operator should not specify 'threshold'".to_owned(),
                    ));
                }
            }
            _ => {
                if threshold.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "{} operator requires 'threshold' value",
                        operator.as_str().to_uppercase()
                    )));
                }
                if min.is_some() || max.is_some() {
                    return Err(ConfigError::Invalid(format!(
                        "{} operator should not specify 'min' or 'max'",
                        operator.as_str().to_uppercase()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "composite_tests.rs"]
mod tests;
