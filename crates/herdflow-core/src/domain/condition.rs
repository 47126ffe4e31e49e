//! Exit and entry conditions and their evaluation
//!
//! Conditions are folded strictly left to right: the logical operator
//! stored on condition `i` joins the running result with the result of
//! condition `i + 1`. There is no grouping and no precedence.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::ClinicalSnapshot;
use crate::CoreError;

/// Comparison operator of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionOperator {
    /// Strictly greater
    #[serde(rename = ">")]
    GreaterThan,
    /// Strictly less
    #[serde(rename = "<")]
    LessThan,
    /// Greater or equal
    #[serde(rename = ">=")]
    GreaterOrEqual,
    /// Less or equal
    #[serde(rename = "<=")]
    LessOrEqual,
    /// Equal
    #[serde(rename = "==")]
    Equal,
    /// Not equal
    #[serde(rename = "!=")]
    NotEqual,
    /// Substring or membership
    #[serde(rename = "contains")]
    Contains,
    /// Negated substring or membership
    #[serde(rename = "not_contains")]
    NotContains,
}

impl ConditionOperator {
    fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::GreaterThan | Self::LessThan | Self::GreaterOrEqual | Self::LessOrEqual
        )
    }

    fn is_containment(self) -> bool {
        matches!(self, Self::Contains | Self::NotContains)
    }
}

/// How a condition's result joins the next condition's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    /// Both must hold
    And,
    /// Either may hold
    Or,
}

impl LogicalOperator {
    fn combine(self, left: bool, right: bool) -> bool {
        match self {
            Self::And => left && right,
            Self::Or => left || right,
        }
    }
}

/// A single field/operator/value test against a clinical snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCondition {
    /// Condition identifier
    pub id: String,

    /// Registered field name
    pub field: String,

    /// Comparison operator
    pub operator: ConditionOperator,

    /// Value compared against the snapshot
    pub value: Value,

    /// Relation to the next condition in the list, AND when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_operator: Option<LogicalOperator>,
}

impl WorkflowCondition {
    /// Create a condition without a chaining operator
    pub fn new(id: &str, field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            id: id.to_string(),
            field: field.to_string(),
            operator,
            value,
            logical_operator: None,
        }
    }

    /// Set the operator joining this condition with the next one
    pub fn then(mut self, logical_operator: LogicalOperator) -> Self {
        self.logical_operator = Some(logical_operator);
        self
    }
}

/// Value type of a registered condition field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldKind {
    /// Integer or decimal
    Numeric,
    /// True/false
    Boolean,
    /// Free or enumerated text
    Text,
    /// Array of values
    List,
}

impl FieldKind {
    fn accepts_operator(self, operator: ConditionOperator) -> bool {
        match self {
            Self::Numeric => !operator.is_containment(),
            Self::Boolean => matches!(operator, ConditionOperator::Equal | ConditionOperator::NotEqual),
            Self::Text => !operator.is_ordering(),
            Self::List => operator.is_containment(),
        }
    }

    fn accepts_value(self, operator: ConditionOperator, value: &Value) -> bool {
        match self {
            Self::Numeric => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Text => value.is_string(),
            // Membership tests compare against a single element
            Self::List if operator.is_containment() => !value.is_array() && !value.is_null(),
            Self::List => false,
        }
    }
}

/// Schema entry for one condition field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Field name used in conditions
    pub name: String,

    /// Expected value type
    pub kind: FieldKind,

    /// Lookup path in the clinical snapshot
    pub path: String,
}

/// Registered condition-field vocabulary
///
/// Templates are checked against it at registration time so a misspelt
/// field or a wrongly typed comparison never reaches evaluation.
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    fields: HashMap<String, FieldSchema>,
}

impl FieldRegistry {
    /// Registry with no fields
    pub fn empty() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }

    /// Register a field, replacing any earlier schema with the same name
    pub fn register(&mut self, name: &str, kind: FieldKind, path: &str) {
        self.fields.insert(
            name.to_string(),
            FieldSchema {
                name: name.to_string(),
                kind,
                path: path.to_string(),
            },
        );
    }

    /// Builder form of [`FieldRegistry::register`]
    pub fn with_field(mut self, name: &str, kind: FieldKind, path: &str) -> Self {
        self.register(name, kind, path);
        self
    }

    /// Look up a field schema
    pub fn get(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// Snapshot path for a field, falling back to the name itself
    pub fn path_for<'a>(&'a self, name: &'a str) -> &'a str {
        self.fields
            .get(name)
            .map(|schema| schema.path.as_str())
            .unwrap_or(name)
    }

    /// Check one condition against the schema
    pub fn validate_condition(&self, condition: &WorkflowCondition) -> Result<(), CoreError> {
        let schema = self.get(&condition.field).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Condition {} references unknown field: {}",
                condition.id, condition.field
            ))
        })?;

        if !schema.kind.accepts_operator(condition.operator) {
            return Err(CoreError::ValidationError(format!(
                "Condition {}: operator {:?} is not valid for {:?} field {}",
                condition.id, condition.operator, schema.kind, condition.field
            )));
        }

        if !schema.kind.accepts_value(condition.operator, &condition.value) {
            return Err(CoreError::ValidationError(format!(
                "Condition {}: value {} does not match {:?} field {}",
                condition.id, condition.value, schema.kind, condition.field
            )));
        }

        Ok(())
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::empty()
            .with_field("follicle_count", FieldKind::Numeric, "follicle_count")
            .with_field("dominant_follicle_size", FieldKind::Numeric, "dominant_follicle_size")
            .with_field("cl_presence", FieldKind::Boolean, "cl_presence")
            .with_field("pregnancy_status", FieldKind::Text, "pregnancy_status")
            .with_field("endometritis", FieldKind::Text, "endometritis")
            .with_field("endometrial_thickness", FieldKind::Numeric, "endometrial_thickness")
            .with_field("uterine_tone", FieldKind::Text, "uterine_tone")
            .with_field("breeding_readiness", FieldKind::Text, "breeding_readiness")
            .with_field("overall_assessment", FieldKind::Text, "overall_assessment")
            .with_field("recommendations", FieldKind::List, "recommendations")
            .with_field(
                "days_since_last_injection",
                FieldKind::Numeric,
                "days_since_last_injection",
            )
            .with_field(
                "last_injection_medication",
                FieldKind::Text,
                "last_injection_medication",
            )
            .with_field("days_since_last_exam", FieldKind::Numeric, "days_since_last_exam")
            .with_field("reproductive_status", FieldKind::Text, "reproductive_status")
            .with_field("warning_flags", FieldKind::List, "warning_flags")
    }
}

/// Why a single condition produced its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOutcome {
    /// Compared and held
    Matched,
    /// Compared and did not hold
    NotMatched,
    /// Field absent from the snapshot
    MissingField,
    /// Snapshot value type incompatible with the operator or comparison value
    TypeMismatch,
}

/// Result of evaluating a condition list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionEvaluation {
    /// Folded result
    pub result: bool,

    /// Result per condition, in list order
    pub per_condition: Vec<bool>,

    /// Diagnostic per condition, in list order
    pub outcomes: Vec<ConditionOutcome>,
}

impl ConditionEvaluation {
    /// Share (0-100) of per-condition results agreeing with `result`
    pub fn confidence(&self) -> u8 {
        if self.per_condition.is_empty() {
            return 100;
        }
        let agreeing = self
            .per_condition
            .iter()
            .filter(|r| **r == self.result)
            .count();
        ((agreeing * 100) / self.per_condition.len()) as u8
    }
}

/// Evaluates a condition list against a snapshot
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate the conditions; never fails
    fn evaluate(
        &self,
        conditions: &[WorkflowCondition],
        snapshot: &ClinicalSnapshot,
    ) -> ConditionEvaluation;
}

/// Default evaluator backed by a field registry
#[derive(Debug, Clone, Default)]
pub struct DefaultConditionEvaluator {
    fields: FieldRegistry,
}

impl DefaultConditionEvaluator {
    /// Create an evaluator using the given field vocabulary
    pub fn new(fields: FieldRegistry) -> Self {
        Self { fields }
    }

    fn evaluate_one(
        &self,
        condition: &WorkflowCondition,
        snapshot: &ClinicalSnapshot,
    ) -> ConditionOutcome {
        let path = self.fields.path_for(&condition.field);
        let actual = match snapshot.lookup(path) {
            Some(value) => value,
            None => return ConditionOutcome::MissingField,
        };

        match compare(condition.operator, &actual, &condition.value) {
            Some(true) => ConditionOutcome::Matched,
            Some(false) => ConditionOutcome::NotMatched,
            None => ConditionOutcome::TypeMismatch,
        }
    }
}

impl ConditionEvaluator for DefaultConditionEvaluator {
    fn evaluate(
        &self,
        conditions: &[WorkflowCondition],
        snapshot: &ClinicalSnapshot,
    ) -> ConditionEvaluation {
        let outcomes: Vec<ConditionOutcome> = conditions
            .iter()
            .map(|condition| self.evaluate_one(condition, snapshot))
            .collect();

        let per_condition: Vec<bool> = outcomes
            .iter()
            .map(|outcome| *outcome == ConditionOutcome::Matched)
            .collect();

        let mut result = per_condition.first().copied().unwrap_or(true);
        for i in 1..per_condition.len() {
            let joiner = conditions[i - 1]
                .logical_operator
                .unwrap_or(LogicalOperator::And);
            result = joiner.combine(result, per_condition[i]);
        }

        for (condition, outcome) in conditions.iter().zip(outcomes.iter()) {
            if matches!(
                outcome,
                ConditionOutcome::MissingField | ConditionOutcome::TypeMismatch
            ) {
                tracing::debug!(
                    condition_id = %condition.id,
                    field = %condition.field,
                    outcome = ?outcome,
                    "Condition evaluated to false"
                );
            }
        }

        ConditionEvaluation {
            result,
            per_condition,
            outcomes,
        }
    }
}

/// Compare a snapshot value with a condition value; `None` on type mismatch
fn compare(operator: ConditionOperator, actual: &Value, expected: &Value) -> Option<bool> {
    use ConditionOperator::*;

    match operator {
        GreaterThan | LessThan | GreaterOrEqual | LessOrEqual => {
            let (a, e) = (actual.as_f64()?, expected.as_f64()?);
            Some(match operator {
                GreaterThan => a > e,
                LessThan => a < e,
                GreaterOrEqual => a >= e,
                _ => a <= e,
            })
        }
        Equal => equals(actual, expected),
        NotEqual => equals(actual, expected).map(|eq| !eq),
        Contains => contains(actual, expected),
        NotContains => contains(actual, expected).map(|found| !found),
    }
}

fn equals(actual: &Value, expected: &Value) -> Option<bool> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(e)) => Some(a.as_f64()? == e.as_f64()?),
        (Value::String(a), Value::String(e)) => Some(a.eq_ignore_ascii_case(e)),
        (Value::Bool(a), Value::Bool(e)) => Some(a == e),
        _ => None,
    }
}

fn contains(actual: &Value, expected: &Value) -> Option<bool> {
    match actual {
        Value::String(haystack) => {
            let needle = expected.as_str()?;
            Some(haystack.to_lowercase().contains(&needle.to_lowercase()))
        }
        Value::Array(items) => Some(
            items
                .iter()
                .any(|item| equals(item, expected).unwrap_or(false)),
        ),
        _ => None,
    }
}
