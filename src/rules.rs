use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metrics map as carried by telemetry payloads and rule-eval tasks.
pub type Metrics = BTreeMap<String, serde_json::Number>;

/// One node of a rule's condition tree.
///
/// The JSON form discriminates by the presence of `conditions`:
///
/// ```json
/// {"operator": "AND", "conditions": [
///     {"parameter": "temp", "operator": "gt", "value": 50},
///     {"operator": "OR", "conditions": [
///         {"parameter": "pressure", "operator": "lt", "value": 50},
///         {"parameter": "humidity", "operator": "gt", "value": 80}
///     ]}
/// ]}
/// ```
///
/// Operators stay strings so that [`evaluate`] can stay total: an unknown
/// operator evaluates to false instead of failing the whole tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Branch {
        operator: String,
        conditions: Vec<Condition>,
    },
    Leaf {
        parameter: String,
        operator: String,
        value: serde_json::Value,
    },
}

/// Evaluate a condition tree against a metrics map.
///
/// Total and pure: never panics, never touches I/O, and every malformed
/// input (unknown operator, missing parameter, non-numeric threshold,
/// empty children, NaN on either side) collapses to `false`. Children are
/// evaluated in order with short-circuiting.
pub fn evaluate(cond: &Condition, metrics: &Metrics) -> bool {
    match cond {
        Condition::Branch { operator, conditions } => {
            if conditions.is_empty() {
                return false;
            }
            match operator.to_ascii_uppercase().as_str() {
                "AND" => conditions.iter().all(|c| evaluate(c, metrics)),
                "OR" => conditions.iter().any(|c| evaluate(c, metrics)),
                _ => false,
            }
        }
        Condition::Leaf { parameter, operator, value } => {
            let Some(actual) = metrics.get(parameter).and_then(|n| n.as_f64()) else {
                return false;
            };
            let Some(threshold) = value.as_f64() else {
                return false;
            };
            compare(actual, operator, threshold)
        }
    }
}

/// Leaf comparison at double precision. NaN on either side compares false
/// under every operator, including neq.
fn compare(actual: f64, operator: &str, threshold: f64) -> bool {
    if actual.is_nan() || threshold.is_nan() {
        return false;
    }
    match operator {
        "gt" => actual > threshold,
        "lt" => actual < threshold,
        "gte" => actual >= threshold,
        "lte" => actual <= threshold,
        "eq" => actual == threshold,
        "neq" => actual != threshold,
        _ => false,
    }
}

/// Build the human-readable alert message for a fired rule.
///
/// Renders the matching top-level leaves as
/// `"[<rule name>] <parameter> (<actual>) <op> <threshold> AND …"`.
/// Nested and non-matching leaves are omitted; the text is advisory only.
pub fn build_alert_message(rule_name: &str, cond: &Condition, metrics: &Metrics) -> String {
    let mut parts = Vec::new();
    let top_level: Vec<&Condition> = match cond {
        Condition::Branch { conditions, .. } => conditions.iter().collect(),
        leaf @ Condition::Leaf { .. } => vec![leaf],
    };

    for node in top_level {
        if let Condition::Leaf { parameter, operator, value } = node {
            if !evaluate(node, metrics) {
                continue;
            }
            if let Some(actual) = metrics.get(parameter) {
                parts.push(format!("{parameter} ({actual}) {operator} {value}"));
            }
        }
    }

    let detail = if parts.is_empty() {
        "Condition triggered".to_string()
    } else {
        parts.join(" AND ")
    };
    format!("[{rule_name}] {detail}")
}
