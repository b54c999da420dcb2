//! Projecting a metadata policy onto a metadata document.
//!
//! Operators run in the fixed order value, add, default, one_of, subset_of,
//! superset_of, essential. A document that cannot satisfy the policy is a
//! `Violation`; the input is never mutated.

use serde_json::{Map, Value};

use super::{OPERATORS, PolicyError};

type Result<T> = std::result::Result<T, PolicyError>;

/// Apply a metadata policy (`{entity_type: {param: {op: …}}}`) to a metadata
/// document, returning the transformed document.
///
/// Entity types named by the policy but absent from the metadata are skipped;
/// a subordinate that is only an RP is not held to the OP policy.
pub fn apply_policy(policy: &Value, metadata: &Value) -> Result<Value> {
    let policy = policy
        .as_object()
        .ok_or_else(|| PolicyError::Violation("policy must be a JSON object".into()))?;
    let metadata = metadata
        .as_object()
        .ok_or_else(|| PolicyError::Violation("metadata must be a JSON object".into()))?;

    let mut out = metadata.clone();
    for (entity_type, params) in policy {
        let Some(target) = out.get_mut(entity_type) else {
            continue;
        };
        let params = params.as_object().ok_or_else(|| {
            PolicyError::Violation(format!("{entity_type} policy must be a JSON object"))
        })?;
        let target = target.as_object_mut().ok_or_else(|| {
            PolicyError::Violation(format!("{entity_type} metadata must be a JSON object"))
        })?;
        for (param, ops) in params {
            apply_param(param, ops, target)?;
        }
    }
    Ok(Value::Object(out))
}

fn apply_param(param: &str, ops: &Value, target: &mut Map<String, Value>) -> Result<()> {
    let ops = ops
        .as_object()
        .ok_or_else(|| PolicyError::Violation(format!("{param} policy must be a JSON object")))?;
    for key in ops.keys() {
        if !OPERATORS.contains(&key.as_str()) {
            return Err(PolicyError::Violation(format!(
                "{param}: unknown policy operator {key}"
            )));
        }
    }

    if let Some(value) = ops.get("value") {
        target.insert(param.into(), value.clone());
    }

    if let Some(add) = ops.get("add") {
        let add = list(param, "add", add)?;
        let current = target
            .entry(param.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let current = current.as_array_mut().ok_or_else(|| {
            PolicyError::Violation(format!("{param}: add applies to an array value"))
        })?;
        for v in add {
            if !current.contains(&v) {
                current.push(v);
            }
        }
    }

    if let Some(default) = ops.get("default") {
        if !target.contains_key(param) {
            target.insert(param.into(), default.clone());
        }
    }

    if let Some(one_of) = ops.get("one_of") {
        let allowed = list(param, "one_of", one_of)?;
        if let Some(present) = target.get(param) {
            if !allowed.contains(present) {
                return Err(PolicyError::Violation(format!(
                    "{param}: {present} is not one of the allowed values"
                )));
            }
        }
    }

    if let Some(subset) = ops.get("subset_of") {
        let allowed = list(param, "subset_of", subset)?;
        if let Some(present) = target.get(param) {
            let values = present.as_array().ok_or_else(|| {
                PolicyError::Violation(format!("{param}: subset_of applies to an array value"))
            })?;
            let filtered: Vec<Value> = values
                .iter()
                .filter(|v| allowed.contains(v))
                .cloned()
                .collect();
            // An empty intersection removes the parameter entirely;
            // essential below decides whether that is fatal.
            if filtered.is_empty() {
                target.remove(param);
            } else {
                target.insert(param.into(), Value::Array(filtered));
            }
        }
    }

    if let Some(superset) = ops.get("superset_of") {
        let required = list(param, "superset_of", superset)?;
        if let Some(present) = target.get(param) {
            let values = present.as_array().ok_or_else(|| {
                PolicyError::Violation(format!("{param}: superset_of applies to an array value"))
            })?;
            if required.iter().any(|v| !values.contains(v)) {
                return Err(PolicyError::Violation(format!(
                    "{param}: missing values required by superset_of"
                )));
            }
        }
    }

    if ops.get("essential").and_then(Value::as_bool) == Some(true)
        && !target.contains_key(param)
    {
        return Err(PolicyError::Violation(format!(
            "{param}: essential parameter is missing"
        )));
    }

    Ok(())
}

fn list(param: &str, op: &str, value: &Value) -> Result<Vec<Value>> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| PolicyError::Violation(format!("{param}: {op} must be an array")))
}
