//! Combining two metadata-policy documents.
//!
//! The superior's (trust anchor's) policy merges on top of a subordinate's.
//! Incompatible combinators — disagreeing `value`s, disjoint `one_of` sets —
//! are a `MergeConflict`; the admission pipeline treats that as a refusal.

use serde_json::{Map, Value, json};

use super::{OPERATORS, PolicyError};

type Result<T> = std::result::Result<T, PolicyError>;

/// Merge two metadata-policy documents (`{entity_type: {param: {op: …}}}`).
///
/// Entity types and parameters present on only one side pass through
/// unchanged; shared parameters merge operator by operator.
pub fn merge_policies(superior: &Value, subordinate: &Value) -> Result<Value> {
    let sup = as_object(superior, "superior policy")?;
    let sub = as_object(subordinate, "subordinate policy")?;

    let mut merged = Map::new();
    for (entity_type, sup_params) in sup {
        match sub.get(entity_type) {
            Some(sub_params) => {
                let sup_params = as_object(sup_params, entity_type)?;
                let sub_params = as_object(sub_params, entity_type)?;
                let mut out = Map::new();
                for (param, sup_ops) in sup_params {
                    match sub_params.get(param) {
                        Some(sub_ops) => {
                            out.insert(
                                param.clone(),
                                merge_param(param, sup_ops, sub_ops)?,
                            );
                        }
                        None => {
                            validate_operators(param, sup_ops)?;
                            out.insert(param.clone(), sup_ops.clone());
                        }
                    }
                }
                for (param, sub_ops) in sub_params {
                    if !sup_params.contains_key(param) {
                        validate_operators(param, sub_ops)?;
                        out.insert(param.clone(), sub_ops.clone());
                    }
                }
                merged.insert(entity_type.clone(), Value::Object(out));
            }
            None => {
                merged.insert(entity_type.clone(), sup_params.clone());
            }
        }
    }
    for (entity_type, sub_params) in sub {
        if !sup.contains_key(entity_type) {
            merged.insert(entity_type.clone(), sub_params.clone());
        }
    }
    Ok(Value::Object(merged))
}

fn merge_param(param: &str, superior: &Value, subordinate: &Value) -> Result<Value> {
    let sup = as_object(superior, param)?;
    let sub = as_object(subordinate, param)?;
    validate_operators(param, superior)?;
    validate_operators(param, subordinate)?;

    let mut out = Map::new();

    // value and default must agree when both sides set them
    for op in ["value", "default"] {
        match (sup.get(op), sub.get(op)) {
            (Some(a), Some(b)) if a != b => {
                return Err(PolicyError::MergeConflict(format!(
                    "{param}: {op} disagrees ({a} vs {b})"
                )));
            }
            (Some(a), _) => {
                out.insert(op.into(), a.clone());
            }
            (None, Some(b)) => {
                out.insert(op.into(), b.clone());
            }
            (None, None) => {}
        }
    }

    // one_of and subset_of narrow to the intersection
    for op in ["one_of", "subset_of"] {
        match (sup.get(op), sub.get(op)) {
            (Some(a), Some(b)) => {
                let merged = intersect(list(param, op, a)?, list(param, op, b)?);
                if merged.is_empty() {
                    return Err(PolicyError::MergeConflict(format!(
                        "{param}: {op} intersection is empty"
                    )));
                }
                out.insert(op.into(), Value::Array(merged));
            }
            (Some(a), None) | (None, Some(a)) => {
                out.insert(op.into(), a.clone());
            }
            (None, None) => {}
        }
    }

    // add and superset_of widen to the union
    for op in ["add", "superset_of"] {
        match (sup.get(op), sub.get(op)) {
            (Some(a), Some(b)) => {
                let merged = union(list(param, op, a)?, list(param, op, b)?);
                out.insert(op.into(), Value::Array(merged));
            }
            (Some(a), None) | (None, Some(a)) => {
                out.insert(op.into(), a.clone());
            }
            (None, None) => {}
        }
    }

    // essential is an OR: once required, always required
    let essential = bool_op(param, sup.get("essential"))? || bool_op(param, sub.get("essential"))?;
    if essential {
        out.insert("essential".into(), json!(true));
    } else if sup.contains_key("essential") || sub.contains_key("essential") {
        out.insert("essential".into(), json!(false));
    }

    check_consistency(param, &out)?;
    Ok(Value::Object(out))
}

/// Cross-operator checks on a merged parameter policy.
fn check_consistency(param: &str, ops: &Map<String, Value>) -> Result<()> {
    if let (Some(value), Some(one_of)) = (ops.get("value"), ops.get("one_of")) {
        let allowed = list(param, "one_of", one_of)?;
        if !allowed.contains(value) {
            return Err(PolicyError::MergeConflict(format!(
                "{param}: value is not in one_of"
            )));
        }
    }
    if let (Some(value), Some(subset)) = (ops.get("value"), ops.get("subset_of")) {
        let allowed = list(param, "subset_of", subset)?;
        let values = list(param, "value", value)?;
        if values.iter().any(|v| !allowed.contains(v)) {
            return Err(PolicyError::MergeConflict(format!(
                "{param}: value is not a subset of subset_of"
            )));
        }
    }
    if let (Some(default), Some(one_of)) = (ops.get("default"), ops.get("one_of")) {
        let allowed = list(param, "one_of", one_of)?;
        if !allowed.contains(default) {
            return Err(PolicyError::MergeConflict(format!(
                "{param}: default is not in one_of"
            )));
        }
    }
    if let (Some(add), Some(subset)) = (ops.get("add"), ops.get("subset_of")) {
        let allowed = list(param, "subset_of", subset)?;
        let added = list(param, "add", add)?;
        if added.iter().any(|v| !allowed.contains(v)) {
            return Err(PolicyError::MergeConflict(format!(
                "{param}: add is not a subset of subset_of"
            )));
        }
    }
    Ok(())
}

fn validate_operators(param: &str, ops: &Value) -> Result<()> {
    for key in as_object(ops, param)?.keys() {
        if !OPERATORS.contains(&key.as_str()) {
            return Err(PolicyError::MergeConflict(format!(
                "{param}: unknown policy operator {key}"
            )));
        }
    }
    Ok(())
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| PolicyError::MergeConflict(format!("{what} must be a JSON object")))
}

fn list(param: &str, op: &str, value: &Value) -> Result<Vec<Value>> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| PolicyError::MergeConflict(format!("{param}: {op} must be an array")))
}

fn bool_op(param: &str, value: Option<&Value>) -> Result<bool> {
    match value {
        None => Ok(false),
        Some(v) => v.as_bool().ok_or_else(|| {
            PolicyError::MergeConflict(format!("{param}: essential must be a boolean"))
        }),
    }
}

fn intersect(a: Vec<Value>, b: Vec<Value>) -> Vec<Value> {
    a.into_iter().filter(|v| b.contains(v)).collect()
}

fn union(a: Vec<Value>, b: Vec<Value>) -> Vec<Value> {
    let mut out = a;
    for v in b {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_sides_pass_through() {
        let sup = json!({"openid_provider": {"subject_types_supported": {"subset_of": ["public"]}}});
        let sub = json!({"openid_relying_party": {"grant_types": {"add": ["refresh_token"]}}});
        let merged = merge_policies(&sup, &sub).unwrap();
        assert_eq!(merged["openid_provider"], sup["openid_provider"]);
        assert_eq!(merged["openid_relying_party"], sub["openid_relying_party"]);
    }

    #[test]
    fn value_disagreement_conflicts() {
        let sup = json!({"openid_provider": {"issuer": {"value": "https://a"}}});
        let sub = json!({"openid_provider": {"issuer": {"value": "https://b"}}});
        let err = merge_policies(&sup, &sub).unwrap_err();
        assert!(matches!(err, PolicyError::MergeConflict(_)));
    }

    #[test]
    fn subset_of_intersects() {
        let sup = json!({"openid_provider": {"scopes": {"subset_of": ["openid", "profile", "email"]}}});
        let sub = json!({"openid_provider": {"scopes": {"subset_of": ["openid", "email", "phone"]}}});
        let merged = merge_policies(&sup, &sub).unwrap();
        assert_eq!(
            merged["openid_provider"]["scopes"]["subset_of"],
            json!(["openid", "email"])
        );
    }

    #[test]
    fn disjoint_one_of_conflicts() {
        let sup = json!({"openid_provider": {"token_alg": {"one_of": ["RS256"]}}});
        let sub = json!({"openid_provider": {"token_alg": {"one_of": ["ES256"]}}});
        assert!(merge_policies(&sup, &sub).is_err());
    }

    #[test]
    fn add_and_superset_union_essential_ors() {
        let sup = json!({"openid_relying_party": {
            "contacts": {"add": ["ops@ta.example"], "essential": false}
        }});
        let sub = json!({"openid_relying_party": {
            "contacts": {"add": ["admin@rp.example"], "essential": true}
        }});
        let merged = merge_policies(&sup, &sub).unwrap();
        let contacts = &merged["openid_relying_party"]["contacts"];
        assert_eq!(contacts["add"], json!(["ops@ta.example", "admin@rp.example"]));
        assert_eq!(contacts["essential"], json!(true));
    }

    #[test]
    fn merged_value_must_satisfy_one_of() {
        let sup = json!({"openid_provider": {"alg": {"value": "PS256"}}});
        let sub = json!({"openid_provider": {"alg": {"one_of": ["RS256", "ES256"]}}});
        assert!(merge_policies(&sup, &sub).is_err());
    }

    #[test]
    fn unknown_operator_rejected() {
        let sup = json!({"openid_provider": {"alg": {"pick_any": ["RS256"]}}});
        let sub = json!({});
        assert!(merge_policies(&sup, &sub).is_err());
    }
}
