//! Structural drift detection
//!
//! The checksum annotation catches changes to the desired definition; this
//! diff catches out-of-band edits to the live object. Only fields present
//! on the desired side are compared - the live side always carries
//! server-populated fields (status, managed fields, defaulted values) that
//! must not count as drift.

use serde_json::Value;

/// Whether the live object has drifted from the desired definition.
///
/// Mappings recurse; a key present in `desired` but missing from `live` is
/// drift, extra live keys are not. Arrays and scalars compare exactly.
pub fn drifted(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(desired), Value::Object(live)) => {
            desired.iter().any(|(key, desired_value)| match live.get(key) {
                Some(live_value) => drifted(desired_value, live_value),
                None => true,
            })
        }
        (desired, live) => desired != live,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn desired() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "app"},
            "spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "web", "image": "nginx:1"}]}}},
        })
    }

    /// Story: an out-of-band replica bump is detected as drift
    ///
    /// Someone scales the Deployment to 3 with kubectl; the desired build
    /// still says 2, so the next reconcile patches it back.
    #[test]
    fn story_out_of_band_edit_is_drift() {
        let mut live = desired();
        live["spec"]["replicas"] = json!(3);
        assert!(drifted(&desired(), &live));
    }

    /// Story: server-populated fields are not drift
    ///
    /// The live object always has status, uid, creation timestamps and
    /// defaulted spec fields the build never mentions.
    #[test]
    fn story_live_only_fields_ignored() {
        let mut live = desired();
        live["status"] = json!({"readyReplicas": 2});
        live["metadata"]["uid"] = json!("abc-123");
        live["spec"]["progressDeadlineSeconds"] = json!(600);
        assert!(!drifted(&desired(), &live));
    }

    #[test]
    fn test_missing_desired_field_is_drift() {
        let mut live = desired();
        live["spec"].as_object_mut().unwrap().remove("replicas");
        assert!(drifted(&desired(), &live));
    }

    #[test]
    fn test_array_changes_are_drift() {
        let mut live = desired();
        live["spec"]["template"]["spec"]["containers"][0]["image"] = json!("nginx:2");
        assert!(drifted(&desired(), &live));
    }

    #[test]
    fn test_identical_objects_are_not_drift() {
        assert!(!drifted(&desired(), &desired()));
    }

    #[test]
    fn test_scalar_type_mismatch_is_drift() {
        assert!(drifted(&json!({"a": "2"}), &json!({"a": 2})));
    }
}
