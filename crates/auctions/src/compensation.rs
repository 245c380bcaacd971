//! Corrections applied to auction payloads that a consumer rejected.

use bidbus_events::CorrectionError;
use serde_json::Value as JsonValue;

use crate::rules::FORBIDDEN_MODEL;

/// Model written over a rejected [`FORBIDDEN_MODEL`].
pub const CORRECTED_MODEL: &str = "FooBar";

/// Rewrite `model` from the forbidden name to [`CORRECTED_MODEL`].
///
/// Any other model means the rejection had a different cause; the payload is
/// left untouched so the fault ends as a dead letter instead of looping.
pub fn rename_forbidden_model(payload: &mut JsonValue) -> Result<(), CorrectionError> {
    let fields = payload
        .as_object_mut()
        .ok_or_else(|| CorrectionError::Malformed("payload is not an object".to_string()))?;

    match fields.get("model").and_then(JsonValue::as_str) {
        Some(FORBIDDEN_MODEL) => {
            fields.insert("model".to_string(), JsonValue::from(CORRECTED_MODEL));
            Ok(())
        }
        Some(other) => Err(CorrectionError::NotApplicable(format!(
            "model {other:?} is not the forbidden name"
        ))),
        None => Err(CorrectionError::Malformed("missing model".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renames_forbidden_model_only() {
        let mut payload = json!({ "model": "Foo", "make": "Ford" });
        rename_forbidden_model(&mut payload).unwrap();
        assert_eq!(payload, json!({ "model": "FooBar", "make": "Ford" }));
    }

    #[test]
    fn corrected_payload_cannot_be_corrected_again() {
        let mut payload = json!({ "model": "FooBar" });
        assert!(matches!(
            rename_forbidden_model(&mut payload),
            Err(CorrectionError::NotApplicable(_))
        ));
        assert_eq!(payload, json!({ "model": "FooBar" }));
    }

    #[test]
    fn non_object_payload_is_malformed() {
        assert!(matches!(
            rename_forbidden_model(&mut json!([1, 2])),
            Err(CorrectionError::Malformed(_))
        ));
        assert!(matches!(
            rename_forbidden_model(&mut json!({ "make": "Ford" })),
            Err(CorrectionError::Malformed(_))
        ));
    }
}
