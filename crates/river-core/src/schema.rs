// Schema as an injected capability: a validator plus a JSON-schema-shaped
// description. The core never binds to a specific schema runtime.

use std::sync::Arc;

use serde_json::Value;

type ValidateFn = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// A payload contract: validates values and describes itself as a
/// JSON-schema-shaped document (consumed by registry serialization and the
/// offline compatibility checker).
#[derive(Clone)]
pub struct Schema {
    name: String,
    doc: Value,
    validate: Arc<ValidateFn>,
}

impl Schema {
    pub fn new(
        name: &str,
        doc: Value,
        validate: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Schema {
            name: name.to_owned(),
            doc,
            validate: Arc::new(validate),
        }
    }

    /// A schema that accepts anything. Its description is the empty schema.
    #[must_use]
    pub fn any(name: &str) -> Self {
        Schema::new(name, serde_json::json!({}), |_| Ok(()))
    }

    /// An object schema requiring the named fields to be present, without
    /// constraining their types. Enough for wire-level validation when the
    /// application brings no schema runtime of its own.
    #[must_use]
    pub fn object_with_required(name: &str, required: &[&str]) -> Self {
        let fields: Vec<String> = required.iter().map(|s| (*s).to_owned()).collect();
        let doc = serde_json::json!({
            "type": "object",
            "required": fields.clone(),
        });
        Schema::new(name, doc, move |value| {
            let obj = value
                .as_object()
                .ok_or_else(|| format!("expected object, got {value}"))?;
            for field in &fields {
                if !obj.contains_key(field) {
                    return Err(format!("missing required field `{field}`"));
                }
            }
            Ok(())
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn validate(&self, value: &Value) -> Result<(), String> {
        (self.validate)(value)
    }

    /// The JSON-schema-shaped description used by `ServiceRegistry::serialize`.
    #[must_use]
    pub fn describe(&self) -> Value {
        self.doc.clone()
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema").field("name", &self.name).finish()
    }
}
