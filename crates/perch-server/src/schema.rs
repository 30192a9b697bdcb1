//! JSON Schema compilation behind the store's validator seam.

use perch_store::BodyValidator;
use serde_json::Value;
use std::path::Path;

/// A schema compiled once at startup and consulted on every document write.
pub struct CompiledSchema {
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    /// Load and compile the schema file given on the command line.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read schema file: {e}"))?;
        let schema: Value =
            serde_json::from_str(&raw).map_err(|e| format!("schema is not valid JSON: {e}"))?;
        Self::from_value(&schema)
    }

    pub fn from_value(schema: &Value) -> Result<Self, String> {
        let validator =
            jsonschema::Validator::new(schema).map_err(|e| format!("invalid schema: {e}"))?;
        Ok(CompiledSchema { validator })
    }
}

impl BodyValidator for CompiledSchema {
    fn validate(&self, body: &Value) -> Result<(), String> {
        if self.validator.is_valid(body) {
            return Ok(());
        }
        let errors: Vec<String> = self.validator.iter_errors(body).map(|e| e.to_string()).collect();
        Err(errors.join("; "))
    }
}
