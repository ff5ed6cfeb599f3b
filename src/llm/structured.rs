//! Schema-constrained generation.
//!
//! The target type's schema comes from `schemars`, rides along with the
//! request, and the reply is validated with `jsonschema` before serde sees it.
//! Any mismatch is an error; there are no fallback values here.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{GenerateRequest, LanguageService, LlmError};

/// JSON Schema of `T` as a plain JSON value.
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

/// Generate and decode a `T`.
pub async fn generate_json<T>(
    service: &dyn LanguageService,
    request: GenerateRequest,
) -> Result<T, LlmError>
where
    T: DeserializeOwned + JsonSchema,
{
    let schema = schema_of::<T>();
    let raw = service.generate(request.with_schema(schema.clone())).await?;
    parse_structured(&raw, &schema)
}

/// Decode `raw` into `T` after validating it against `schema`.
pub fn parse_structured<T: DeserializeOwned>(raw: &str, schema: &Value) -> Result<T, LlmError> {
    let body = strip_code_fences(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| LlmError::Parse(format!("{e}: {}", truncate(body, 120))))?;

    let validator = jsonschema::validator_for(schema)
        .map_err(|e| LlmError::Schema(format!("schema does not compile: {e}")))?;
    let errors: Vec<String> = validator.iter_errors(&value).map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        return Err(LlmError::Schema(errors.join("; ")));
    }

    serde_json::from_value(value).map_err(|e| LlmError::Parse(e.to_string()))
}

/// Strip a surrounding markdown code fence (with optional language tag).
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
