//! The schema validation gate.
//!
//! Schemas are validated at four points: path params, query, body
//! (pre-handler), and the handler's return value (post-handler). The
//! validation engine itself stays behind the [`SchemaValidator`] seam —
//! parse a value, get it back or get a list of field issues — and
//! [`GardeSchema`] is the concrete adapter over the `garde` crate.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ErrorKind, PortwayError};

/// One field-level validation issue.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub messages: Vec<String>,
    #[serde(rename = "rejectedValue", skip_serializing_if = "Option::is_none")]
    pub rejected_value: Option<serde_json::Value>,
    #[serde(rename = "expectedType", skip_serializing_if = "Option::is_none")]
    pub expected_type: Option<String>,
}

/// The structured details payload attached to a `VALIDATION_ERROR` /
/// `UNPROCESSABLE_ENTITY` response.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetails {
    pub fields: Vec<FieldError>,
    #[serde(rename = "errorCount")]
    pub error_count: usize,
    pub section: String,
    #[serde(rename = "schemaName", skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
}

impl ValidationDetails {
    fn new(section: &str, schema_name: Option<&str>, fields: Vec<FieldError>) -> Self {
        ValidationDetails {
            error_count: fields.len(),
            fields,
            section: section.to_string(),
            schema_name: schema_name.map(str::to_string),
        }
    }
}

/// The external validation engine's contract: given a JSON value, produce
/// either a validated value (discarded here — callers re-decode the typed
/// struct themselves if they need it) or a list of field-level issues.
pub trait SchemaValidator: Send + Sync {
    /// A human-readable name surfaced in `ValidationDetails::schema_name`.
    fn name(&self) -> &str;

    fn validate_json(&self, value: &serde_json::Value) -> Result<(), Vec<FieldError>>;
}

/// Adapts a `garde::Validate` + `serde::Deserialize` type into a
/// [`SchemaValidator`].
pub struct GardeSchema<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GardeSchema<T> {
    pub fn new(name: &'static str) -> Self {
        GardeSchema { name, _marker: PhantomData }
    }
}

impl<T> Default for GardeSchema<T> {
    fn default() -> Self {
        GardeSchema::new(std::any::type_name::<T>())
    }
}

impl<T> SchemaValidator for GardeSchema<T>
where
    T: DeserializeOwned + garde::Validate + Send + Sync,
    T::Context: Default,
{
    fn name(&self) -> &str {
        self.name
    }

    fn validate_json(&self, value: &serde_json::Value) -> Result<(), Vec<FieldError>> {
        let parsed: T = serde_json::from_value(value.clone()).map_err(|err| {
            vec![FieldError {
                field: "value".to_string(),
                messages: vec![err.to_string()],
                rejected_value: Some(value.clone()),
                expected_type: Some(std::any::type_name::<T>().to_string()),
            }]
        })?;

        parsed
            .validate()
            .map_err(|report| convert_garde_report(&report, value))
    }
}

fn convert_garde_report(report: &garde::Report, rejected: &serde_json::Value) -> Vec<FieldError> {
    use std::collections::BTreeMap;

    let mut by_field: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (path, error) in report.iter() {
        let field = {
            let s = path.to_string();
            if s.is_empty() { "value".to_string() } else { s }
        };
        by_field.entry(field).or_default().push(error.to_string());
    }

    by_field
        .into_iter()
        .map(|(field, messages)| {
            let rejected_value = rejected.get(&field).cloned();
            FieldError {
                field,
                messages,
                rejected_value,
                expected_type: None,
            }
        })
        .collect()
}

/// Constraints a route schema may place on one multipart file field:
/// size bounds and an accept list of exact MIME types or wildcards
/// (`image/*`). Mismatches become field-level validation issues.
#[derive(Debug, Clone, Default)]
pub struct FileSchema {
    pub max_size: Option<usize>,
    pub min_size: Option<usize>,
    pub accept: Vec<String>,
}

impl FileSchema {
    pub fn check(&self, file: &crate::body::UploadedFile) -> Vec<FieldError> {
        let mut messages = Vec::new();
        if let Some(max) = self.max_size {
            if file.len() > max {
                messages.push(format!("file exceeds the {max}-byte limit"));
            }
        }
        if let Some(min) = self.min_size {
            if file.len() < min {
                messages.push(format!("file is smaller than the {min}-byte minimum"));
            }
        }
        if !self.accept.is_empty() {
            let mime = file.content_type.as_deref().unwrap_or("application/octet-stream");
            if !self.accept.iter().any(|pattern| mime_matches(pattern, mime)) {
                messages.push(format!("content type '{mime}' is not accepted"));
            }
        }

        if messages.is_empty() {
            return Vec::new();
        }
        vec![FieldError {
            field: file.field_name.clone(),
            messages,
            rejected_value: file.file_name.clone().map(serde_json::Value::String),
            expected_type: Some("file".to_string()),
        }]
    }
}

fn mime_matches(pattern: &str, mime: &str) -> bool {
    if pattern == "*" || pattern == "*/*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return mime
            .split('/')
            .next()
            .is_some_and(|main| main.eq_ignore_ascii_case(prefix));
    }
    pattern.eq_ignore_ascii_case(mime)
}

/// Check every uploaded file against the route's per-field file schemas.
/// Fields without a schema pass untouched.
pub fn validate_files(
    schemas: &std::collections::HashMap<String, FileSchema>,
    body: &crate::body::MultipartBody,
) -> Result<(), PortwayError> {
    let mut fields = Vec::new();
    for (name, schema) in schemas {
        for file in body.files.get(name).map(Vec::as_slice).unwrap_or_default() {
            fields.extend(schema.check(file));
        }
    }
    if fields.is_empty() {
        return Ok(());
    }
    let details = ValidationDetails::new("body", None, fields);
    Err(PortwayError::new(ErrorKind::ValidationError, "file validation failed")
        .with_details(serde_json::to_value(details).unwrap_or(serde_json::Value::Null)))
}

/// Run a schema (if present) against `value` for pipeline step `section`
/// (one of `params`, `query`, `body`). On failure, produces a
/// `VALIDATION_ERROR` carrying the structured details payload the error
/// envelope expects.
pub fn validate_section(
    schema: Option<&dyn SchemaValidator>,
    section: &str,
    value: &serde_json::Value,
) -> Result<(), PortwayError> {
    let Some(schema) = schema else { return Ok(()) };
    match schema.validate_json(value) {
        Ok(()) => Ok(()),
        Err(fields) => {
            let details = ValidationDetails::new(section, Some(schema.name()), fields);
            Err(PortwayError::new(ErrorKind::ValidationError, "validation failed")
                .with_details(serde_json::to_value(details).unwrap_or(serde_json::Value::Null)))
        }
    }
}

/// Validate a handler's return value against the route's response schema.
/// A response schema failure is never sent to the client — it is always
/// demoted to `INTERNAL_SERVER_ERROR`, with the real failure logged.
pub fn validate_response(
    schema: Option<&dyn SchemaValidator>,
    value: &serde_json::Value,
) -> Result<(), PortwayError> {
    let Some(schema) = schema else { return Ok(()) };
    match schema.validate_json(value) {
        Ok(()) => Ok(()),
        Err(fields) => {
            tracing::error!(schema = schema.name(), ?fields, "response schema validation failed");
            Err(PortwayError::internal(
                "response failed schema validation",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garde::Validate;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Validate)]
    struct SignupBody {
        #[garde(email)]
        email: String,
        #[garde(length(min = 8))]
        password: String,
    }

    #[test]
    fn valid_body_passes() {
        let schema = GardeSchema::<SignupBody>::new("SignupBody");
        let value = serde_json::json!({"email": "a@example.com", "password": "longenough"});
        assert!(validate_section(Some(&schema), "body", &value).is_ok());
    }

    #[test]
    fn invalid_email_produces_field_error() {
        let schema = GardeSchema::<SignupBody>::new("SignupBody");
        let value = serde_json::json!({"email": 123, "password": "longenough"});
        let err = validate_section(Some(&schema), "body", &value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn short_password_is_a_validation_issue() {
        let schema = GardeSchema::<SignupBody>::new("SignupBody");
        let value = serde_json::json!({"email": "a@example.com", "password": "short"});
        let err = validate_section(Some(&schema), "body", &value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn absent_schema_always_passes() {
        assert!(validate_section(None, "query", &serde_json::json!({})).is_ok());
    }

    #[test]
    fn response_validation_failure_is_demoted_to_internal() {
        let schema = GardeSchema::<SignupBody>::new("SignupBody");
        let value = serde_json::json!({"email": 123, "password": "short"});
        let err = validate_response(Some(&schema), &value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalServerError);
    }

    fn png_upload(size: usize) -> crate::body::UploadedFile {
        crate::body::UploadedFile::in_memory(
            "avatar",
            Some("a.png".to_string()),
            Some("image/png".to_string()),
            bytes::Bytes::from(vec![0u8; size]),
        )
    }

    #[test]
    fn file_schema_accepts_matching_mime_and_size() {
        let schema = FileSchema {
            max_size: Some(1024),
            min_size: Some(1),
            accept: vec!["image/*".to_string()],
        };
        assert!(schema.check(&png_upload(512)).is_empty());
    }

    #[test]
    fn file_schema_rejects_oversize_and_wrong_type() {
        let schema = FileSchema {
            max_size: Some(16),
            min_size: None,
            accept: vec!["application/pdf".to_string()],
        };
        let issues = schema.check(&png_upload(64));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "avatar");
        assert_eq!(issues[0].messages.len(), 2);
    }

    #[test]
    fn wildcard_mime_patterns_match_by_main_type() {
        assert!(mime_matches("image/*", "image/png"));
        assert!(mime_matches("*/*", "application/json"));
        assert!(!mime_matches("image/*", "video/mp4"));
        assert!(mime_matches("IMAGE/PNG", "image/png"));
    }

    #[test]
    fn validate_files_collects_issues_across_fields() {
        let mut schemas = std::collections::HashMap::new();
        schemas.insert(
            "avatar".to_string(),
            FileSchema { max_size: Some(8), min_size: None, accept: Vec::new() },
        );
        let mut files = std::collections::HashMap::new();
        files.insert("avatar".to_string(), vec![png_upload(64)]);
        let body = crate::body::MultipartBody {
            fields: crate::body::MultipartFields::default(),
            files,
        };
        let err = validate_files(&schemas, &body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
}
