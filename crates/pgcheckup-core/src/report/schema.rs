//! JSON Schema validation of reports and per-query documents.
//!
//! A check schema is the shared envelope (`schemas/envelope.json`) with the
//! check's data schema (`schemas/checks/<ID>.json`) plugged in at
//! `$defs/data` and `checkId` pinned to the check. Compiled validators are
//! cached for the lifetime of the process.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex};

use jsonschema::Validator;
use serde::Serialize;
use serde_json::Value;

use super::{CheckId, Report, ReportError};

const ENVELOPE: &str = include_str!("../../schemas/envelope.json");
const PER_QUERY: &str = include_str!("../../schemas/per_query.json");

/// At most this many violations are quoted in an error.
const MAX_REPORTED_ERRORS: usize = 5;

fn data_schema(check: CheckId) -> &'static str {
    match check {
        CheckId::A002 => include_str!("../../schemas/checks/A002.json"),
        CheckId::A003 => include_str!("../../schemas/checks/A003.json"),
        CheckId::A004 => include_str!("../../schemas/checks/A004.json"),
        CheckId::A007 => include_str!("../../schemas/checks/A007.json"),
        CheckId::D004 => include_str!("../../schemas/checks/D004.json"),
        CheckId::F001 => include_str!("../../schemas/checks/F001.json"),
        CheckId::F004 => include_str!("../../schemas/checks/F004.json"),
        CheckId::F005 => include_str!("../../schemas/checks/F005.json"),
        CheckId::G001 => include_str!("../../schemas/checks/G001.json"),
        CheckId::H001 => include_str!("../../schemas/checks/H001.json"),
        CheckId::H002 => include_str!("../../schemas/checks/H002.json"),
        CheckId::H004 => include_str!("../../schemas/checks/H004.json"),
        CheckId::K001 => include_str!("../../schemas/checks/K001.json"),
        CheckId::K003 => include_str!("../../schemas/checks/K003.json"),
        CheckId::M001 => include_str!("../../schemas/checks/M001.json"),
        CheckId::M002 => include_str!("../../schemas/checks/M002.json"),
        CheckId::M003 => include_str!("../../schemas/checks/M003.json"),
        CheckId::M004 => include_str!("../../schemas/checks/M004.json"),
        CheckId::N001 => include_str!("../../schemas/checks/N001.json"),
    }
}

/// Artifact kinds with a registered schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaKind {
    Check(CheckId),
    PerQuery,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::Check(check) => write!(f, "{check}"),
            SchemaKind::PerQuery => f.write_str("per-query"),
        }
    }
}

static VALIDATORS: LazyLock<Mutex<BTreeMap<SchemaKind, Arc<Validator>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

fn parse(kind: SchemaKind, raw: &str) -> Result<Value, ReportError> {
    serde_json::from_str(raw).map_err(|e| ReportError::SchemaCompile {
        kind: kind.to_string(),
        detail: e.to_string(),
    })
}

/// The full schema document for `kind`.
pub fn schema_document(kind: SchemaKind) -> Result<Value, ReportError> {
    match kind {
        SchemaKind::PerQuery => parse(kind, PER_QUERY),
        SchemaKind::Check(check) => {
            let mut envelope = parse(kind, ENVELOPE)?;
            let data = parse(kind, data_schema(check))?;
            let compile_err = |detail: &str| ReportError::SchemaCompile {
                kind: kind.to_string(),
                detail: detail.to_string(),
            };
            *envelope
                .pointer_mut("/$defs/data")
                .ok_or_else(|| compile_err("envelope has no $defs/data slot"))? = data;
            let check_id = envelope
                .pointer_mut("/properties/checkId")
                .and_then(Value::as_object_mut)
                .ok_or_else(|| compile_err("envelope has no checkId property"))?;
            check_id.insert("const".to_string(), Value::String(check.as_str().to_string()));
            Ok(envelope)
        }
    }
}

fn validator(kind: SchemaKind) -> Result<Arc<Validator>, ReportError> {
    let mut validators = VALIDATORS.lock().unwrap_or_else(|e| e.into_inner());
    Ok(match validators.entry(kind) {
        Entry::Occupied(entry) => Arc::clone(entry.get()),
        Entry::Vacant(entry) => {
            let document = schema_document(kind)?;
            let compiled =
                jsonschema::validator_for(&document).map_err(|e| ReportError::SchemaCompile {
                    kind: kind.to_string(),
                    detail: e.to_string(),
                })?;
            Arc::clone(entry.insert(Arc::new(compiled)))
        }
    })
}

/// Validates an already serialized document.
pub fn validate_value(kind: SchemaKind, instance: &Value) -> Result<(), ReportError> {
    let validator = validator(kind)?;
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .take(MAX_REPORTED_ERRORS)
        .map(|e| format!("{} at '{}'", e, e.instance_path))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ReportError::Schema {
            kind: kind.to_string(),
            errors: errors.join("; "),
        })
    }
}

/// Serializes `document` and validates it against the schema of `kind`.
pub fn validate_serializable<T: Serialize>(
    kind: SchemaKind,
    document: &T,
) -> Result<(), ReportError> {
    let value = serde_json::to_value(document).map_err(|source| ReportError::Json {
        what: kind.to_string(),
        source,
    })?;
    validate_value(kind, &value)
}

/// Validates a report against the schema registered for its check.
pub fn validate_report(report: &Report) -> Result<(), ReportError> {
    validate_serializable(SchemaKind::Check(report.check_id), report)
}
