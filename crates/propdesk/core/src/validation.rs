//! Field schema checks: definitions at form time, submitted values at request time.

use crate::error::{PropdeskError, PropdeskResult};
use chrono::NaiveDate;
use propdesk_types::{FieldDef, FieldInput, FieldType, FieldValue, Form};
use regex::Regex;
use std::collections::HashSet;

/// Check a form definition: non-empty name, unique non-empty field ids,
/// options on choice fields, compilable patterns and ordered bounds.
pub fn validate_form_definition(form_name: &str, fields: &[FieldDef]) -> PropdeskResult<()> {
    if form_name.trim().is_empty() {
        return Err(PropdeskError::validation("formName", "must not be empty"));
    }

    let mut seen = HashSet::new();
    for field in fields {
        if field.id.trim().is_empty() {
            return Err(PropdeskError::validation("fields", "field id must not be empty"));
        }
        if !seen.insert(field.id.as_str()) {
            return Err(PropdeskError::validation(
                field.id.clone(),
                "duplicate field id",
            ));
        }
        if field.label.trim().is_empty() {
            return Err(PropdeskError::validation(field.id.clone(), "label must not be empty"));
        }
        if field.field_type.requires_options() && field.options.is_empty() {
            return Err(PropdeskError::validation(
                field.id.clone(),
                format!("{} fields need at least one option", field.field_type),
            ));
        }
        if let Some(rules) = &field.validation {
            if let (Some(min), Some(max)) = (rules.min, rules.max) {
                if min > max {
                    return Err(PropdeskError::validation(
                        field.id.clone(),
                        format!("min {min} exceeds max {max}"),
                    ));
                }
            }
            if let Some(pattern) = &rules.pattern {
                Regex::new(pattern).map_err(|e| {
                    PropdeskError::validation(field.id.clone(), format!("invalid pattern: {e}"))
                })?;
            }
        }
    }
    Ok(())
}

/// Validate submitted values against `form` and snapshot them in form order.
///
/// The snapshot copies each field's label and type so later edits to the
/// form never change what a request recorded.
pub fn snapshot_fields(form: &Form, inputs: &[FieldInput]) -> PropdeskResult<Vec<FieldValue>> {
    let mut submitted = std::collections::HashMap::new();
    for input in inputs {
        if form.field(&input.field_id).is_none() {
            return Err(PropdeskError::validation(
                input.field_id.clone(),
                "not a field of this form",
            ));
        }
        if submitted
            .insert(input.field_id.as_str(), input.value.as_str())
            .is_some()
        {
            return Err(PropdeskError::validation(
                input.field_id.clone(),
                "submitted more than once",
            ));
        }
    }

    let mut values = Vec::with_capacity(form.fields.len());
    for def in &form.fields {
        let value = submitted.get(def.id.as_str()).copied().unwrap_or("");
        validate_value(def, value)?;
        if submitted.contains_key(def.id.as_str()) {
            values.push(FieldValue {
                field_id: def.id.clone(),
                label: def.label.clone(),
                field_type: def.field_type,
                value: value.to_string(),
            });
        }
    }
    Ok(values)
}

fn validate_value(def: &FieldDef, value: &str) -> PropdeskResult<()> {
    let fail = |reason: String| Err(PropdeskError::validation(def.id.clone(), reason));
    let trimmed = value.trim();

    if trimmed.is_empty() {
        if def.required {
            return fail("is required".to_string());
        }
        return Ok(());
    }

    let rules = def.validation.clone().unwrap_or_default();
    match def.field_type {
        FieldType::Select | FieldType::Radio => {
            if !def.options.iter().any(|o| o == value) {
                return fail(format!("`{value}` is not one of the declared options"));
            }
        }
        FieldType::Number => {
            let number = match trimmed.parse::<f64>() {
                Ok(n) if n.is_finite() => n,
                _ => return fail(format!("`{value}` is not a number")),
            };
            if let Some(min) = rules.min {
                if number < min {
                    return fail(format!("must be at least {min}"));
                }
            }
            if let Some(max) = rules.max {
                if number > max {
                    return fail(format!("must be at most {max}"));
                }
            }
        }
        FieldType::Text | FieldType::Textarea | FieldType::Email => {
            if def.field_type == FieldType::Email && !looks_like_email(trimmed) {
                return fail(format!("`{value}` is not an email address"));
            }
            let length = value.chars().count() as f64;
            if let Some(min) = rules.min {
                if length < min {
                    return fail(format!("must be at least {min} characters"));
                }
            }
            if let Some(max) = rules.max {
                if length > max {
                    return fail(format!("must be at most {max} characters"));
                }
            }
            if let Some(pattern) = &rules.pattern {
                let re = Regex::new(pattern)
                    .map_err(|e| PropdeskError::validation(def.id.clone(), format!("invalid pattern: {e}")))?;
                if !re.is_match(value) {
                    return fail("does not match the required pattern".to_string());
                }
            }
        }
        FieldType::Checkbox => {
            if trimmed != "true" && trimmed != "false" {
                return fail("must be `true` or `false`".to_string());
            }
            if def.required && trimmed != "true" {
                return fail("must be checked".to_string());
            }
        }
        FieldType::Date => {
            if NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_err() {
                return fail(format!("`{value}` is not a YYYY-MM-DD date"));
            }
        }
        FieldType::File => {}
    }
    Ok(())
}

pub(crate) fn looks_like_email(value: &str) -> bool {
    let mut parts = value.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty() && !domain.is_empty() && !value.contains(char::is_whitespace)
        }
        _ => false,
    }
}
