use crate::identity::ParseEnumError;
use crate::ids::{BankId, FormId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The kind of input a form field captures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Email,
    Number,
    Textarea,
    Select,
    Checkbox,
    Radio,
    Date,
    File,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Email => "email",
            FieldType::Number => "number",
            FieldType::Textarea => "textarea",
            FieldType::Select => "select",
            FieldType::Checkbox => "checkbox",
            FieldType::Radio => "radio",
            FieldType::Date => "date",
            FieldType::File => "file",
        }
    }

    /// Choice fields must declare at least one option.
    pub fn requires_options(&self) -> bool {
        matches!(self, FieldType::Select | FieldType::Radio)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(FieldType::Text),
            "email" => Ok(FieldType::Email),
            "number" => Ok(FieldType::Number),
            "textarea" => Ok(FieldType::Textarea),
            "select" => Ok(FieldType::Select),
            "checkbox" => Ok(FieldType::Checkbox),
            "radio" => Ok(FieldType::Radio),
            "date" => Ok(FieldType::Date),
            "file" => Ok(FieldType::File),
            other => Err(ParseEnumError::new("field type", other)),
        }
    }
}

/// Optional bounds attached to a field definition.
///
/// For numeric fields `min`/`max` bound the value; for text-like fields they
/// bound the character count.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// One field of a form template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<FieldValidation>,
}

impl FieldDef {
    pub fn new(id: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            field_type,
            required: false,
            options: Vec::new(),
            validation: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_validation(mut self, validation: FieldValidation) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// A reusable schema template that requests are submitted against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    pub id: FormId,
    pub form_name: String,
    pub description: Option<String>,
    pub fields: Vec<FieldDef>,
    pub is_default_form: bool,
    pub bank_id: Option<BankId>,
    pub owner_user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Form {
    pub fn field(&self, field_id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == field_id)
    }
}

/// A submitted value, as sent by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInput {
    pub field_id: String,
    pub value: String,
}

impl FieldInput {
    pub fn new(field_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field_id: field_id.into(),
            value: value.into(),
        }
    }
}

/// A value captured on a request, snapshotted together with the label and
/// type of its field at submission time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValue {
    pub field_id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_def_uses_type_key_on_the_wire() {
        let def = FieldDef::new("type", "Property Type", FieldType::Select)
            .required()
            .with_options(["residential", "commercial"]);
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "select");
        assert_eq!(json["required"], true);

        let back: FieldDef = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn only_choice_fields_require_options() {
        assert!(FieldType::Select.requires_options());
        assert!(FieldType::Radio.requires_options());
        assert!(!FieldType::Checkbox.requires_options());
        assert!(!FieldType::Text.requires_options());
    }
}
