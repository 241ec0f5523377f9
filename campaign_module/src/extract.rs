//! Variable extraction: turns a raw, semi-structured answer list into the
//! normalized submission record every downstream component consumes. The raw
//! answer list never travels past this boundary.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize::{normalize_email, normalize_phone, NormalizeConfig};

/// One answer record as produced by the quiz renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAnswer {
    pub field_id: String,
    pub value: String,
}

/// Field-type hint supplied by the form definition. Contact fields are
/// resolved by type, never by guessing field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Phone,
    Email,
    Name,
    Text,
    Choice,
}

/// Normalized respondent record. Immutable after creation except for the
/// late-completion upgrade applied by the submission store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub form_id: String,
    /// Flat variable map, keyed by field id, plus the convenience keys
    /// `phone`, `email` and `name` when those resolved.
    pub variables: HashMap<String, String>,
    /// Normalized phone key, if any phone-typed answer was usable.
    pub phone: Option<String>,
    /// Normalized email key, if any email-typed answer was usable.
    pub email: Option<String>,
    pub name: Option<String>,
    pub is_complete: bool,
    pub completion_percent: u8,
    pub submitted_at: DateTime<Utc>,
    pub country: Option<String>,
}

/// Extract a [`Submission`] from a raw answer list.
///
/// `total_fields` is the number of fields the form defines; completion is
/// derived from how many of them received a non-blank answer. Unusable
/// contact values simply leave the convenience keys unset; extraction is
/// total and never fails.
pub fn extract_submission(
    id: Uuid,
    form_id: &str,
    answers: &[RawAnswer],
    field_types: &HashMap<String, FieldType>,
    total_fields: usize,
    submitted_at: DateTime<Utc>,
    country: Option<String>,
    config: &NormalizeConfig,
) -> Submission {
    let mut variables: HashMap<String, String> = HashMap::new();
    let mut phone: Option<String> = None;
    let mut email: Option<String> = None;
    let mut name: Option<String> = None;

    for answer in answers {
        let value = answer.value.trim();
        if value.is_empty() {
            continue;
        }
        variables
            .entry(answer.field_id.clone())
            .or_insert_with(|| value.to_string());

        match field_types.get(&answer.field_id) {
            Some(FieldType::Phone) if phone.is_none() => {
                phone = normalize_phone(value, config);
            }
            Some(FieldType::Email) if email.is_none() => {
                email = normalize_email(value);
            }
            Some(FieldType::Name) if name.is_none() => {
                name = Some(value.to_string());
            }
            _ => {}
        }
    }

    if let Some(value) = phone.as_deref() {
        variables.insert("phone".to_string(), value.to_string());
    }
    if let Some(value) = email.as_deref() {
        variables.insert("email".to_string(), value.to_string());
    }
    if let Some(value) = name.as_deref() {
        variables.insert("name".to_string(), value.to_string());
    }

    // Distinct fields answered, not answer records: a field answered twice
    // (edits, multi-value widgets) still counts once toward completion.
    let answered = answers
        .iter()
        .filter(|answer| !answer.value.trim().is_empty())
        .map(|answer| answer.field_id.as_str())
        .collect::<HashSet<_>>()
        .len();
    let completion_percent = if total_fields == 0 {
        0
    } else {
        ((answered * 100) / total_fields).min(100) as u8
    };
    let is_complete = total_fields > 0 && answered >= total_fields;

    Submission {
        id,
        form_id: form_id.to_string(),
        variables,
        phone,
        email,
        name,
        is_complete,
        completion_percent,
        submitted_at,
        country,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(field_id: &str, value: &str) -> RawAnswer {
        RawAnswer {
            field_id: field_id.to_string(),
            value: value.to_string(),
        }
    }

    fn field_types() -> HashMap<String, FieldType> {
        HashMap::from([
            ("f_phone".to_string(), FieldType::Phone),
            ("f_email".to_string(), FieldType::Email),
            ("f_name".to_string(), FieldType::Name),
            ("f_color".to_string(), FieldType::Choice),
        ])
    }

    #[test]
    fn contact_keys_resolve_by_type_and_are_normalized() {
        let answers = vec![
            answer("f_name", " Ana "),
            answer("f_phone", "(11) 99999-8888"),
            answer("f_email", "ANA@Example.com"),
            answer("f_color", "blue"),
        ];
        let submission = extract_submission(
            Uuid::new_v4(),
            "form-1",
            &answers,
            &field_types(),
            4,
            Utc::now(),
            Some("BR".to_string()),
            &NormalizeConfig::default(),
        );

        assert_eq!(submission.phone.as_deref(), Some("5511999998888"));
        assert_eq!(submission.email.as_deref(), Some("ana@example.com"));
        assert_eq!(submission.name.as_deref(), Some("Ana"));
        assert_eq!(
            submission.variables.get("phone").map(String::as_str),
            Some("5511999998888")
        );
        assert_eq!(
            submission.variables.get("f_color").map(String::as_str),
            Some("blue")
        );
        assert!(submission.is_complete);
        assert_eq!(submission.completion_percent, 100);
    }

    #[test]
    fn unusable_contacts_leave_keys_unset_without_failing() {
        let answers = vec![answer("f_phone", "123"), answer("f_email", "nope")];
        let submission = extract_submission(
            Uuid::new_v4(),
            "form-1",
            &answers,
            &field_types(),
            4,
            Utc::now(),
            None,
            &NormalizeConfig::default(),
        );

        assert_eq!(submission.phone, None);
        assert_eq!(submission.email, None);
        assert!(!submission.variables.contains_key("phone"));
        // Raw values still land in the variable map under their field ids.
        assert_eq!(
            submission.variables.get("f_phone").map(String::as_str),
            Some("123")
        );
    }

    #[test]
    fn partial_answers_yield_partial_completion() {
        let answers = vec![answer("f_name", "Ana"), answer("f_color", "")];
        let submission = extract_submission(
            Uuid::new_v4(),
            "form-1",
            &answers,
            &field_types(),
            4,
            Utc::now(),
            None,
            &NormalizeConfig::default(),
        );

        assert!(!submission.is_complete);
        assert_eq!(submission.completion_percent, 25);
    }

    #[test]
    fn repeated_answers_to_one_field_count_once_toward_completion() {
        let answers = vec![
            answer("f_name", "Ana"),
            answer("f_name", "Ana Maria"),
            answer("f_color", "blue"),
            answer("f_color", "red"),
        ];
        let submission = extract_submission(
            Uuid::new_v4(),
            "form-1",
            &answers,
            &field_types(),
            4,
            Utc::now(),
            None,
            &NormalizeConfig::default(),
        );

        // Two distinct fields answered out of four.
        assert!(!submission.is_complete);
        assert_eq!(submission.completion_percent, 50);
    }

    #[test]
    fn zero_field_forms_never_complete() {
        let submission = extract_submission(
            Uuid::new_v4(),
            "form-1",
            &[],
            &HashMap::new(),
            0,
            Utc::now(),
            None,
            &NormalizeConfig::default(),
        );
        assert!(!submission.is_complete);
        assert_eq!(submission.completion_percent, 0);
    }
}
