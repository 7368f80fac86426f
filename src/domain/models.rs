use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::validate;
use crate::errors::FieldError;
use crate::sync::Entity;

/// Individual (PF, CPF document) or company (PJ, CNPJ document).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersonKind {
    Pf,
    Pj,
}

impl PersonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pf => "pf",
            Self::Pj => "pj",
        }
    }
}

impl FromStr for PersonKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pf" => Ok(Self::Pf),
            "pj" => Ok(Self::Pj),
            _ => Err(format!("Invalid person kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Applicant {
    pub id: String,
    pub kind: PersonKind,
    /// Full name (PF) or legal name (PJ).
    pub name: String,
    /// CPF or CNPJ, digits only or formatted.
    pub document: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Trade name, PJ only.
    pub trade_name: Option<String>,
    pub birth_date: Option<String>,
    pub address: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Applicant {
    pub fn new(kind: PersonKind, name: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind,
            name: name.into(),
            document: document.into(),
            email: None,
            phone: None,
            trade_name: None,
            birth_date: None,
            address: None,
            updated_by: None,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Applicant {
    const TABLE: &'static str = "applicants";
    const ATTRIBUTION_FIELD: Option<&'static str> = Some("updated_by");

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        validate::required(&mut errors, "name", &self.name);
        match self.kind {
            PersonKind::Pf if !validate::is_valid_cpf(&self.document) => {
                errors.push(FieldError::new("document", "invalid CPF"))
            }
            PersonKind::Pj if !validate::is_valid_cnpj(&self.document) => {
                errors.push(FieldError::new("document", "invalid CNPJ"))
            }
            _ => {}
        }
        if let Some(email) = self.email.as_deref().filter(|e| !e.is_empty())
            && !validate::is_valid_email(email)
        {
            errors.push(FieldError::new("email", "invalid e-mail address"));
        }
        if let Some(phone) = self.phone.as_deref().filter(|p| !p.is_empty())
            && !validate::is_valid_phone(phone)
        {
            errors.push(FieldError::new("phone", "invalid phone number"));
        }
        errors
    }
}

/// Board columns, in workflow order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CardColumn {
    Intake,
    Documents,
    Analysis,
    Approved,
    Rejected,
}

impl CardColumn {
    pub const ALL: [CardColumn; 5] = [
        Self::Intake,
        Self::Documents,
        Self::Analysis,
        Self::Approved,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Documents => "documents",
            Self::Analysis => "analysis",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for CardColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(Self::Intake),
            "documents" => Ok(Self::Documents),
            "analysis" => Ok(Self::Analysis),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid column: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Card {
    pub id: String,
    pub title: String,
    pub applicant_id: Option<String>,
    pub column: CardColumn,
    /// Sort key within the column; gaps leave room for moves.
    pub position: i64,
    pub assignee_id: Option<String>,
    /// Scheduled appointment (RFC 3339).
    pub scheduled_at: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Card {
    pub fn new(title: impl Into<String>, column: CardColumn, position: i64) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            applicant_id: None,
            column,
            position,
            assignee_id: None,
            scheduled_at: None,
            updated_by: None,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Card {
    const TABLE: &'static str = "cards";
    const ATTRIBUTION_FIELD: Option<&'static str> = Some("updated_by");

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        validate::required(&mut errors, "title", &self.title);
        if let Some(at) = self.scheduled_at.as_deref()
            && chrono::DateTime::parse_from_rfc3339(at).is_err()
        {
            errors.push(FieldError::new("scheduled_at", "invalid date and time"));
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub card_id: String,
    pub file_name: String,
    /// Blob store path, `cards/<card_id>/<uuid>-<file_name>`.
    pub storage_path: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub uploaded_by: Option<String>,
    pub created_at: Option<String>,
}

impl Entity for Attachment {
    const TABLE: &'static str = "attachments";
    const ATTRIBUTION_FIELD: Option<&'static str> = Some("uploaded_by");

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub card_id: String,
    pub title: String,
    pub done: bool,
    pub due_date: Option<String>,
    pub assignee_id: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Task {
    pub fn new(card_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            card_id: card_id.into(),
            title: title.into(),
            done: false,
            due_date: None,
            assignee_id: None,
            updated_by: None,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Task {
    const TABLE: &'static str = "card_tasks";
    const ATTRIBUTION_FIELD: Option<&'static str> = Some("updated_by");

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        validate::required(&mut errors, "title", &self.title);
        if let Some(due) = self.due_date.as_deref()
            && chrono::NaiveDate::parse_from_str(due, "%Y-%m-%d").is_err()
        {
            errors.push(FieldError::new("due_date", "expected YYYY-MM-DD"));
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: String,
    pub card_id: String,
    pub body: String,
    pub author_id: Option<String>,
    pub created_at: Option<String>,
}

impl Entity for Comment {
    const TABLE: &'static str = "card_comments";
    const ATTRIBUTION_FIELD: Option<&'static str> = Some("author_id");

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        validate::required(&mut errors, "body", &self.body);
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    /// Event type, e.g. `card_moved`, `comment_added`.
    pub kind: String,
    pub title: String,
    pub body: Option<String>,
    pub card_id: Option<String>,
    pub read_at: Option<String>,
    pub created_at: Option<String>,
}

impl Notification {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }
}

impl Entity for Notification {
    const TABLE: &'static str = "notifications";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A stored form draft, as written by [`DraftAutosave`](crate::sync::autosave::DraftAutosave).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Draft {
    pub id: String,
    pub draft_key: String,
    pub owner_id: Option<String>,
    pub payload: Value,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Entity for Draft {
    const TABLE: &'static str = crate::sync::autosave::DRAFTS_TABLE;

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_round_trips_through_str() {
        for column in CardColumn::ALL {
            assert_eq!(column.as_str().parse::<CardColumn>(), Ok(column));
        }
        assert!("archive".parse::<CardColumn>().is_err());
    }

    #[test]
    fn test_column_serializes_snake_case() {
        let card = Card::new("Loan", CardColumn::Documents, 1024);
        let value = serde_json::to_value(&card).unwrap();
        assert_eq!(value["column"], json!("documents"));
    }

    #[test]
    fn test_applicant_pf_requires_valid_cpf() {
        let mut applicant = Applicant::new(PersonKind::Pf, "Ana Souza", "529.982.247-25");
        assert!(applicant.validate().is_empty());

        applicant.document = "529.982.247-24".into();
        let errors = applicant.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "document");
    }

    #[test]
    fn test_applicant_pj_requires_valid_cnpj() {
        let applicant = Applicant::new(PersonKind::Pj, "Acme Ltda", "11.222.333/0001-81");
        assert!(applicant.validate().is_empty());

        let applicant = Applicant::new(PersonKind::Pj, "Acme Ltda", "529.982.247-25");
        assert_eq!(applicant.validate()[0].message, "invalid CNPJ");
    }

    #[test]
    fn test_applicant_optional_fields_are_checked_when_present() {
        let mut applicant = Applicant::new(PersonKind::Pf, "", "529.982.247-25");
        applicant.email = Some("not-an-email".into());
        applicant.phone = Some("123".into());
        let fields: Vec<String> = applicant.validate().into_iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["name", "email", "phone"]);
    }

    #[test]
    fn test_task_due_date_format() {
        let mut task = Task::new("c1", "Collect payslips");
        task.due_date = Some("2026-10-31".into());
        assert!(task.validate().is_empty());
        task.due_date = Some("31/10/2026".into());
        assert_eq!(task.validate()[0].field, "due_date");
    }

    #[test]
    fn test_draft_reads_autosave_row() {
        let row = json!({
            "id": "row-1",
            "draft_key": "applicant-form:u1",
            "owner_id": null,
            "payload": {"name": "Ana"},
            "updated_at": "T1"
        });
        let draft: Draft = serde_json::from_value(row).unwrap();
        assert_eq!(draft.payload["name"], json!("Ana"));
        assert!(draft.created_at.is_none());
    }
}
