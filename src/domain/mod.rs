//! Kanban domain: intake applicants, cards, and what hangs off a card.

pub mod board;
pub mod inbox;
pub mod models;
pub mod validate;

pub use board::Board;
pub use inbox::Inbox;
pub use models::{
    Applicant, Attachment, Card, CardColumn, Comment, Draft, Notification, PersonKind, Task,
};

/// Every table the domain reads or writes, in provisioning order.
pub const TABLES: [&str; 7] = [
    "applicants",
    "cards",
    "attachments",
    "card_tasks",
    "card_comments",
    "notifications",
    "drafts",
];

/// Tables whose absence hides a feature instead of failing the page.
pub const OPTIONAL_TABLES: [&str; 3] = ["card_tasks", "card_comments", "notifications"];
