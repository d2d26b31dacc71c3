use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Link precedence of a contact row within its identity group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl FromStr for LinkPrecedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            _ => Err(format!("Invalid link precedence: {}", s)),
        }
    }
}

/// One stored contact observation. `email`/`phone`/`created_at` are
/// immutable once written; only `linked_id`, `link_precedence` and
/// `updated_at` change, and only when a group merge demotes a primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub linked_id: Option<i64>,
    pub link_precedence: LinkPrecedence,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl Contact {
    /// Root id of this contact's identity group: its own id for a
    /// primary, the linked primary's id for a secondary.
    pub fn root_id(&self) -> i64 {
        self.linked_id.unwrap_or(self.id)
    }

    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }
}

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentifyRequest {
    pub email: Option<String>,
    #[serde(rename = "phoneNumber")]
    pub phone_number: Option<String>,
}

/// Consolidated view of one identity group.
///
/// `primaryContatctId` is misspelled on purpose: the original wire
/// format shipped with the typo and clients depend on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidatedContact {
    #[serde(rename = "primaryContatctId")]
    pub primary_contact_id: i64,
    pub emails: Vec<String>,
    #[serde(rename = "phoneNumbers")]
    pub phone_numbers: Vec<String>,
    #[serde(rename = "secondaryContactIds")]
    pub secondary_contact_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedContact,
}
