//! View assembly: projects a resolved identity group into the
//! consolidated wire shape. Primary values lead, secondaries follow in
//! creation order, first occurrence of a value wins.

use crate::db::ContactDb;
use crate::errors::ReconcileError;
use crate::models::{ConsolidatedContact, Contact};

/// Expand the group rooted at `primary_id` and flatten it into the
/// externally visible consolidated shape.
pub fn project(db: &ContactDb, primary_id: i64) -> Result<ConsolidatedContact, ReconcileError> {
    let group = db
        .expand_group(primary_id)
        .map_err(ReconcileError::Database)?;

    let (primaries, secondaries): (Vec<&Contact>, Vec<&Contact>) =
        group.iter().partition(|c| c.id == primary_id);
    let primary = primaries
        .first()
        .ok_or(ReconcileError::ContactNotFound { id: primary_id })?;
    if !primary.is_primary() {
        return Err(ReconcileError::BrokenLink {
            id: primary.id,
            linked_id: primary.linked_id.unwrap_or(primary.id),
        });
    }

    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();
    for contact in std::iter::once(primary).chain(secondaries.iter()) {
        if let Some(email) = &contact.email {
            if !emails.contains(email) {
                emails.push(email.clone());
            }
        }
        if let Some(phone) = &contact.phone {
            if !phone_numbers.contains(phone) {
                phone_numbers.push(phone.clone());
            }
        }
    }

    Ok(ConsolidatedContact {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids: secondaries.iter().map(|c| c.id).collect(),
    })
}
