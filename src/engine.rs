//! Reconciliation engine.
//!
//! One `identify` call maps an incoming (email, phone) observation onto
//! an identity group: reuse an exact match, merge every group the
//! observation bridges (oldest primary survives), and record genuinely
//! new information as a secondary. Callers must run the whole function
//! under the store's serialization boundary (`DbHandle::call`); the
//! read-then-write sequence is not safe against overlapping concurrent
//! invocations otherwise.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::db::ContactDb;
use crate::errors::ReconcileError;
use crate::models::{ConsolidatedContact, Contact, LinkPrecedence};
use crate::view;

fn db_err(e: anyhow::Error) -> ReconcileError {
    ReconcileError::Database(e)
}

/// Resolve the incoming observation to its consolidated identity group,
/// merging and creating records as needed.
pub fn identify(
    db: &ContactDb,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<ConsolidatedContact, ReconcileError> {
    if email.is_none() && phone.is_none() {
        return Err(ReconcileError::MissingIdentifiers);
    }

    let matches = db.find_matches(email, phone).map_err(db_err)?;

    // No match: the observation starts a new identity group.
    if matches.is_empty() {
        let created = db
            .create_contact(email, phone, None, LinkPrecedence::Primary)
            .map_err(db_err)?;
        info!(contact_id = created.id, "Created new primary contact");
        return view::project(db, created.id);
    }

    // Exact duplicate: the pair carries no information beyond one row.
    if let Some(existing) = matches
        .iter()
        .find(|c| c.email.as_deref() == email && c.phone.as_deref() == phone)
    {
        return view::project(db, existing.root_id());
    }

    // Partial match: gather the distinct group roots the matches reach,
    // then merge down to the oldest one.
    let root_ids: BTreeSet<i64> = matches.iter().map(Contact::root_id).collect();
    let primary_id = merge_roots(db, &root_ids)?;

    // New-information check against the (possibly just merged) group.
    let group = db.expand_group(primary_id).map_err(db_err)?;
    let has_new_email =
        email.is_some_and(|e| !group.iter().any(|c| c.email.as_deref() == Some(e)));
    let has_new_phone =
        phone.is_some_and(|p| !group.iter().any(|c| c.phone.as_deref() == Some(p)));

    if has_new_email || has_new_phone {
        let created = db
            .create_contact(email, phone, Some(primary_id), LinkPrecedence::Secondary)
            .map_err(db_err)?;
        info!(
            contact_id = created.id,
            primary_id, "Created secondary contact for new information"
        );
    }

    view::project(db, primary_id)
}

/// Collapse a set of group roots to a single surviving primary: minimum
/// (created_at, id) wins, every other root is demoted and its secondaries
/// re-pointed so the graph stays one level deep.
fn merge_roots(db: &ContactDb, root_ids: &BTreeSet<i64>) -> Result<i64, ReconcileError> {
    let mut roots = Vec::with_capacity(root_ids.len());
    for &id in root_ids {
        let root = db
            .get_contact(id)
            .map_err(db_err)?
            .ok_or(ReconcileError::ContactNotFound { id })?;
        if !root.is_primary() {
            // A secondary reachable as a root means a prior merge left a
            // chain behind; refusing here stops the corruption spreading.
            return Err(ReconcileError::BrokenLink {
                id: root.id,
                linked_id: root.linked_id.unwrap_or(root.id),
            });
        }
        roots.push(root);
    }

    let survivor_id = roots
        .iter()
        .min_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.id.cmp(&b.id))
        })
        .map(|c| c.id)
        .ok_or_else(|| ReconcileError::Other(anyhow::anyhow!("merge_roots called with no roots")))?;

    let demoted = root_ids.len() - 1;
    for root in roots.iter().filter(|r| r.id != survivor_id) {
        db.repoint_secondaries(root.id, survivor_id).map_err(db_err)?;
        db.demote_to_secondary(root.id, survivor_id).map_err(db_err)?;
    }
    if demoted > 0 {
        info!(survivor_id, demoted, "Merged identity groups");
    }
    if demoted > 1 {
        warn!(survivor_id, demoted, "Multi-way merge in a single call");
    }

    Ok(survivor_id)
}
