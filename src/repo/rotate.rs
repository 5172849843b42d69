// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup rotation.
//!
//! Incremental snapshots accumulate on `master` without bound. Rotation
//! keeps that history finite by maintaining a fixed-capacity ring of
//! __full backup__ branches (`ringstore/1` newest, higher indices older)
//! and periodically re-rooting `master`:
//!
//! 1. evict tail slots until the ring is below capacity,
//! 2. grow one tail slot to receive shifted content,
//! 3. shift every slot's tip one position toward the tail,
//! 4. seed the head slot from `master`,
//! 5. replace `master` with a parentless copy of its tip commit,
//! 6. regenerate the graft override table.
//!
//! The parentless copy makes the current checkpoint independently
//! restorable — and independently transferable — without any ancestor
//! history. The graft table then stitches the physically disjoint chains
//! back into one logical history for local inspection: the re-rooted
//! `master` is grafted onto the second commit of the head slot's chain
//! (its first duplicates the re-rooted tree), and each slot's oldest
//! commit is grafted onto the second commit of the next older slot's
//! chain, skipping the duplicate tip every time.
//!
//! The shift walks from tail to head over tips captured before any branch
//! moves, so no pointer is ever read after being overwritten. The whole
//! sequence is not transactional: a failure partway through is surfaced
//! as fatal and never silently resumed.

use crate::repo::store::{self, CommitInfo, ObjectStore};

use git2::Oid;
use tracing::{debug, info, warn};

/// Namespace of ring slot branches.
pub const SLOT_PREFIX: &str = "ringstore/";

/// Branch name of a ring slot.
pub fn slot_name(index: u32) -> String {
    format!("{SLOT_PREFIX}{index}")
}

/// What a rotation pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rotation {
    pub rotated: bool,
    pub evicted: Vec<String>,
    pub slot_count: usize,
}

struct Slot {
    index: u32,
    name: String,
    tip: Option<Oid>,
}

/// Run one rotation pass against the object store.
///
/// A no-op unless rotation is due: both limits zero disables rotation
/// entirely, and the reachable snapshot count on `master` must exceed
/// `increment_limit`. Limits below one fall back to defensive defaults
/// (30 incremental, 6 full) so the engine never rotates into a zero-width
/// ring.
///
/// `task_label` and `entries` only feed the synthetic message of the
/// re-rooted full-backup commit.
///
/// # Errors
///
/// - Return [`Error::Store`] if any object store operation fails. The
///   ring may be partially rotated at that point; operator intervention
///   is required rather than a retry.
pub fn rotate(
    store: &impl ObjectStore,
    task_label: &str,
    entries: &[String],
    increment_limit: u32,
    full_limit: u32,
) -> Result<Rotation> {
    if increment_limit == 0 && full_limit == 0 {
        return Ok(Rotation::default());
    }
    let increment_limit = if increment_limit < 1 { 30 } else { increment_limit };
    let full_limit = if full_limit < 1 { 6 } else { full_limit };

    let count = store.list_reachable_commits("master")?.len();
    if count <= increment_limit as usize {
        debug!("no backup rotation needed, {count} <= {increment_limit}");
        return Ok(Rotation::default());
    }
    debug!("start to rotate, {count} > {increment_limit}");

    // Slot listing sorted by numeric index. String order would misplace
    // ringstore/10 before ringstore/2.
    let mut slots: Vec<Slot> = Vec::new();
    for name in store.list_branches(SLOT_PREFIX)? {
        match name[SLOT_PREFIX.len()..].parse::<u32>() {
            Ok(index) => slots.push(Slot {
                index,
                tip: store.branch_tip(&name)?,
                name,
            }),
            Err(_) => warn!("ignore stray branch {name} in slot namespace"),
        }
    }
    slots.sort_by_key(|slot| slot.index);

    // Evict from the tail until below capacity.
    let capacity = full_limit as usize;
    let mut evicted = Vec::new();
    while slots.len() >= capacity {
        let Some(slot) = slots.pop() else {
            break;
        };
        store.delete_branch(&slot.name)?;
        info!("deleted full backup slot {}", slot.name);
        evicted.push(slot.name);
    }

    // Grow one tail slot to receive shifted content.
    if slots.len() < capacity {
        let index = slots.last().map(|slot| slot.index + 1).unwrap_or(1);
        slots.push(Slot {
            index,
            name: slot_name(index),
            tip: None,
        });
    }

    // Shift tail to head from pre-captured tips.
    for i in (1..slots.len()).rev() {
        if let Some(tip) = slots[i - 1].tip {
            store.move_branch(&slots[i].name, tip)?;
            debug!("update slot {} (value from {})", slots[i].name, slots[i - 1].name);
        }
    }

    let Some(master_tip) = store.branch_tip("master")? else {
        // Nothing to re-root; the pass degenerates to ring maintenance.
        warn!("master has no reachable history, skip re-root");
        return Ok(Rotation {
            rotated: true,
            evicted,
            slot_count: slots.len(),
        });
    };

    // Seed the head slot with the checkpoint being collapsed.
    store.move_branch(&slots[0].name, master_tip)?;
    debug!("update slot {} (from master)", slots[0].name);

    // Re-root master: same tree, no parents, summary up front.
    let tip = store.read_commit(master_tip)?;
    let listing = entries
        .iter()
        .map(|entry| format!("    {entry}"))
        .collect::<Vec<_>>()
        .join("\n");
    let message = format!(
        "Full backup of {task_label}\n\n{listing}\n\n** Copy from this commit **\n\n{}",
        tip.message
    );
    let new_master = store.create_commit(&CommitInfo {
        tree: tip.tree,
        parents: Vec::new(),
        author: tip.author,
        committer: tip.committer,
        message,
    })?;
    store.move_branch("master", new_master)?;
    info!("update master with {new_master}");

    // Regenerate the graft table in one pass. The flat sequence pairs the
    // re-rooted master with the head slot's second commit, then each
    // slot's oldest commit with the next slot's second commit. A slot
    // with no reachable history contributes nothing.
    let mut flat = vec![new_master];
    for slot in &slots {
        let ids = store.list_reachable_commits(&slot.name)?;
        if ids.is_empty() {
            continue;
        }
        let second = if ids.len() > 1 { ids[1] } else { ids[0] };
        let oldest = ids[ids.len() - 1];
        flat.push(second);
        flat.push(oldest);
    }
    let pairs = flat
        .chunks(2)
        .filter(|chunk| chunk.len() == 2)
        .map(|chunk| (chunk[0], chunk[1]))
        .collect::<Vec<_>>();
    store.set_grafts(&pairs)?;
    debug!("regenerated graft table with {} pairs", pairs.len());

    Ok(Rotation {
        rotated: true,
        evicted,
        slot_count: slots.len(),
    })
}

/// Rotation error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object store operation fails mid-rotation.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Friendly result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
