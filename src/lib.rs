// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Periodic backup orchestration atop a commit-graph object store.
//!
//! Ringstore tracks a configurable set of filesystem entries and commits
//! their state as point-in-time snapshots into a bare store whose work
//! tree is aliased to the filesystem root. Snapshot history stays bounded
//! through a rotating ring of independently restorable full-backup
//! branches; see [`repo::rotate`] for the rotation algorithm and
//! [`repo::Repo`] for session operations.

pub mod config;
pub mod entries;
pub mod exclude;
pub mod path;
pub mod repo;
pub mod tasks;
