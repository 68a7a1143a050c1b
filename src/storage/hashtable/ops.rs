//! Hash table commands.
//!
//! Plain commands take exactly one key (and value). Migration batches go
//! through the `locked_*` mutators, which accept any number of pairs (or
//! keys) and answer one status per item. Every command accepts a trailing
//! `!redirected` marker.

use super::{HashStore, PartitionMetadata, ShardState};
use crate::storage::arena::AllocError;
use crate::storage::hash_slot::hash_slot;
use crate::storage::partition::{
    Admission, Command, CommandOutput, CommandTable, PartitionEvent,
};
use crate::types::{ReplicaChain, Response, SlotRange, Status, REDIRECTED_MARKER, SLOT_MAX};
use dashmap::mapref::entry::Entry;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

/// Command names.
pub mod cmd {
    pub const EXISTS: &str = "exists";
    pub const GET: &str = "get";
    pub const KEYS: &str = "keys";
    pub const NUM_KEYS: &str = "num_keys";
    pub const PUT: &str = "put";
    pub const REMOVE: &str = "remove";
    pub const UPDATE: &str = "update";
    pub const UPSERT: &str = "upsert";
    pub const LOCK: &str = "lock";
    pub const UNLOCK: &str = "unlock";
    pub const LOCKED_GET_DATA_IN_SLOT_RANGE: &str = "locked_get_data_in_slot_range";
    pub const LOCKED_GET: &str = "locked_get";
    pub const LOCKED_PUT: &str = "locked_put";
    pub const LOCKED_REMOVE: &str = "locked_remove";
    pub const LOCKED_UPDATE: &str = "locked_update";
    pub const LOCKED_UPSERT: &str = "locked_upsert";
    pub const UPDATE_PARTITION: &str = "update_partition";
    pub const LOCKED_UPDATE_PARTITION: &str = "locked_update_partition";
    pub const GET_STORAGE_SIZE: &str = "get_storage_size";
    pub const LOCKED_GET_STORAGE_SIZE: &str = "locked_get_storage_size";
    pub const GET_METADATA: &str = "get_metadata";
    pub const LOCKED_GET_METADATA: &str = "locked_get_metadata";
}

pub static HASH_TABLE_COMMANDS: CommandTable = CommandTable::new(&[
    Command::accessor(cmd::EXISTS),
    Command::accessor(cmd::GET),
    Command::accessor(cmd::KEYS),
    Command::accessor(cmd::NUM_KEYS),
    Command::mutator(cmd::PUT),
    Command::mutator(cmd::REMOVE),
    Command::mutator(cmd::UPDATE),
    Command::mutator(cmd::LOCK),
    Command::mutator(cmd::UNLOCK),
    Command::accessor(cmd::LOCKED_GET_DATA_IN_SLOT_RANGE),
    Command::accessor(cmd::LOCKED_GET),
    Command::mutator(cmd::LOCKED_PUT),
    Command::mutator(cmd::LOCKED_REMOVE),
    Command::mutator(cmd::LOCKED_UPDATE),
    Command::mutator(cmd::UPSERT),
    Command::mutator(cmd::LOCKED_UPSERT),
    Command::mutator(cmd::UPDATE_PARTITION),
    Command::mutator(cmd::LOCKED_UPDATE_PARTITION),
    Command::accessor(cmd::GET_STORAGE_SIZE),
    Command::accessor(cmd::LOCKED_GET_STORAGE_SIZE),
    Command::accessor(cmd::GET_METADATA),
    Command::accessor(cmd::LOCKED_GET_METADATA),
]);

/// Where a key stands relative to this shard's ranges.
enum Route {
    /// Outside every range served here.
    Moved,
    /// Served here; `exporting_to` is set when the key's slot is being
    /// exported.
    Accepted { exporting_to: Option<ReplicaChain> },
}

impl HashStore {
    pub(super) async fn admission_for(&self, command: &str) -> Admission {
        match command {
            cmd::LOCK if !self.is_locked() => {
                Admission::Exclusive(self.gate.clone().write_owned().await)
            }
            cmd::EXISTS | cmd::GET | cmd::KEYS | cmd::NUM_KEYS | cmd::PUT | cmd::REMOVE
            | cmd::UPDATE | cmd::UPSERT => Admission::Shared(self.gate.clone().read_owned().await),
            _ => Admission::Free,
        }
    }

    /// Execute one command. The caller has already obtained `admission`.
    pub(super) fn dispatch(&self, args: &[String], admission: Admission) -> CommandOutput {
        let Some((command, rest)) = args.split_first() else {
            return Status::ArgsError.reply().into();
        };
        let (rest, redirect) = match rest.split_last() {
            Some((last, init)) if last == REDIRECTED_MARKER => (init, true),
            _ => (rest, false),
        };

        if command == cmd::UPDATE_PARTITION || command == cmd::LOCKED_UPDATE_PARTITION {
            return match rest {
                [_, _] if command == cmd::LOCKED_UPDATE_PARTITION && !self.is_locked() => {
                    Status::BlockNotLocked.reply().into()
                }
                [name, metadata] => self.update_partition(name, metadata),
                _ => Status::ArgsError.reply().into(),
            };
        }

        let response = self.execute(command, rest, redirect, admission);
        if HASH_TABLE_COMMANDS.is_mutator(command) {
            self.dirty.store(true, Ordering::Release);
        }
        CommandOutput::with_event(response, self.scale_event(command))
    }

    fn execute(&self, command: &str, rest: &[String], redirect: bool, admission: Admission) -> Response {
        match command {
            cmd::EXISTS => one_key(rest, |k| self.exists(k, redirect)),
            cmd::GET => one_key(rest, |k| self.get(k, redirect)),
            cmd::PUT => one_pair(rest, |k, v| self.put(k, v, redirect)),
            cmd::UPSERT => one_pair(rest, |k, v| self.upsert(k, v, redirect)),
            cmd::UPDATE => one_pair(rest, |k, v| self.update(k, v, redirect)),
            cmd::REMOVE => one_key(rest, |k| self.remove(k, redirect)),
            cmd::NUM_KEYS => no_args(rest, || Status::Ok.reply_with(self.len().to_string())),
            cmd::KEYS => no_args(rest, || self.keys()),
            cmd::LOCK => no_args(rest, || self.lock_with(admission)),
            cmd::UNLOCK => no_args(rest, || self.unlock()),
            cmd::LOCKED_GET => one_key(rest, |k| self.locked(|| self.get(k, redirect))),
            cmd::LOCKED_PUT => each_pair(rest, |k, v| self.locked(|| self.put(k, v, redirect))),
            cmd::LOCKED_UPSERT => {
                each_pair(rest, |k, v| self.locked(|| self.upsert(k, v, redirect)))
            }
            cmd::LOCKED_UPDATE => {
                each_pair(rest, |k, v| self.locked(|| status_only(self.update(k, v, redirect))))
            }
            cmd::LOCKED_REMOVE => {
                each_key(rest, |k| self.locked(|| status_only(self.remove(k, redirect))))
            }
            cmd::LOCKED_GET_DATA_IN_SLOT_RANGE => match rest {
                [begin, end, count] => match (begin.parse(), end.parse(), count.parse()) {
                    (Ok(b), Ok(e), Ok(n)) => self.locked_get_data_in_slot_range(b, e, n),
                    _ => Status::ArgsError.reply(),
                },
                _ => Status::ArgsError.reply(),
            },
            cmd::GET_STORAGE_SIZE => {
                no_args(rest, || Status::Ok.reply_with(self.bytes().to_string()))
            }
            cmd::LOCKED_GET_STORAGE_SIZE => no_args(rest, || {
                self.locked(|| Status::Ok.reply_with(self.bytes().to_string()))
            }),
            cmd::GET_METADATA => no_args(rest, || Status::Ok.reply_with(self.shard.read().metadata.clone())),
            cmd::LOCKED_GET_METADATA => no_args(rest, || {
                self.locked(|| Status::Ok.reply_with(self.shard.read().metadata.clone()))
            }),
            _ => Status::UnknownCommand.reply(),
        }
    }

    fn route(&self, key: &str, redirect: bool) -> Route {
        let slot = hash_slot(key);
        let shard = self.shard.read();
        let imported = redirect && shard.import_slot_range.is_some_and(|r| r.contains(slot));
        if !shard.slot_range.contains(slot) && !imported {
            return Route::Moved;
        }
        let exporting_to = match (&shard.state, shard.export_slot_range, &shard.export_target) {
            (ShardState::Exporting, Some(range), Some(target)) if range.contains(slot) => {
                Some(target.clone())
            }
            _ => None,
        };
        Route::Accepted { exporting_to }
    }

    fn alloc_failure(&self, err: AllocError) -> Response {
        match err {
            AllocError::OutOfCapacity { .. } => {
                warn!(error = %err, "Shard out of capacity");
                Status::OutOfCapacity.reply()
            }
            AllocError::AllocationFailed(_) => {
                error!(error = %err, "Allocation failed");
                Status::Fail.reply()
            }
        }
    }

    /// Insert a key that must not exist yet.
    pub(super) fn insert_new(&self, key: &str, value: &str) -> Response {
        if self.map.contains_key(key) {
            return Status::DuplicateKey.reply();
        }
        let k = match self.arena.alloc_str(key) {
            Ok(k) => k,
            Err(e) => return self.alloc_failure(e),
        };
        let v = match self.arena.alloc_str(value) {
            Ok(v) => v,
            Err(e) => return self.alloc_failure(e),
        };
        match self.map.entry(k) {
            Entry::Occupied(_) => Status::DuplicateKey.reply(),
            Entry::Vacant(slot) => {
                slot.insert(v);
                self.bytes.fetch_add(key.len() + value.len(), Ordering::AcqRel);
                Status::Ok.reply()
            }
        }
    }

    /// `!ok` with `"true"` if the key is present.
    pub fn exists(&self, key: &str, redirect: bool) -> Response {
        match self.route(key, redirect) {
            Route::Moved => Status::BlockMoved.reply(),
            Route::Accepted { exporting_to } => {
                if self.map.contains_key(key) {
                    Status::Ok.reply_with("true")
                } else {
                    missing(exporting_to)
                }
            }
        }
    }

    /// `!ok` with the value.
    pub fn get(&self, key: &str, redirect: bool) -> Response {
        match self.route(key, redirect) {
            Route::Moved => Status::BlockMoved.reply(),
            Route::Accepted { exporting_to } => match self.map.get(key) {
                Some(value) => Status::Ok.reply_with(value.as_str()),
                None => missing(exporting_to),
            },
        }
    }

    /// Insert; `!duplicate_key` if present.
    pub fn put(&self, key: &str, value: &str, redirect: bool) -> Response {
        match self.route(key, redirect) {
            Route::Moved => Status::BlockMoved.reply(),
            Route::Accepted {
                exporting_to: Some(target),
            } => Status::Exporting(target).reply(),
            Route::Accepted { exporting_to: None } => self.insert_new(key, value),
        }
    }

    /// Insert or overwrite.
    pub fn upsert(&self, key: &str, value: &str, redirect: bool) -> Response {
        match self.route(key, redirect) {
            Route::Moved => return Status::BlockMoved.reply(),
            Route::Accepted {
                exporting_to: Some(target),
            } => return Status::Exporting(target).reply(),
            Route::Accepted { exporting_to: None } => {}
        }

        let v = match self.arena.alloc_str(value) {
            Ok(v) => v,
            Err(e) => return self.alloc_failure(e),
        };
        if let Some(mut current) = self.map.get_mut(key) {
            let old = std::mem::replace(current.value_mut(), v);
            drop(current);
            self.adjust_bytes(old.len(), value.len());
            return Status::Ok.reply();
        }

        let k = match self.arena.alloc_str(key) {
            Ok(k) => k,
            Err(e) => return self.alloc_failure(e),
        };
        match self.map.entry(k) {
            Entry::Occupied(mut current) => {
                let old = current.insert(v);
                self.adjust_bytes(old.len(), value.len());
            }
            Entry::Vacant(slot) => {
                slot.insert(v);
                self.bytes.fetch_add(key.len() + value.len(), Ordering::AcqRel);
            }
        }
        Status::Ok.reply()
    }

    /// Overwrite an existing key; `!ok` with the previous value.
    pub fn update(&self, key: &str, value: &str, redirect: bool) -> Response {
        let exporting_to = match self.route(key, redirect) {
            Route::Moved => return Status::BlockMoved.reply(),
            Route::Accepted { exporting_to } => exporting_to,
        };
        let Some(mut current) = self.map.get_mut(key) else {
            return missing(exporting_to);
        };
        let v = match self.arena.alloc_str(value) {
            Ok(v) => v,
            Err(e) => return self.alloc_failure(e),
        };
        let old = std::mem::replace(current.value_mut(), v);
        drop(current);
        self.adjust_bytes(old.len(), value.len());
        Status::Ok.reply_with(old.as_str())
    }

    /// Delete; `!ok` with the removed value.
    pub fn remove(&self, key: &str, redirect: bool) -> Response {
        let exporting_to = match self.route(key, redirect) {
            Route::Moved => return Status::BlockMoved.reply(),
            Route::Accepted { exporting_to } => exporting_to,
        };
        match self.map.remove(key) {
            Some((k, v)) => {
                self.bytes.fetch_sub(k.len() + v.len(), Ordering::AcqRel);
                Status::Ok.reply_with(v.as_str())
            }
            None => missing(exporting_to),
        }
    }

    /// `!ok` followed by every key.
    pub fn keys(&self) -> Response {
        let mut response = Status::Ok.reply();
        response.extend(self.map.iter().map(|e| e.key().to_string()));
        response
    }

    /// Take the table lock with an already acquired exclusive gate guard.
    fn lock_with(&self, admission: Admission) -> Response {
        if let Admission::Exclusive(guard) = admission {
            let mut slot = self.table_lock.lock();
            if slot.is_none() {
                *slot = Some(guard);
            }
        }
        Status::Ok.reply()
    }

    /// Take the table lock, waiting for in-flight plain commands.
    pub async fn lock(&self) -> Response {
        let admission = self.admission_for(cmd::LOCK).await;
        self.lock_with(admission)
    }

    pub fn unlock(&self) -> Response {
        self.table_lock.lock().take();
        Status::Ok.reply()
    }

    fn locked(&self, op: impl FnOnce() -> Response) -> Response {
        if self.is_locked() {
            op()
        } else {
            Status::BlockNotLocked.reply()
        }
    }

    /// Up to `num_keys` entries whose slot lies in `[begin, end]`, flattened
    /// as `!ok, k1, v1, k2, v2, ...`.
    pub fn locked_get_data_in_slot_range(&self, begin: u32, end: u32, num_keys: usize) -> Response {
        if !self.is_locked() {
            return Status::BlockNotLocked.reply();
        }
        let range = SlotRange::new(begin, end);
        let mut response = Status::Ok.reply();
        for entry in self.map.iter() {
            if response.len() / 2 >= num_keys {
                break;
            }
            if range.contains(hash_slot(entry.key())) {
                response.push(entry.key().to_string());
                response.push(entry.value().to_string());
            }
        }
        response
    }

    /// Apply a `status$range$target` metadata change and rename the shard.
    pub fn update_partition(&self, new_name: &str, metadata: &str) -> CommandOutput {
        if new_name == "merging" && metadata == "merging" {
            return self.claim_for_merge().into();
        }

        let Some(parsed) = PartitionMetadata::parse(metadata) else {
            return Status::ArgsError.reply().into();
        };
        let Some(new_range) = SlotRange::parse(new_name) else {
            return Status::ArgsError.reply().into();
        };
        let parsed_range = parsed.range.as_deref().and_then(SlotRange::parse);

        let mut shard = self.shard.write();
        let mut event = None;
        match parsed.state {
            ShardState::Importing => {
                let fresh_import = shard.state == ShardState::Importing && shard.import_slot_range.is_none();
                if shard.state != ShardState::Regular && !fresh_import {
                    return Status::Fail.reply().into();
                }
                let Some(range) = parsed_range else {
                    return Status::ArgsError.reply().into();
                };
                shard.import_slot_range = Some(range);
                shard.export_slot_range = None;
                shard.export_target = None;
            }
            ShardState::Exporting => {
                let (Some(range), Some(target)) = (parsed_range, parsed.target) else {
                    return Status::ArgsError.reply().into();
                };
                // From regular, from a merge claim, or a retry of the same export.
                let claimed = shard.state == ShardState::Exporting && shard.export_slot_range.is_none();
                let same_export = shard.state == ShardState::Exporting
                    && shard.export_slot_range == Some(range)
                    && shard.export_target.as_ref() == Some(&target);
                if shard.state != ShardState::Regular && !claimed && !same_export {
                    return Status::Fail.reply().into();
                }
                shard.export_slot_range = Some(range);
                shard.export_target = Some(target);
                shard.import_slot_range = None;
            }
            ShardState::Regular => {
                if shard.state == ShardState::Importing {
                    let widened = shard.import_slot_range.is_some_and(|r| r != new_range);
                    if let (true, Some(source)) = (widened, parsed.range.clone()) {
                        event = Some(PartitionEvent::ImportFinished { source });
                    }
                }
                shard.export_slot_range = None;
                shard.export_target = None;
                shard.import_slot_range = None;
            }
        }

        info!(
            from = %shard.name,
            to = new_name,
            metadata = metadata,
            "Updated partition"
        );
        shard.name = new_name.to_string();
        shard.slot_range = new_range;
        shard.state = parsed.state;
        shard.metadata = metadata.to_string();
        drop(shard);

        self.dirty.store(true, Ordering::Release);
        CommandOutput::with_event(Status::Ok.reply(), event)
    }

    /// Mark a regular shard that does not own the whole key space as
    /// exporting, returning its name.
    fn claim_for_merge(&self) -> Response {
        let mut shard = self.shard.write();
        if shard.state == ShardState::Regular && shard.slot_range != SlotRange::FULL {
            shard.state = ShardState::Exporting;
            shard.metadata = ShardState::Exporting.to_string();
            Status::Ok.reply_with(shard.name.clone())
        } else {
            Status::Fail.reply()
        }
    }

    /// Split after data growth, merge after a remove. Never while locked or
    /// already migrating.
    fn scale_event(&self, command: &str) -> Option<PartitionEvent> {
        if !self.config.auto_scale || self.is_locked() || self.migration.is_active() {
            return None;
        }
        let shard = self.shard.read();
        if shard.state != ShardState::Regular {
            return None;
        }
        match command {
            cmd::PUT | cmd::UPSERT | cmd::UPDATE if self.overloaded() => Some(PartitionEvent::Overloaded),
            cmd::REMOVE if shard.slot_range.end != SLOT_MAX && self.underloaded() => {
                Some(PartitionEvent::Underloaded)
            }
            _ => None,
        }
    }
}

fn missing(exporting_to: Option<ReplicaChain>) -> Response {
    match exporting_to {
        Some(target) => Status::Exporting(target).reply(),
        None => Status::KeyNotFound.reply(),
    }
}

/// Keep only the status tag.
fn status_only(mut response: Response) -> Response {
    response.truncate(1);
    response
}

fn no_args(args: &[String], op: impl FnOnce() -> Response) -> Response {
    if args.is_empty() {
        op()
    } else {
        Status::ArgsError.reply()
    }
}

fn one_key(args: &[String], op: impl FnOnce(&str) -> Response) -> Response {
    match args {
        [key] => op(key),
        _ => Status::ArgsError.reply(),
    }
}

fn one_pair(args: &[String], op: impl FnOnce(&str, &str) -> Response) -> Response {
    match args {
        [key, value] => op(key, value),
        _ => Status::ArgsError.reply(),
    }
}

fn each_key(args: &[String], mut op: impl FnMut(&str) -> Response) -> Response {
    if args.is_empty() {
        return Status::ArgsError.reply();
    }
    args.iter().flat_map(|k| op(k)).collect()
}

fn each_pair(args: &[String], mut op: impl FnMut(&str, &str) -> Response) -> Response {
    if args.is_empty() || args.len() % 2 != 0 {
        return Status::ArgsError.reply();
    }
    args.chunks_exact(2).flat_map(|pair| op(&pair[0], &pair[1])).collect()
}
