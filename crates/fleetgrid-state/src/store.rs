//! StateStore — redb-backed state persistence for FleetGrid.
//!
//! Provides typed operations over rollouts, dispatch records, devices, and
//! images. All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of a guarded dispatch record status change.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchTransition {
    /// The record as persisted after the call.
    pub record: DispatchRecord,
    /// Status the record had before the call.
    pub previous: DispatchStatus,
    /// Whether the requested status was written.
    pub applied: bool,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(DISPATCH_RECORDS).map_err(map_err!(Table))?;
        txn.open_table(CORRELATIONS).map_err(map_err!(Table))?;
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.open_table(IMAGES).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device.
    pub fn put_device(&self, device: &Device) -> StateResult<()> {
        let value = encode(device)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            table
                .insert(device.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: DeviceId) -> StateResult<Option<Device>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        match table.get(device_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all devices.
    pub fn list_devices(&self) -> StateResult<Vec<Device>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Record whether the dispatcher accepted a device's last execution request.
    pub fn set_device_connected(&self, device_id: DeviceId, connected: bool) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let mut device: Device = get_in(&table, device_id)?
                .ok_or_else(|| StateError::NotFound(format!("device {device_id}")))?;
            device.connected = connected;
            device.updated_at = epoch_secs();
            put_in(&mut table, device_id, &device)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Point every device of `account` whose id is in `device_ids` at
    /// `image_id` and set its update-available flag, in one transaction.
    ///
    /// Devices of other accounts are never touched even if listed. Returns
    /// the number of devices updated.
    pub fn update_device_fleet_fields(
        &self,
        account: &str,
        device_ids: &[DeviceId],
        image_id: ImageId,
        update_available: bool,
    ) -> StateResult<u32> {
        let wanted: HashSet<DeviceId> = device_ids.iter().copied().collect();
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            for device_id in wanted {
                let Some(mut device) = get_in::<Device>(&table, device_id)? else {
                    continue;
                };
                if device.account != account {
                    continue;
                }
                device.image_id = Some(image_id);
                device.update_available = update_available;
                device.updated_at = now;
                put_in(&mut table, device_id, &device)?;
                count += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%account, image_id, update_available, count, "device fleet fields updated");
        Ok(count)
    }

    // ── Images ─────────────────────────────────────────────────────

    /// Insert or update an image.
    pub fn put_image(&self, image: &Image) -> StateResult<()> {
        let value = encode(image)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
            table
                .insert(image.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an image by ID.
    pub fn get_image(&self, image_id: ImageId) -> StateResult<Option<Image>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
        match table.get(image_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all images.
    pub fn list_images(&self) -> StateResult<Vec<Image>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Find the image of `account` built from the given OSTree commit.
    ///
    /// When several images share the commit, the oldest one wins.
    pub fn find_image_by_commit(
        &self,
        account: &str,
        os_tree_commit: &str,
    ) -> StateResult<Option<Image>> {
        Ok(self
            .list_images()?
            .into_iter()
            .filter(|img| img.account == account && img.commit.os_tree_commit == os_tree_commit)
            .min_by_key(|img| (img.created_at, img.id)))
    }

    /// Successful images of the same set created strictly after `after`.
    pub fn newer_successful_images(
        &self,
        account: &str,
        image_set_id: ImageSetId,
        after: u64,
    ) -> StateResult<Vec<Image>> {
        Ok(self
            .list_images()?
            .into_iter()
            .filter(|img| {
                img.account == account
                    && img.image_set_id == image_set_id
                    && img.status == ImageStatus::Success
                    && img.created_at > after
            })
            .collect())
    }

    /// Number of distinct image sets among the account's images in `image_ids`.
    ///
    /// Ids that do not exist or belong to another account are not counted.
    pub fn count_image_sets(&self, account: &str, image_ids: &[ImageId]) -> StateResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
        let mut sets = HashSet::new();
        for image_id in image_ids {
            if let Some(guard) = table.get(*image_id).map_err(map_err!(Read))? {
                let image: Image = decode(guard.value())?;
                if image.account == account {
                    sets.insert(image.image_set_id);
                }
            }
        }
        Ok(sets.len())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Create a rollout in `Created` status and return it with its new id.
    pub fn create_rollout(
        &self,
        account: &str,
        commit: Option<Commit>,
        device_ids: Vec<DeviceId>,
    ) -> StateResult<Rollout> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rollout = {
            let id = next_id(&txn, "rollouts")?;
            let rollout = Rollout {
                id,
                account: account.to_string(),
                commit,
                repo_url: None,
                device_ids,
                dispatch_record_ids: Vec::new(),
                status: RolloutStatus::Created,
                failure: None,
                created_at: now,
                updated_at: now,
            };
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            put_in(&mut table, id, &rollout)?;
            rollout
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout_id = rollout.id, account = %rollout.account, "rollout created");
        Ok(rollout)
    }

    /// Get a rollout by ID.
    pub fn get_rollout(&self, rollout_id: RolloutId) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(rollout_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all rollouts, ordered by id.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List rollouts currently in the given status.
    pub fn list_rollouts_by_status(&self, status: RolloutStatus) -> StateResult<Vec<Rollout>> {
        let mut rollouts = self.list_rollouts()?;
        rollouts.retain(|r| r.status == status);
        Ok(rollouts)
    }

    /// List every rollout that targeted the given device.
    pub fn list_rollouts_for_device(&self, device_id: DeviceId) -> StateResult<Vec<Rollout>> {
        let mut rollouts = self.list_rollouts()?;
        rollouts.retain(|r| r.device_ids.contains(&device_id));
        Ok(rollouts)
    }

    /// Read-modify-write a rollout in one transaction.
    ///
    /// `f` returns whether it changed the rollout; nothing is written when
    /// it returns `false`. Returns the persisted rollout and that flag.
    pub fn modify_rollout<F>(&self, rollout_id: RolloutId, f: F) -> StateResult<(Rollout, bool)>
    where
        F: FnOnce(&mut Rollout) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&table, rollout_id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
            let changed = f(&mut rollout);
            if changed {
                rollout.updated_at = epoch_secs();
                put_in(&mut table, rollout_id, &rollout)?;
            }
            (rollout, changed)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// Recompute a rollout's status from its dispatch records.
    ///
    /// The rollout and all of its records are read, `resolve` is applied, and
    /// the result is written, all inside one write transaction. Returns the
    /// previous status and the persisted rollout.
    pub fn refresh_rollout_status<F>(
        &self,
        rollout_id: RolloutId,
        resolve: F,
    ) -> StateResult<(RolloutStatus, Rollout)>
    where
        F: FnOnce(&Rollout, &[DispatchRecord]) -> RolloutStatus,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let records_table = txn.open_table(DISPATCH_RECORDS).map_err(map_err!(Table))?;
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&table, rollout_id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;

            let mut records = Vec::with_capacity(rollout.dispatch_record_ids.len());
            for record_id in &rollout.dispatch_record_ids {
                let record: DispatchRecord = get_in(&records_table, *record_id)?.ok_or_else(|| {
                    StateError::NotFound(format!("dispatch record {record_id}"))
                })?;
                records.push(record);
            }

            let previous = rollout.status;
            let next = resolve(&rollout, &records);
            if next != previous {
                rollout.status = next;
                rollout.updated_at = epoch_secs();
                put_in(&mut table, rollout_id, &rollout)?;
            }
            (previous, rollout)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    // ── Dispatch records ───────────────────────────────────────────

    /// Store a new dispatch record and append it to its rollout.
    ///
    /// The record, its correlation index entry, and the rollout's record
    /// list are written in one transaction.
    pub fn append_dispatch_record(
        &self,
        rollout_id: RolloutId,
        new: NewDispatchRecord,
    ) -> StateResult<DispatchRecord> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&rollouts, rollout_id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;

            let id = next_id(&txn, "dispatch_records")?;
            let record = DispatchRecord {
                id,
                rollout_id,
                device_id: new.device_id,
                correlation_id: new.correlation_id,
                script_url: new.script_url,
                status: new.status,
                created_at: now,
                updated_at: now,
            };

            if let Some(correlation_id) = &record.correlation_id {
                let mut index = txn.open_table(CORRELATIONS).map_err(map_err!(Table))?;
                if index
                    .get(correlation_id.as_str())
                    .map_err(map_err!(Read))?
                    .is_some()
                {
                    return Err(StateError::DuplicateCorrelation(correlation_id.clone()));
                }
                index
                    .insert(correlation_id.as_str(), id)
                    .map_err(map_err!(Write))?;
            }

            let mut records = txn.open_table(DISPATCH_RECORDS).map_err(map_err!(Table))?;
            put_in(&mut records, id, &record)?;

            rollout.dispatch_record_ids.push(id);
            rollout.updated_at = now;
            put_in(&mut rollouts, rollout_id, &rollout)?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            rollout_id,
            record_id = record.id,
            device_id = record.device_id,
            status = ?record.status,
            "dispatch record stored"
        );
        Ok(record)
    }

    /// Get a dispatch record by ID.
    pub fn get_dispatch_record(&self, record_id: DispatchRecordId) -> StateResult<Option<DispatchRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DISPATCH_RECORDS).map_err(map_err!(Table))?;
        match table.get(record_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Look up a dispatch record by the dispatcher's correlation id.
    pub fn find_dispatch_record(&self, correlation_id: &str) -> StateResult<Option<DispatchRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(CORRELATIONS).map_err(map_err!(Table))?;
        let Some(record_id) = index
            .get(correlation_id)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
        else {
            return Ok(None);
        };
        let table = txn.open_table(DISPATCH_RECORDS).map_err(map_err!(Table))?;
        match table.get(record_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List a rollout's dispatch records in creation order.
    pub fn list_dispatch_records(&self, rollout_id: RolloutId) -> StateResult<Vec<DispatchRecord>> {
        let Some(rollout) = self.get_rollout(rollout_id)? else {
            return Err(StateError::NotFound(format!("rollout {rollout_id}")));
        };
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DISPATCH_RECORDS).map_err(map_err!(Table))?;
        let mut results = Vec::with_capacity(rollout.dispatch_record_ids.len());
        for record_id in rollout.dispatch_record_ids {
            if let Some(guard) = table.get(record_id).map_err(map_err!(Read))? {
                results.push(decode(guard.value())?);
            }
        }
        Ok(results)
    }

    /// Change a dispatch record's status after re-reading it.
    ///
    /// `decide` sees the persisted status and returns the status to write,
    /// or `None` to leave the record alone. When the record becomes
    /// `Complete`, its device's current hash is set to its available hash in
    /// the same transaction.
    pub fn transition_dispatch_record<F>(
        &self,
        record_id: DispatchRecordId,
        decide: F,
    ) -> StateResult<DispatchTransition>
    where
        F: FnOnce(DispatchStatus) -> Option<DispatchStatus>,
    {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let transition = {
            let mut records = txn.open_table(DISPATCH_RECORDS).map_err(map_err!(Table))?;
            let mut record: DispatchRecord = get_in(&records, record_id)?
                .ok_or_else(|| StateError::NotFound(format!("dispatch record {record_id}")))?;
            let previous = record.status;

            match decide(previous) {
                Some(next) if next != previous => {
                    record.status = next;
                    record.updated_at = now;
                    put_in(&mut records, record_id, &record)?;

                    if next == DispatchStatus::Complete {
                        let mut devices = txn.open_table(DEVICES).map_err(map_err!(Table))?;
                        if let Some(mut device) = get_in::<Device>(&devices, record.device_id)? {
                            device.current_hash = device.available_hash.clone();
                            device.updated_at = now;
                            put_in(&mut devices, device.id, &device)?;
                        }
                    }
                    DispatchTransition {
                        record,
                        previous,
                        applied: true,
                    }
                }
                _ => DispatchTransition {
                    record,
                    previous,
                    applied: false,
                },
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(transition)
    }
}

/// Allocate the next id from the named sequence.
fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let last = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let id = last + 1;
    table.insert(sequence, id).map_err(map_err!(Write))?;
    Ok(id)
}

fn get_in<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    key: u64,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn put_in<T: Serialize>(table: &mut Table<'_, u64, &'static [u8]>, key: u64, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
