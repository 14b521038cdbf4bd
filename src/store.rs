use crate::config::Config;
use crate::error::StoreError;
use crate::id::generate_device_id;
use crate::model::*;
use crate::validate::check_record;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const STORE_DIR: &str = ".tekstil";

const META_SLOT: &str = "meta.json";
const CONFIG_SLOT: &str = "config.json";
const BACKUPS_SLOT: &str = "backups.json";
const FAILURE_BACKUP_SLOT: &str = "failure_backup.json";

fn collection_slot(kind: Kind) -> String {
    format!("{kind}.json")
}

pub fn from_json<T: DeserializeOwned>(path: &Path, json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn to_json<T: Serialize>(path: &Path, value: &T) -> Result<String, StoreError> {
    serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The device-local working copy: one JSON file per slot inside a directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    /// Create a fresh store with a new device id.
    pub fn init(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = LocalStore { dir: dir.into() };
        if store.slot_path(META_SLOT).exists() {
            return Err(StoreError::AlreadyInitialized(store.dir));
        }
        fs::create_dir_all(&store.dir).map_err(io_err(&store.dir))?;
        let device_id = generate_device_id(&store.dir.to_string_lossy());
        store.write_metadata(&SyncMetadata::new(device_id))?;
        tracing::info!(dir = %store.dir.display(), "initialized local store");
        Ok(store)
    }

    /// Open an existing store.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = LocalStore { dir: dir.into() };
        if !store.slot_path(META_SLOT).exists() {
            return Err(StoreError::NotInitialized(store.dir));
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        self.dir.join(slot)
    }

    fn read_slot<T: DeserializeOwned>(&self, slot: &str) -> Result<Option<T>, StoreError> {
        let path = self.slot_path(slot);
        match fs::read_to_string(&path) {
            Ok(json) => from_json(&path, &json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    // Write to a sibling temp file and rename so a slot is never half-written.
    fn write_slot<T: Serialize>(&self, slot: &str, value: &T) -> Result<(), StoreError> {
        let path = self.slot_path(slot);
        let json = to_json(&path, value)?;
        let tmp = self.slot_path(&format!("{slot}.tmp"));
        fs::write(&tmp, json).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }

    fn remove_slot(&self, slot: &str) -> Result<(), StoreError> {
        let path = self.slot_path(slot);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    // --- Collections ---

    /// Never fails: a missing slot is an empty collection, and an unreadable
    /// one is logged and read as empty.
    pub fn load_collection(&self, kind: Kind) -> Collection {
        match self.read_slot::<Collection>(&collection_slot(kind)) {
            Ok(collection) => collection.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(%kind, error = %e, "unreadable collection, using empty");
                Collection::default()
            }
        }
    }

    /// Persist a collection and mark the store dirty.
    pub fn save_collection(&self, kind: Kind, collection: &Collection) -> Result<(), StoreError> {
        self.write_slot(&collection_slot(kind), collection)?;
        let mut meta = self.read_metadata()?;
        meta.dirty = true;
        meta.last_modified = Some(Utc::now());
        self.write_metadata(&meta)?;
        tracing::debug!(%kind, records = collection.len(), "saved collection locally");
        Ok(())
    }

    /// Replace all collections with the snapshot's, leaving sync metadata alone.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        for kind in Kind::ALL {
            self.write_slot(&collection_slot(kind), snapshot.collection(kind))?;
        }
        tracing::debug!(
            pabrik = snapshot.pabrik.len(),
            ongkos = snapshot.ongkos.len(),
            karyawan = snapshot.karyawan.len(),
            "applied snapshot locally"
        );
        Ok(())
    }

    /// Current local state stamped with the current time and this device's id.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let meta = self.read_metadata()?;
        let mut snapshot = Snapshot::new(Utc::now(), Some(meta.device_id));
        for kind in Kind::ALL {
            *snapshot.collection_mut(kind) = self.load_collection(kind);
        }
        Ok(snapshot)
    }

    // --- Metadata and config ---

    pub fn read_metadata(&self) -> Result<SyncMetadata, StoreError> {
        self.read_slot(META_SLOT)?
            .ok_or_else(|| StoreError::NotInitialized(self.dir.clone()))
    }

    pub fn write_metadata(&self, meta: &SyncMetadata) -> Result<(), StoreError> {
        self.write_slot(META_SLOT, meta)
    }

    pub fn read_config(&self) -> Result<Config, StoreError> {
        Ok(self.read_slot(CONFIG_SLOT)?.unwrap_or_default())
    }

    pub fn write_config(&self, config: &Config) -> Result<(), StoreError> {
        self.write_slot(CONFIG_SLOT, config)
    }

    // --- Backups ---

    /// Retain `snapshot`, evicting the oldest backups beyond `retention`.
    pub fn push_backup(&self, snapshot: &Snapshot, retention: usize) -> Result<(), StoreError> {
        let mut backups = self.backups();
        backups.push(self.make_backup(snapshot, BackupReason::BeforePush)?);
        if backups.len() > retention {
            let excess = backups.len() - retention;
            backups.drain(..excess);
        }
        self.write_slot(BACKUPS_SLOT, &backups)?;
        tracing::debug!(retained = backups.len(), "local backup created");
        Ok(())
    }

    /// Retained backups, oldest first.
    pub fn backups(&self) -> Vec<Backup> {
        match self.read_slot::<Vec<Backup>>(BACKUPS_SLOT) {
            Ok(backups) => backups.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable backup list, starting over");
                Vec::new()
            }
        }
    }

    pub fn write_failure_backup(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let backup = self.make_backup(snapshot, BackupReason::SyncFailure)?;
        self.write_slot(FAILURE_BACKUP_SLOT, &backup)?;
        tracing::warn!("failure backup written");
        Ok(())
    }

    pub fn failure_backup(&self) -> Result<Option<Backup>, StoreError> {
        self.read_slot(FAILURE_BACKUP_SLOT)
    }

    pub fn clear_failure_backup(&self) -> Result<(), StoreError> {
        self.remove_slot(FAILURE_BACKUP_SLOT)
    }

    fn make_backup(&self, snapshot: &Snapshot, reason: BackupReason) -> Result<Backup, StoreError> {
        Ok(Backup {
            data: snapshot.clone(),
            timestamp: Utc::now(),
            device_id: self.read_metadata()?.device_id,
            reason,
        })
    }

    // --- Record edits (all mark the store dirty) ---

    /// Next free integer id of a kind.
    pub fn next_id(&self, kind: Kind) -> i64 {
        self.load_collection(kind).max_int_id() + 1
    }

    /// Add a record, assigning the next integer id when it has none and
    /// stamping `created_at`/`updated_at`.
    pub fn insert_record(&self, kind: Kind, mut record: Record) -> Result<RecordId, StoreError> {
        if record.get("id").is_none() {
            record.set("id", self.next_id(kind));
        }
        let mut collection = self.load_collection(kind);
        let id = check_record(kind, &record)
            .map_err(|failure| StoreError::InvalidRecord(failure.to_string()))?;
        if collection.find(&id).is_some() {
            return Err(StoreError::DuplicateId { kind, id });
        }
        let now = Utc::now().to_rfc3339();
        if record.get("created_at").is_none() {
            record.set("created_at", now.clone());
        }
        record.set("updated_at", now);
        collection.push(record);
        self.save_collection(kind, &collection)?;
        Ok(id)
    }

    /// Overwrite the given fields of a record. The id cannot change.
    pub fn update_record(
        &self,
        kind: Kind,
        id: &RecordId,
        patch: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut collection = self.load_collection(kind);
        let record = collection
            .find_mut(id)
            .ok_or_else(|| StoreError::RecordNotFound {
                kind,
                id: id.clone(),
            })?;
        let mut updated = record.clone();
        for (field, value) in patch {
            if field != "id" {
                updated.set(field, value);
            }
        }
        updated.set("updated_at", Utc::now().to_rfc3339());
        check_record(kind, &updated)
            .map_err(|failure| StoreError::InvalidRecord(failure.to_string()))?;
        *record = updated;
        self.save_collection(kind, &collection)
    }

    pub fn remove_record(&self, kind: Kind, id: &RecordId) -> Result<Record, StoreError> {
        let mut collection = self.load_collection(kind);
        let removed = collection
            .remove(id)
            .ok_or_else(|| StoreError::RecordNotFound {
                kind,
                id: id.clone(),
            })?;
        self.save_collection(kind, &collection)?;
        Ok(removed)
    }

    // --- Export / import ---

    pub fn export_to(&self, path: &Path) -> Result<Snapshot, StoreError> {
        let snapshot = self.snapshot()?;
        let json = to_json(path, &snapshot)?;
        fs::write(path, json).map_err(io_err(path))?;
        Ok(snapshot)
    }

    /// Load collections from an exported file. Kinds absent from the file
    /// are left as they are.
    pub fn import_from(&self, path: &Path) -> Result<Snapshot, StoreError> {
        let json = fs::read_to_string(path).map_err(io_err(path))?;
        let value: Value = from_json(path, &json)?;
        let snapshot: Snapshot = from_json(path, &json)?;
        for kind in Kind::ALL {
            if value.get(kind.to_string()).is_some_and(|v| !v.is_null()) {
                self.save_collection(kind, snapshot.collection(kind))?;
            }
        }
        Ok(snapshot)
    }
}
