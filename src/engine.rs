use crate::model::*;
use crate::validate::validate_snapshot;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

/// How a pull decided between local and remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No remote document yet; local state is the only state.
    Adopted,
    /// Remote has not changed since this device last agreed with it.
    LocalCurrent,
    /// Remote is newer but holds the same records.
    IdenticalContent,
    /// Remote is newer, differs, and local has nothing unsynced.
    AutoAdoptRemote,
    /// Remote is newer, differs, and local has unsynced edits.
    Conflict,
}

impl Outcome {
    pub fn is_auto_resolved(self) -> bool {
        self != Outcome::Conflict
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Adopted => write!(f, "adopted local"),
            Outcome::LocalCurrent => write!(f, "local current"),
            Outcome::IdenticalContent => write!(f, "identical content"),
            Outcome::AutoAdoptRemote => write!(f, "adopted remote"),
            Outcome::Conflict => write!(f, "conflict"),
        }
    }
}

/// The user's answer to a [`Outcome::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    UseRemote,
    UseLocal,
    Merge,
    /// Keep local and dirty; the next save overwrites remote.
    Defer,
}

impl fmt::Display for ConflictChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictChoice::UseRemote => write!(f, "remote"),
            ConflictChoice::UseLocal => write!(f, "local"),
            ConflictChoice::Merge => write!(f, "merge"),
            ConflictChoice::Defer => write!(f, "defer"),
        }
    }
}

impl std::str::FromStr for ConflictChoice {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "remote" | "r" => Ok(ConflictChoice::UseRemote),
            "local" | "l" => Ok(ConflictChoice::UseLocal),
            "merge" | "m" => Ok(ConflictChoice::Merge),
            "defer" | "d" => Ok(ConflictChoice::Defer),
            _ => Err(format!(
                "unknown choice: {s} (valid: remote, local, merge, defer)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub outcome: Outcome,
    /// The state that stands after the decision. For a conflict this is the
    /// untouched local snapshot until a choice is made.
    pub result: Snapshot,
}

/// Decide between `remote` and `local` given this device's sync metadata.
pub fn reconcile(remote: Option<&Snapshot>, local: &Snapshot, meta: &SyncMetadata) -> Reconciliation {
    let Some(remote) = remote else {
        tracing::debug!("no remote document, local stands");
        return Reconciliation {
            outcome: Outcome::Adopted,
            result: local.clone(),
        };
    };

    if meta
        .last_sync_timestamp
        .is_some_and(|last| remote.last_updated <= last)
    {
        tracing::debug!(remote = %remote.last_updated, "remote not newer than last sync");
        return Reconciliation {
            outcome: Outcome::LocalCurrent,
            result: local.clone(),
        };
    }

    let (outcome, result) = if snapshots_identical(remote, local) {
        (Outcome::IdenticalContent, remote.clone())
    } else if !meta.dirty {
        (Outcome::AutoAdoptRemote, remote.clone())
    } else {
        (Outcome::Conflict, local.clone())
    };
    tracing::info!(%outcome, dirty = meta.dirty, remote = %remote.last_updated, "reconciled");
    Reconciliation { outcome, result }
}

/// What applying a conflict choice does to the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// New local collections, if they change.
    pub apply: Option<Snapshot>,
    /// Whether local ends up with unsynced changes.
    pub dirty: bool,
    /// Whether the result should be written to remote right away.
    pub push: bool,
}

pub fn resolve_conflict(choice: ConflictChoice, remote: &Snapshot, local: &Snapshot) -> Resolution {
    match choice {
        ConflictChoice::UseRemote => Resolution {
            apply: Some(remote.clone()),
            dirty: false,
            push: false,
        },
        ConflictChoice::UseLocal => Resolution {
            apply: None,
            dirty: true,
            push: true,
        },
        ConflictChoice::Merge => Resolution {
            apply: Some(merge_snapshots(remote, local, Utc::now())),
            dirty: true,
            push: true,
        },
        ConflictChoice::Defer => Resolution {
            apply: None,
            dirty: true,
            push: false,
        },
    }
}

fn canonical_key(record: &Record) -> (Option<RecordId>, String) {
    (
        record.id(),
        serde_json::to_string(record.as_value()).unwrap_or_default(),
    )
}

/// Order-insensitive equality of two collections.
pub fn collections_identical(a: &Collection, b: &Collection) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left: Vec<_> = a.iter().map(canonical_key).collect();
    let mut right: Vec<_> = b.iter().map(canonical_key).collect();
    left.sort();
    right.sort();
    left == right
}

pub fn snapshots_identical(a: &Snapshot, b: &Snapshot) -> bool {
    Kind::ALL
        .iter()
        .all(|&kind| collections_identical(a.collection(kind), b.collection(kind)))
}

/// Record-level last-writer-wins merge.
///
/// Every id present on either side appears once in the result. When both
/// sides hold an id, the record with the later `updated_at`/`created_at`
/// wins; ties keep the remote record. Records without an id are dropped.
/// The result is sorted by id.
pub fn merge_collections(kind: Kind, remote: &Collection, local: &Collection) -> Collection {
    let mut by_id: BTreeMap<RecordId, &Record> = BTreeMap::new();
    for record in remote.iter().chain(local.iter()) {
        let Some(id) = record.id() else {
            tracing::warn!(%kind, "record without id dropped during merge");
            continue;
        };
        match by_id.entry(id) {
            Entry::Vacant(e) => {
                e.insert(record);
            }
            Entry::Occupied(mut e) => {
                if record.modified_at() > e.get().modified_at() {
                    tracing::debug!(%kind, id = %e.key(), "newer version wins");
                    e.insert(record);
                }
            }
        }
    }
    by_id.into_values().cloned().collect()
}

/// Merge two snapshots collection by collection. The result carries the
/// local device id and is stamped `now`.
pub fn merge_snapshots(remote: &Snapshot, local: &Snapshot, now: DateTime<Utc>) -> Snapshot {
    let mut merged = Snapshot::new(now, local.device_id.clone());
    merged.merged_at = Some(now);
    for kind in Kind::ALL {
        *merged.collection_mut(kind) =
            merge_collections(kind, remote.collection(kind), local.collection(kind));
    }
    tracing::info!(
        pabrik = merged.pabrik.len(),
        ongkos = merged.ongkos.len(),
        karyawan = merged.karyawan.len(),
        "merged remote and local"
    );
    merged
}

/// Merge then revalidate, as done before every write that follows a conflict.
pub fn merge_for_upload(remote: &Snapshot, local: &Snapshot, now: DateTime<Utc>) -> Snapshot {
    validate_snapshot(&merge_snapshots(remote, local, now)).0
}

/// Fold an uploaded document back into local data. Local records the upload
/// left out stay, including invalid ones and ones without an id; records
/// edited locally since the upload win by their later timestamp.
pub fn merge_into_local(uploaded: &Snapshot, local: &Snapshot) -> Snapshot {
    let mut result = uploaded.clone();
    result.device_id = local.device_id.clone();
    for kind in Kind::ALL {
        let (with_id, without_id): (Vec<&Record>, Vec<&Record>) =
            local.collection(kind).iter().partition(|r| r.id().is_some());
        let with_id: Collection = with_id.into_iter().cloned().collect();
        let mut merged = merge_collections(kind, uploaded.collection(kind), &with_id);
        for record in without_id {
            merged.push(record.clone());
        }
        *result.collection_mut(kind) = merged;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn coll(values: Vec<Value>) -> Collection {
        values.into_iter().map(record).collect()
    }

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn snap(updated: &str, pabrik: Vec<Value>) -> Snapshot {
        Snapshot::new(ts(updated), Some("device_test".to_string()))
            .with_collection(Kind::Factory, coll(pabrik))
    }

    fn meta(dirty: bool, last_sync: Option<&str>) -> SyncMetadata {
        let mut m = SyncMetadata::new("device_test".to_string());
        m.dirty = dirty;
        m.last_sync_timestamp = last_sync.map(ts);
        m
    }

    fn ids(c: &Collection) -> Vec<RecordId> {
        c.iter().map(|r| r.id().unwrap()).collect()
    }

    // --- merge_collections ---

    #[test]
    fn disjoint_ids_union_sorted() {
        let remote = coll(vec![json!({"id": 5, "nama": "E"}), json!({"id": 1, "nama": "A"})]);
        let local = coll(vec![json!({"id": 3, "nama": "C"}), json!({"id": "x", "nama": "X"})]);
        let merged = merge_collections(Kind::Factory, &remote, &local);
        assert_eq!(
            ids(&merged),
            vec![
                RecordId::Int(1),
                RecordId::Int(3),
                RecordId::Int(5),
                RecordId::Str("x".to_string())
            ]
        );
    }

    #[test]
    fn later_timestamp_wins() {
        let remote = coll(vec![json!({"id": 1, "nama": "old", "updated_at": "2024-01-01T00:00:00Z"})]);
        let local = coll(vec![json!({"id": 1, "nama": "new", "updated_at": "2024-01-02T00:00:00Z"})]);
        let merged = merge_collections(Kind::Factory, &remote, &local);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records()[0].get("nama"), Some(&json!("new")));

        // Same again with sides swapped
        let merged = merge_collections(Kind::Factory, &local, &remote);
        assert_eq!(merged.records()[0].get("nama"), Some(&json!("new")));
    }

    #[test]
    fn created_at_counts_when_updated_at_missing() {
        let remote = coll(vec![json!({"id": 1, "nama": "r", "updated_at": "2024-01-01"})]);
        let local = coll(vec![json!({"id": 1, "nama": "l", "created_at": "2024-02-01"})]);
        let merged = merge_collections(Kind::Factory, &remote, &local);
        assert_eq!(merged.records()[0].get("nama"), Some(&json!("l")));
    }

    #[test]
    fn untimestamped_record_loses() {
        let remote = coll(vec![json!({"id": 1, "nama": "bare"})]);
        let local = coll(vec![json!({"id": 1, "nama": "stamped", "created_at": "1999-01-01"})]);
        let merged = merge_collections(Kind::Factory, &remote, &local);
        assert_eq!(merged.records()[0].get("nama"), Some(&json!("stamped")));

        let merged = merge_collections(Kind::Factory, &local, &remote);
        assert_eq!(merged.records()[0].get("nama"), Some(&json!("stamped")));
    }

    #[test]
    fn tie_keeps_remote() {
        let remote = coll(vec![json!({"id": 1, "nama": "remote"})]);
        let local = coll(vec![json!({"id": 1, "nama": "local"})]);
        let merged = merge_collections(Kind::Factory, &remote, &local);
        assert_eq!(merged.records()[0].get("nama"), Some(&json!("remote")));
    }

    #[test]
    fn idless_records_dropped() {
        let remote = coll(vec![json!({"nama": "ghost"}), json!({"id": 2, "nama": "B"})]);
        let local = coll(vec![json!({"id": 0, "nama": "zero"}), json!({"id": 2, "nama": "B"})]);
        let merged = merge_collections(Kind::Factory, &remote, &local);
        assert_eq!(ids(&merged), vec![RecordId::Int(2)]);
        assert!(merged.iter().all(|r| r.id().is_some()));
    }

    #[test]
    fn merge_is_idempotent() {
        let a = coll(vec![
            json!({"id": 1, "nama": "a1", "updated_at": "2024-01-03"}),
            json!({"id": 2, "nama": "a2"}),
            json!({"id": 4, "nama": "a4", "updated_at": "2024-01-01"}),
        ]);
        let b = coll(vec![
            json!({"id": 1, "nama": "b1", "updated_at": "2024-01-02"}),
            json!({"id": 2, "nama": "b2", "updated_at": "2024-01-01"}),
            json!({"id": 3, "nama": "b3"}),
            json!({"id": 4, "nama": "b4", "updated_at": "2024-01-01"}),
        ]);
        let once = merge_collections(Kind::Factory, &a, &b);
        let twice = merge_collections(Kind::Factory, &once, &b);
        assert_eq!(twice, once);
        let names: Vec<_> = once.iter().map(|r| r.get("nama").unwrap().clone()).collect();
        assert_eq!(names, vec![json!("a1"), json!("b2"), json!("b3"), json!("a4")]);
    }

    #[test]
    fn duplicate_ids_within_one_side_collapse() {
        let remote = Collection::default();
        let local = coll(vec![
            json!({"id": 1, "nama": "first", "updated_at": "2024-01-01"}),
            json!({"id": 1, "nama": "second", "updated_at": "2024-01-05"}),
        ]);
        let merged = merge_collections(Kind::Factory, &remote, &local);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records()[0].get("nama"), Some(&json!("second")));
    }

    // --- equality ---

    #[test]
    fn identical_regardless_of_order() {
        let a = coll(vec![json!({"id": 1, "nama": "A"}), json!({"id": 2, "nama": "B"})]);
        let b = coll(vec![json!({"nama": "B", "id": 2}), json!({"id": 1, "nama": "A"})]);
        assert!(collections_identical(&a, &b));
        let c = coll(vec![json!({"id": 1, "nama": "A"}), json!({"id": 2, "nama": "b"})]);
        assert!(!collections_identical(&a, &c));
        let d = coll(vec![json!({"id": 1, "nama": "A"})]);
        assert!(!collections_identical(&a, &d));
    }

    #[test]
    fn identical_with_idless_records() {
        let a = coll(vec![json!({"nama": "x"}), json!({"nama": "y"}), json!({"id": 1, "nama": "A"})]);
        let b = coll(vec![json!({"id": 1, "nama": "A"}), json!({"nama": "y"}), json!({"nama": "x"})]);
        assert!(collections_identical(&a, &b));
    }

    #[test]
    fn snapshot_identity_ignores_metadata() {
        let a = snap("2024-01-01", vec![json!({"id": 1, "nama": "A"})]);
        let mut b = snap("2024-06-01", vec![json!({"id": 1, "nama": "A"})]);
        b.device_id = Some("device_other".to_string());
        assert!(snapshots_identical(&a, &b));
        let c = b.clone().with_collection(Kind::Employee, coll(vec![json!({"id": 1, "nama": "S", "nomor": "1"})]));
        assert!(!snapshots_identical(&a, &c));
    }

    // --- reconcile ---

    #[test]
    fn absent_remote_adopts_local() {
        let local = snap("2024-01-01", vec![json!({"id": 1, "nama": "A"})]);
        let rec = reconcile(None, &local, &meta(true, None));
        assert_eq!(rec.outcome, Outcome::Adopted);
        assert_eq!(rec.result, local);
    }

    #[test]
    fn stale_remote_is_local_current() {
        let remote = snap("2024-01-01T00:00:00Z", vec![json!({"id": 1, "nama": "R"})]);
        let local = snap("2024-03-01", vec![json!({"id": 1, "nama": "L"})]);
        for dirty in [false, true] {
            let rec = reconcile(Some(&remote), &local, &meta(dirty, Some("2024-01-01T00:00:00Z")));
            assert_eq!(rec.outcome, Outcome::LocalCurrent);
            assert_eq!(rec.result, local);
        }
    }

    #[test]
    fn newer_identical_remote() {
        let remote = snap("2024-02-01", vec![json!({"id": 1, "nama": "A"})]);
        let local = snap("2024-01-01", vec![json!({"id": 1, "nama": "A"})]);
        let rec = reconcile(Some(&remote), &local, &meta(false, Some("2024-01-01")));
        assert_eq!(rec.outcome, Outcome::IdenticalContent);
    }

    #[test]
    fn newer_different_remote_clean_local_auto_adopts() {
        let remote = snap("2024-02-01", vec![json!({"id": 1, "nama": "B"})]);
        let local = snap("2024-01-01", vec![json!({"id": 1, "nama": "A"})]);
        let rec = reconcile(Some(&remote), &local, &meta(false, Some("2024-01-01")));
        assert_eq!(rec.outcome, Outcome::AutoAdoptRemote);
        assert_eq!(rec.result, remote);
    }

    #[test]
    fn newer_different_remote_dirty_local_conflicts() {
        let remote = snap("2024-02-01", vec![json!({"id": 1, "nama": "B", "updated_at": "2024-01-02"})]);
        let local = snap("2024-01-01", vec![json!({"id": 1, "nama": "A"})]);
        let rec = reconcile(Some(&remote), &local, &meta(true, None));
        assert_eq!(rec.outcome, Outcome::Conflict);
        assert!(!rec.outcome.is_auto_resolved());
        assert_eq!(rec.result, local);

        let resolution = resolve_conflict(ConflictChoice::UseRemote, &remote, &rec.result);
        let applied = resolution.apply.unwrap();
        assert_eq!(applied.pabrik.records()[0].get("nama"), Some(&json!("B")));
        assert!(!resolution.dirty);
        assert!(!resolution.push);
    }

    #[test]
    fn never_synced_counts_remote_as_newer() {
        let remote = snap("1970-01-01", vec![json!({"id": 1, "nama": "B"})]);
        let local = snap("2024-01-01", vec![]);
        let rec = reconcile(Some(&remote), &local, &meta(false, None));
        assert_eq!(rec.outcome, Outcome::AutoAdoptRemote);
    }

    #[test]
    fn resolution_choices() {
        let remote = snap("2024-02-01", vec![json!({"id": 1, "nama": "R", "updated_at": "2024-02-01"})]);
        let local = snap("2024-01-01", vec![json!({"id": 2, "nama": "L"})]);

        let local_choice = resolve_conflict(ConflictChoice::UseLocal, &remote, &local);
        assert_eq!(local_choice.apply, None);
        assert!(local_choice.dirty && local_choice.push);

        let defer = resolve_conflict(ConflictChoice::Defer, &remote, &local);
        assert_eq!(defer.apply, None);
        assert!(defer.dirty && !defer.push);

        let merge = resolve_conflict(ConflictChoice::Merge, &remote, &local);
        let merged = merge.apply.unwrap();
        assert_eq!(ids(&merged.pabrik), vec![RecordId::Int(1), RecordId::Int(2)]);
        assert!(merged.merged_at.is_some());
        assert_eq!(merged.device_id, local.device_id);
        assert!(merge.dirty && merge.push);
    }

    #[test]
    fn merge_for_upload_drops_invalid() {
        let remote = snap("2024-02-01", vec![json!({"id": 1})]);
        let local = snap("2024-01-01", vec![json!({"id": 2, "nama": "ok"})]);
        let merged = merge_for_upload(&remote, &local, Utc::now());
        assert_eq!(ids(&merged.pabrik), vec![RecordId::Int(2)]);
    }

    #[test]
    fn merge_into_local_keeps_records_left_out_of_upload() {
        let uploaded = snap(
            "2024-02-01",
            vec![
                json!({"id": 1, "nama": "A", "updated_at": "2024-01-01"}),
                json!({"id": 2, "nama": "Remote"}),
            ],
        );
        let local = snap(
            "2024-01-01",
            vec![
                json!({"id": 1, "nama": "A2", "updated_at": "2024-03-01"}),
                json!({"id": 9}),
                json!({"nama": "no id"}),
            ],
        );
        let merged = merge_into_local(&uploaded, &local);
        let kept: Vec<Option<RecordId>> = merged.pabrik.iter().map(Record::id).collect();
        assert_eq!(
            kept,
            vec![Some(RecordId::Int(1)), Some(RecordId::Int(2)), Some(RecordId::Int(9)), None]
        );
        assert_eq!(merged.pabrik.records()[0].get("nama"), Some(&json!("A2")));
        assert_eq!(merged.pabrik.records()[3].get("nama"), Some(&json!("no id")));
    }

    #[test]
    fn conflict_choice_from_str() {
        assert_eq!("remote".parse::<ConflictChoice>().unwrap(), ConflictChoice::UseRemote);
        assert_eq!("L".parse::<ConflictChoice>().unwrap(), ConflictChoice::UseLocal);
        assert_eq!(" merge\n".parse::<ConflictChoice>().unwrap(), ConflictChoice::Merge);
        assert_eq!("d".parse::<ConflictChoice>().unwrap(), ConflictChoice::Defer);
        assert!("both".parse::<ConflictChoice>().is_err());
    }
}
