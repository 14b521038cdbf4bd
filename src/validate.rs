use crate::model::{Collection, Kind, Record, RecordId, Snapshot};
use std::collections::HashSet;
use std::fmt;

/// Why a record was left out of an outgoing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    MissingId {
        kind: Kind,
    },
    MissingField {
        kind: Kind,
        id: RecordId,
        field: &'static str,
    },
    DuplicateId {
        kind: Kind,
        id: RecordId,
    },
}

impl ValidationFailure {
    pub fn kind(&self) -> Kind {
        match self {
            ValidationFailure::MissingId { kind }
            | ValidationFailure::MissingField { kind, .. }
            | ValidationFailure::DuplicateId { kind, .. } => *kind,
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::MissingId { kind } => write!(f, "{kind} record without id"),
            ValidationFailure::MissingField { kind, id, field } => {
                write!(f, "{kind} record {id} is missing '{field}'")
            }
            ValidationFailure::DuplicateId { kind, id } => {
                write!(f, "{kind} record {id} appears more than once")
            }
        }
    }
}

/// Check one record against its kind's required fields.
pub fn check_record(kind: Kind, record: &Record) -> Result<RecordId, ValidationFailure> {
    let id = record.id().ok_or(ValidationFailure::MissingId { kind })?;
    if let Some(field) = kind
        .required_fields()
        .iter()
        .copied()
        .find(|field| !record.has_field(field))
    {
        return Err(ValidationFailure::MissingField { kind, id, field });
    }
    Ok(id)
}

/// Keep the valid records of `collection` in their original order. Only the
/// first record with a given id is kept.
pub fn validate_collection(kind: Kind, collection: &Collection) -> (Collection, Vec<ValidationFailure>) {
    let mut seen: HashSet<RecordId> = HashSet::new();
    let mut failures = Vec::new();
    let mut kept = Vec::with_capacity(collection.len());

    for record in collection.iter() {
        match check_record(kind, record) {
            Ok(id) if seen.insert(id.clone()) => kept.push(record.clone()),
            Ok(id) => failures.push(ValidationFailure::DuplicateId { kind, id }),
            Err(failure) => failures.push(failure),
        }
    }

    for failure in &failures {
        tracing::warn!(%failure, "record removed before upload");
    }
    (Collection::new(kept), failures)
}

/// Revalidate every collection of a snapshot before it leaves the device.
pub fn validate_snapshot(snapshot: &Snapshot) -> (Snapshot, Vec<ValidationFailure>) {
    let mut validated = snapshot.clone();
    let mut failures = Vec::new();
    for kind in Kind::ALL {
        let (collection, mut dropped) = validate_collection(kind, snapshot.collection(kind));
        *validated.collection_mut(kind) = collection;
        failures.append(&mut dropped);
    }
    if !failures.is_empty() {
        tracing::info!(dropped = failures.len(), "snapshot validated");
    }
    (validated, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::epoch;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn factory_requires_nama() {
        assert_eq!(
            check_record(Kind::Factory, &record(json!({"id": 1, "nama": "PT Sinar"}))),
            Ok(RecordId::Int(1))
        );
        assert_eq!(
            check_record(Kind::Factory, &record(json!({"id": 1}))),
            Err(ValidationFailure::MissingField {
                kind: Kind::Factory,
                id: RecordId::Int(1),
                field: "nama"
            })
        );
    }

    #[test]
    fn cost_rate_requires_proses_and_jenis() {
        let ok = record(json!({"id": 2, "proses": "tenun", "jenis": "kain"}));
        assert!(check_record(Kind::CostRate, &ok).is_ok());
        let missing = record(json!({"id": 2, "proses": "tenun"}));
        assert!(matches!(
            check_record(Kind::CostRate, &missing),
            Err(ValidationFailure::MissingField { field: "jenis", .. })
        ));
    }

    #[test]
    fn employee_requires_nama_and_nomor() {
        let missing = record(json!({"id": "k1", "nama": "Sari", "nomor": ""}));
        assert!(matches!(
            check_record(Kind::Employee, &missing),
            Err(ValidationFailure::MissingField { field: "nomor", .. })
        ));
    }

    #[test]
    fn missing_id_is_invalid_for_every_kind() {
        for kind in Kind::ALL {
            let r = record(json!({"nama": "x", "proses": "x", "jenis": "x", "nomor": "1"}));
            assert_eq!(check_record(kind, &r), Err(ValidationFailure::MissingId { kind }));
        }
    }

    #[test]
    fn validate_collection_filters_and_keeps_order() {
        let coll = Collection::new(vec![
            record(json!({"id": 3, "nama": "C"})),
            record(json!({"nama": "no id"})),
            record(json!({"id": 1, "nama": "A"})),
            record(json!({"id": 2})),
            record(json!({"id": 3, "nama": "C again"})),
        ]);
        let (kept, failures) = validate_collection(Kind::Factory, &coll);
        let ids: Vec<_> = kept.iter().map(|r| r.id().unwrap()).collect();
        assert_eq!(ids, vec![RecordId::Int(3), RecordId::Int(1)]);
        assert_eq!(failures.len(), 3);
        assert_eq!(
            failures[2],
            ValidationFailure::DuplicateId {
                kind: Kind::Factory,
                id: RecordId::Int(3)
            }
        );
    }

    #[test]
    fn validate_snapshot_covers_all_collections() {
        let snap = Snapshot::new(epoch(), None)
            .with_collection(
                Kind::Factory,
                Collection::new(vec![record(json!({"id": 1, "nama": "A"}))]),
            )
            .with_collection(
                Kind::CostRate,
                Collection::new(vec![record(json!({"id": 1, "proses": "x"}))]),
            )
            .with_collection(
                Kind::Employee,
                Collection::new(vec![record(json!({"nama": "B", "nomor": "7"}))]),
            );
        let (validated, failures) = validate_snapshot(&snap);
        assert_eq!(validated.pabrik.len(), 1);
        assert!(validated.ongkos.is_empty());
        assert!(validated.karyawan.is_empty());
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].kind(), Kind::CostRate);
        assert_eq!(failures[1].kind(), Kind::Employee);
    }
}
