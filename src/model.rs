use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Schema tag written into every snapshot.
pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Factory,
    CostRate,
    Employee,
}

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Factory, Kind::CostRate, Kind::Employee];

    /// Fields that must be present and non-empty for a record of this kind.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Kind::Factory => &["nama"],
            Kind::CostRate => &["proses", "jenis"],
            Kind::Employee => &["nama", "nomor"],
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Factory => write!(f, "pabrik"),
            Kind::CostRate => write!(f, "ongkos"),
            Kind::Employee => write!(f, "karyawan"),
        }
    }
}

impl std::str::FromStr for Kind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pabrik" | "factory" => Ok(Kind::Factory),
            "ongkos" | "cost-rate" | "cost_rate" | "costrate" => Ok(Kind::CostRate),
            "karyawan" | "employee" => Ok(Kind::Employee),
            _ => Err(format!(
                "unknown record kind: {s} (valid: pabrik, ongkos, karyawan)"
            )),
        }
    }
}

/// Identity of a record within its kind. Integer ids sort before string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl RecordId {
    /// Read an id from a JSON value. Zero, empty strings, null and
    /// fractional numbers do not count as an id.
    pub fn from_value(value: &Value) -> Option<RecordId> {
        match value {
            Value::Number(n) => {
                let int = n.as_i64().or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })?;
                (int != 0).then_some(RecordId::Int(int))
            }
            Value::String(s) if !s.is_empty() => Some(RecordId::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Int(n) => Value::from(*n),
            RecordId::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (RecordId::Int(a), RecordId::Int(b)) => a.cmp(b),
            (RecordId::Int(_), RecordId::Str(_)) => Ordering::Less,
            (RecordId::Str(_), RecordId::Int(_)) => Ordering::Greater,
            (RecordId::Str(a), RecordId::Str(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{n}"),
            RecordId::Str(s) => write!(f, "{s}"),
        }
    }
}

impl std::str::FromStr for RecordId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("record id cannot be empty".to_string());
        }
        Ok(match s.parse::<i64>() {
            Ok(0) => return Err("record id cannot be 0".to_string()),
            Ok(n) => RecordId::Int(n),
            Err(_) => RecordId::Str(s.to_string()),
        })
    }
}

/// One factory, cost rate or employee entry. Kept as open JSON so fields the
/// engine does not know about survive a round trip untouched.
///
/// An entry that is not a JSON object is carried verbatim: it has no id, so
/// it is never uploaded or merged, but saving the collection writes it back
/// as it was read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record(Value);

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        if !value.is_object() {
            tracing::warn!(%value, "non-object record kept as is");
        }
        Ok(Record(value))
    }
}

impl Default for Record {
    fn default() -> Self {
        Record(Value::Object(Map::new()))
    }
}

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Record(Value::Object(fields))
    }

    pub fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(map) => Ok(Record::new(map)),
            other => Err(format!("record must be a JSON object, got {other}")),
        }
    }

    pub fn id(&self) -> Option<RecordId> {
        self.0.get("id").and_then(RecordId::from_value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// No effect on a non-object entry.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        if let Value::Object(map) = &mut self.0 {
            map.insert(field.into(), value.into());
        }
    }

    /// The record's fields, or `None` for a non-object entry.
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// True when the field exists and is not null, false or an empty string.
    pub fn has_field(&self, field: &str) -> bool {
        match self.0.get(field) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// Later of `updated_at` and `created_at`; a record with neither (or with
    /// unparseable values) reports the epoch.
    pub fn modified_at(&self) -> DateTime<Utc> {
        let updated = self.0.get("updated_at").and_then(timestamp_of);
        let created = self.0.get("created_at").and_then(timestamp_of);
        updated.max(created).unwrap_or_else(epoch)
    }
}

/// Ordered records of a single kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection {
    records: Vec<Record>,
}

impl Collection {
    pub fn new(records: Vec<Record>) -> Self {
        Collection { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn find(&self, id: &RecordId) -> Option<&Record> {
        self.records.iter().find(|r| r.id().as_ref() == Some(id))
    }

    pub fn find_mut(&mut self, id: &RecordId) -> Option<&mut Record> {
        self.records.iter_mut().find(|r| r.id().as_ref() == Some(id))
    }

    /// Remove the record with `id`, returning it if present.
    pub fn remove(&mut self, id: &RecordId) -> Option<Record> {
        let pos = self
            .records
            .iter()
            .position(|r| r.id().as_ref() == Some(id))?;
        Some(self.records.remove(pos))
    }

    /// Largest integer id in the collection, 0 when there is none.
    pub fn max_int_id(&self) -> i64 {
        self.records
            .iter()
            .filter_map(|r| match r.id() {
                Some(RecordId::Int(n)) => Some(n),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }
}

impl FromIterator<Record> for Collection {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Collection::new(iter.into_iter().collect())
    }
}

/// Full application state as exchanged with the remote document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, deserialize_with = "nullable_collection")]
    pub pabrik: Collection,
    #[serde(default, deserialize_with = "nullable_collection")]
    pub ongkos: Collection,
    #[serde(default, deserialize_with = "nullable_collection")]
    pub karyawan: Collection,
    #[serde(default = "epoch", deserialize_with = "lenient_timestamp")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Snapshot {
    pub fn new(last_updated: DateTime<Utc>, device_id: Option<String>) -> Self {
        Snapshot {
            pabrik: Collection::default(),
            ongkos: Collection::default(),
            karyawan: Collection::default(),
            last_updated,
            merged_at: None,
            device_id,
            version: default_version(),
        }
    }

    pub fn collection(&self, kind: Kind) -> &Collection {
        match kind {
            Kind::Factory => &self.pabrik,
            Kind::CostRate => &self.ongkos,
            Kind::Employee => &self.karyawan,
        }
    }

    pub fn collection_mut(&mut self, kind: Kind) -> &mut Collection {
        match kind {
            Kind::Factory => &mut self.pabrik,
            Kind::CostRate => &mut self.ongkos,
            Kind::Employee => &mut self.karyawan,
        }
    }

    pub fn with_collection(mut self, kind: Kind, collection: Collection) -> Self {
        *self.collection_mut(kind) = collection;
        self
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            pabrik: self.pabrik.len(),
            ongkos: self.ongkos.len(),
            karyawan: self.karyawan.len(),
            last_updated: self.last_updated,
            device_id: self.device_id.clone(),
        }
    }
}

/// What a conflict prompt shows about each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub pabrik: usize,
    pub ongkos: usize,
    pub karyawan: usize,
    pub last_updated: DateTime<Utc>,
    pub device_id: Option<String>,
}

impl fmt::Display for SnapshotSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pabrik, {} ongkos, {} karyawan (updated {}",
            self.pabrik,
            self.ongkos,
            self.karyawan,
            self.last_updated.format("%Y-%m-%d %H:%M")
        )?;
        if let Some(ref device) = self.device_id {
            write!(f, " by {device}")?;
        }
        write!(f, ")")
    }
}

/// Per-device sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub device_id: String,
    #[serde(default)]
    pub dirty: bool,
    /// `lastUpdated` of the remote document this device last agreed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Wall-clock time of the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_token: Option<String>,
}

impl SyncMetadata {
    pub fn new(device_id: String) -> Self {
        SyncMetadata {
            device_id,
            dirty: false,
            last_sync_timestamp: None,
            last_sync_at: None,
            last_modified: None,
            version_token: None,
        }
    }

    /// Record agreement with the remote document `remote_updated` at `token`.
    pub fn mark_synced(&mut self, remote_updated: DateTime<Utc>, token: Option<String>) {
        self.dirty = false;
        self.last_sync_timestamp = Some(remote_updated);
        self.last_sync_at = Some(Utc::now());
        if token.is_some() {
            self.version_token = token;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    BeforePush,
    SyncFailure,
}

/// A retained snapshot kept on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub data: Snapshot,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    #[serde(rename = "type")]
    pub reason: BackupReason,
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

fn default_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Parse the timestamp formats seen in stored records: RFC 3339, naive
/// date-times, bare dates and epoch milliseconds.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn nullable_collection<'de, D>(deserializer: D) -> Result<Collection, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Collection>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(timestamp_of).unwrap_or_else(epoch))
}
