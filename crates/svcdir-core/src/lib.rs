//! Core domain model for the service-directory ingest pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "svcdir-core";

/// Days of the week, numbered 1 (Monday) through 7 (Sunday) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Wraps past the end of the week.
    pub fn from_index(index: usize) -> Weekday {
        Self::ALL[index % 7]
    }

    pub fn number(self) -> u8 {
        self as u8 + 1
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Weekday::Monday => "Monday",
            Weekday::Tuesday => "Tuesday",
            Weekday::Wednesday => "Wednesday",
            Weekday::Thursday => "Thursday",
            Weekday::Friday => "Friday",
            Weekday::Saturday => "Saturday",
            Weekday::Sunday => "Sunday",
        };
        f.write_str(name)
    }
}

/// One opening window on one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub weekday: Weekday,
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phone {
    pub number: String,
    pub extension: Option<String>,
}

impl Phone {
    /// Formatting-independent comparison key.
    pub fn digits(&self) -> String {
        self.number.chars().filter(|c| c.is_ascii_digit()).collect()
    }

    pub fn same_number(&self, other: &Phone) -> bool {
        self.digits() == other.digits()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub state: String,
    pub country: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// Tri-state open/closed status. `Unknown` is distinct from `Open` and must
/// never be collapsed into an explicit negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenStatus {
    Open,
    Closed,
    #[default]
    Unknown,
}

impl OpenStatus {
    pub fn is_known(self) -> bool {
        !matches!(self, OpenStatus::Unknown)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, OpenStatus::Closed)
    }
}

/// Node of the canonical service taxonomy tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<TaxonomyNode>,
}

/// Normalized output of one raw input row. Immutable once produced;
/// regenerated fresh on every run and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_id: String,
    pub last_updated: DateTime<Utc>,
    pub organization_name: String,
    pub url: Option<String>,
    pub address: Address,
    pub position: Option<Position>,
    pub phones: Vec<Phone>,
    /// Free-text facility-type label as it appeared in the source.
    pub taxonomy_label: String,
    pub taxonomy_id: String,
    /// Canonical taxonomy name; doubles as the service name.
    pub service_name: String,
    pub status: OpenStatus,
    pub schedule: Vec<ScheduleEntry>,
    pub advisory_note: Option<String>,
    pub id_required: Option<bool>,
}

/// Logical field groups tracked per entity for recency decisions. Groups are
/// updated atomically: status and hours always move together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    StatusHours,
    AdvisoryNote,
    IdRequired,
    Phones,
    Url,
}

/// Timestamp and origin of the most recent write to a field group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProvenance {
    pub last_updated: DateTime<Utc>,
    pub source: String,
}

/// Per-field-group write history, owned and persisted by the target store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    #[serde(default)]
    pub field_groups: BTreeMap<FieldGroup, FieldProvenance>,
}

impl EntityMetadata {
    pub fn last_updated(&self, group: FieldGroup) -> Option<DateTime<Utc>> {
        self.field_groups.get(&group).map(|p| p.last_updated)
    }

    pub fn record(&mut self, group: FieldGroup, provenance: FieldProvenance) {
        self.field_groups.insert(group, provenance);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub taxonomy_ids: Vec<String>,
    #[serde(default)]
    pub status: OpenStatus,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
    #[serde(default)]
    pub phones: Vec<Phone>,
    pub advisory_note: Option<String>,
    pub id_required: Option<bool>,
    #[serde(default)]
    pub metadata: EntityMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub organization: Organization,
    pub name: Option<String>,
    pub address: Option<Address>,
    pub position: Option<Position>,
    #[serde(default)]
    pub phones: Vec<Phone>,
    pub url: Option<String>,
    pub advisory_note: Option<String>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub metadata: EntityMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLocation {
    pub organization_id: Uuid,
    pub name: Option<String>,
    pub address: Address,
    pub position: Option<Position>,
    pub phones: Vec<Phone>,
    pub url: Option<String>,
    pub advisory_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewService {
    pub location_id: Uuid,
    pub name: String,
    pub taxonomy_id: String,
    pub status: OpenStatus,
    pub schedule: Vec<ScheduleEntry>,
    pub advisory_note: Option<String>,
    pub id_required: Option<bool>,
}

/// Field-level update set for a matched location. Empty fields are left
/// untouched by the target store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationPatch {
    pub url: Option<String>,
    pub advisory_note: Option<String>,
    #[serde(default)]
    pub add_phones: Vec<Phone>,
}

impl LocationPatch {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.advisory_note.is_none() && self.add_phones.is_empty()
    }
}

/// Field-level update set for a matched service. `status`/`schedule` are set
/// together or not at all; `Some(vec![])` clears the stored hours.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePatch {
    pub status: Option<OpenStatus>,
    pub schedule: Option<Vec<ScheduleEntry>>,
    pub advisory_note: Option<String>,
    pub id_required: Option<bool>,
}

impl ServicePatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.schedule.is_none()
            && self.advisory_note.is_none()
            && self.id_required.is_none()
    }
}
