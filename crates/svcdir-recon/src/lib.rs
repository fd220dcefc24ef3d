//! Entity matching, merge policy, and the sequential reconciliation driver.
//!
//! The driver walks each candidate record through normalize -> match ->
//! (create | update | no-op), flushing the match-memory after every record so
//! an interrupted run loses at most the record in flight. Any failure inside
//! one record skips that record and the run continues; only a match-memory
//! persistence failure aborts the whole run.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{info, warn};
use uuid::Uuid;

use svcdir_core::{
    CandidateRecord, FieldGroup, FieldProvenance, Location, LocationPatch, NewLocation,
    NewOrganization, NewService, OpenStatus, Phone, ScheduleEntry, Service, ServicePatch,
};
use svcdir_normalize::{prefilter_rows, NormalizerConfig, RawRecord, RecordNormalizer, TaxonomyMapping};
use svcdir_storage::{
    DirectoryApi, GeolocationResolver, MatchMemory, MatchMemoryEntry, MemoryError,
};

pub const CRATE_NAME: &str = "svcdir-recon";

/// Human answer to a conflict between two advisory notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteResolution {
    KeepExisting,
    ReplaceWithNew,
    Concatenate,
}

/// Synchronous human tie-break channel. The driver blocks on these calls;
/// a non-interactive deployment swaps in [`AutoSkipDisambiguator`].
#[async_trait]
pub trait Disambiguator: Send + Sync {
    /// Index into `options`, or `None` for "none of these".
    async fn choose_location(
        &self,
        candidate: &CandidateRecord,
        options: &[Location],
    ) -> Result<Option<usize>>;

    async fn choose_service(
        &self,
        candidate: &CandidateRecord,
        options: &[Service],
    ) -> Result<Option<usize>>;

    async fn resolve_note_conflict(
        &self,
        entity_name: &str,
        existing: &str,
        incoming: &str,
    ) -> Result<NoteResolution>;
}

/// Never claims a match and never overwrites a note.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoSkipDisambiguator;

#[async_trait]
impl Disambiguator for AutoSkipDisambiguator {
    async fn choose_location(
        &self,
        _candidate: &CandidateRecord,
        _options: &[Location],
    ) -> Result<Option<usize>> {
        Ok(None)
    }

    async fn choose_service(
        &self,
        _candidate: &CandidateRecord,
        _options: &[Service],
    ) -> Result<Option<usize>> {
        Ok(None)
    }

    async fn resolve_note_conflict(
        &self,
        _entity_name: &str,
        _existing: &str,
        _incoming: &str,
    ) -> Result<NoteResolution> {
        Ok(NoteResolution::KeepExisting)
    }
}

/// Previously-imported entities a candidate resolves to. Both absent is a
/// valid terminal outcome and means "create fresh".
#[derive(Debug, Default)]
pub struct ExistingRecords {
    pub location: Option<Location>,
    pub service: Option<Service>,
}

/// Resolves a candidate against the target store using the match-memory,
/// radius + name queries, and the human channel as a last resort.
pub struct EntityMatcher {
    match_radius: f64,
}

impl EntityMatcher {
    pub fn new(match_radius: f64) -> Self {
        Self { match_radius }
    }

    pub async fn get_existing_records(
        &self,
        candidate: &CandidateRecord,
        memory: &mut MatchMemory,
        api: &dyn DirectoryApi,
        ui: &dyn Disambiguator,
    ) -> Result<ExistingRecords> {
        let remembered = memory
            .entry(&candidate.source_id)
            .cloned()
            .unwrap_or_default();

        if let Some(location_id) = remembered.location_id {
            match api.get_location_by_id(location_id).await? {
                Some(location) => {
                    let service = match remembered
                        .service_id
                        .and_then(|id| location.services.iter().find(|s| s.id == id).cloned())
                    {
                        Some(service) => Some(service),
                        None => self.match_service(candidate, &location, ui).await?,
                    };
                    return Ok(ExistingRecords {
                        location: Some(location),
                        service,
                    });
                }
                None => {
                    // Dangling entry: the target location was deleted
                    // out-of-band. Fall through to fresh matching.
                    warn!(
                        source_id = %candidate.source_id,
                        %location_id,
                        "match-memory points at a missing location; re-matching"
                    );
                }
            }
        }

        let Some(location) = self
            .match_location(candidate, &remembered, memory, api, ui)
            .await?
        else {
            return Ok(ExistingRecords::default());
        };
        let service = self.match_service(candidate, &location, ui).await?;
        Ok(ExistingRecords {
            location: Some(location),
            service,
        })
    }

    async fn match_location(
        &self,
        candidate: &CandidateRecord,
        remembered: &MatchMemoryEntry,
        memory: &mut MatchMemory,
        api: &dyn DirectoryApi,
        ui: &dyn Disambiguator,
    ) -> Result<Option<Location>> {
        let Some(position) = candidate.position else {
            warn!(
                source_id = %candidate.source_id,
                "candidate has no position; cannot search for nearby locations"
            );
            return Ok(None);
        };

        let mut nearby = api.get_locations_near(position, self.match_radius).await?;

        // Same organization name nearby is a definite match, no human needed.
        if let Some(index) = nearby.iter().position(|location| {
            location
                .organization
                .name
                .eq_ignore_ascii_case(&candidate.organization_name)
                || remembered
                    .organization_name
                    .as_deref()
                    .is_some_and(|known| location.organization.name.eq_ignore_ascii_case(known))
        }) {
            return Ok(Some(nearby.swap_remove(index)));
        }

        let mut options: Vec<Location> = nearby
            .into_iter()
            .filter(|location| {
                !remembered
                    .distinct_nearby_orgs
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(&location.organization.name))
            })
            .collect();
        if options.is_empty() {
            return Ok(None);
        }

        // Most plausible first.
        let wanted = candidate.organization_name.to_lowercase();
        options.sort_by(|a, b| {
            let score_a = jaro_winkler(&wanted, &a.organization.name.to_lowercase());
            let score_b = jaro_winkler(&wanted, &b.organization.name.to_lowercase());
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        match ui.choose_location(candidate, &options).await? {
            Some(index) if index < options.len() => Ok(Some(options.swap_remove(index))),
            _ => {
                // Remember the rejections so the same question is never
                // asked twice for this source id.
                let names = options
                    .into_iter()
                    .map(|location| location.organization.name)
                    .collect();
                memory
                    .record_distinct_orgs(&candidate.source_id, names)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn match_service(
        &self,
        candidate: &CandidateRecord,
        location: &Location,
        ui: &dyn Disambiguator,
    ) -> Result<Option<Service>> {
        if location.services.is_empty() {
            return Ok(None);
        }

        if let Some(service) = location
            .services
            .iter()
            .find(|s| s.name == candidate.service_name)
        {
            return Ok(Some(service.clone()));
        }

        let same_taxonomy: Vec<&Service> = location
            .services
            .iter()
            .filter(|s| s.taxonomy_ids.iter().any(|id| *id == candidate.taxonomy_id))
            .collect();
        match same_taxonomy.len() {
            0 => Ok(None),
            1 => Ok(Some(same_taxonomy[0].clone())),
            _ => {
                let mut options: Vec<Service> =
                    same_taxonomy.into_iter().cloned().collect();
                match ui.choose_service(candidate, &options).await? {
                    Some(index) if index < options.len() => Ok(Some(options.swap_remove(index))),
                    _ => Ok(None),
                }
            }
        }
    }
}

/// Explicit no-change sentinel, distinct from a legitimate write of the
/// existing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteOutcome {
    NoChange,
    Set(String),
}

/// Field-group merge decisions. Each group is evaluated independently
/// against the recency gate; a group with nothing to apply is a documented
/// no-op, never a write.
pub struct MergePolicy {
    min_hours_fresher: i64,
}

impl MergePolicy {
    pub fn new(min_hours_fresher: i64) -> Self {
        Self { min_hours_fresher }
    }

    /// Gate for filling a group whose current value is absent/unknown:
    /// strictly newer than the recorded write, or never recorded at all.
    fn may_fill(&self, candidate_ts: DateTime<Utc>, recorded: Option<DateTime<Utc>>) -> bool {
        recorded.map_or(true, |ts| candidate_ts > ts)
    }

    /// Overwriting a present value additionally requires the configured
    /// freshness margin on top of being strictly newer.
    fn may_overwrite(&self, candidate_ts: DateTime<Utc>, recorded: Option<DateTime<Utc>>) -> bool {
        recorded.map_or(true, |ts| {
            candidate_ts > ts && candidate_ts - ts >= Duration::hours(self.min_hours_fresher)
        })
    }

    /// Status and hours move together or not at all. A closed candidate
    /// clears the hour list; an open one replaces it verbatim.
    pub fn plan_status_hours(
        &self,
        candidate: &CandidateRecord,
        service: &Service,
    ) -> Option<(OpenStatus, Vec<ScheduleEntry>)> {
        if !candidate.status.is_known() {
            return None;
        }

        let recorded = service.metadata.last_updated(FieldGroup::StatusHours);
        let has_value = service.status.is_known();
        let gate = if has_value {
            self.may_overwrite(candidate.last_updated, recorded)
        } else {
            self.may_fill(candidate.last_updated, recorded)
        };
        if !gate {
            return None;
        }
        if has_value && service.status == candidate.status {
            return None;
        }

        let schedule = if candidate.status.is_closed() {
            Vec::new()
        } else {
            candidate.schedule.clone()
        };
        Some((candidate.status, schedule))
    }

    /// Advisory-note flow: fill when absent, no-op when already contained or
    /// stale, escalate a genuine conflict to the human channel.
    pub async fn plan_note(
        &self,
        ui: &dyn Disambiguator,
        entity_name: &str,
        candidate_note: Option<&str>,
        candidate_ts: DateTime<Utc>,
        existing_note: Option<&str>,
        recorded: Option<DateTime<Utc>>,
    ) -> Result<NoteOutcome> {
        let Some(incoming) = candidate_note.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(NoteOutcome::NoChange);
        };
        let Some(existing) = existing_note.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(if self.may_fill(candidate_ts, recorded) {
                NoteOutcome::Set(incoming.to_string())
            } else {
                NoteOutcome::NoChange
            });
        };

        if existing.contains(incoming) {
            return Ok(NoteOutcome::NoChange);
        }
        if !self.may_overwrite(candidate_ts, recorded) {
            return Ok(NoteOutcome::NoChange);
        }

        match ui
            .resolve_note_conflict(entity_name, existing, incoming)
            .await?
        {
            NoteResolution::KeepExisting => Ok(NoteOutcome::NoChange),
            NoteResolution::ReplaceWithNew => Ok(NoteOutcome::Set(incoming.to_string())),
            NoteResolution::Concatenate => Ok(NoteOutcome::Set(format!("{existing} {incoming}"))),
        }
    }

    /// One-directional: may only move to `true`, never back.
    pub fn plan_id_required(
        &self,
        candidate: &CandidateRecord,
        service: &Service,
    ) -> Option<bool> {
        if candidate.id_required != Some(true) || service.id_required == Some(true) {
            return None;
        }
        let recorded = service.metadata.last_updated(FieldGroup::IdRequired);
        let gate = match service.id_required {
            None => self.may_fill(candidate.last_updated, recorded),
            Some(_) => self.may_overwrite(candidate.last_updated, recorded),
        };
        gate.then_some(true)
    }

    /// Phones are append-only, compared on digits only against the
    /// location's own phones and every phone of its services.
    pub fn plan_new_phones(&self, candidate: &CandidateRecord, location: &Location) -> Vec<Phone> {
        let mut known: HashSet<String> = location.phones.iter().map(Phone::digits).collect();
        for service in &location.services {
            known.extend(service.phones.iter().map(Phone::digits));
        }

        let mut added = Vec::new();
        for phone in &candidate.phones {
            let digits = phone.digits();
            if digits.is_empty() || known.contains(&digits) {
                continue;
            }
            known.insert(digits);
            added.push(phone.clone());
        }
        added
    }

    pub async fn plan_location_update(
        &self,
        ui: &dyn Disambiguator,
        candidate: &CandidateRecord,
        location: &Location,
    ) -> Result<LocationPatch> {
        let mut patch = LocationPatch::default();

        if location.url.is_none() {
            patch.url = candidate.url.clone();
        }
        patch.add_phones = self.plan_new_phones(candidate, location);

        // A closed facility's note belongs to the location.
        if candidate.status.is_closed() {
            if let NoteOutcome::Set(note) = self
                .plan_note(
                    ui,
                    &location.organization.name,
                    candidate.advisory_note.as_deref(),
                    candidate.last_updated,
                    location.advisory_note.as_deref(),
                    location.metadata.last_updated(FieldGroup::AdvisoryNote),
                )
                .await?
            {
                patch.advisory_note = Some(note);
            }
        }

        Ok(patch)
    }

    pub async fn plan_service_update(
        &self,
        ui: &dyn Disambiguator,
        candidate: &CandidateRecord,
        service: &Service,
    ) -> Result<ServicePatch> {
        let mut patch = ServicePatch::default();

        if let Some((status, schedule)) = self.plan_status_hours(candidate, service) {
            patch.status = Some(status);
            patch.schedule = Some(schedule);
        }

        if !candidate.status.is_closed() {
            if let NoteOutcome::Set(note) = self
                .plan_note(
                    ui,
                    &service.name,
                    candidate.advisory_note.as_deref(),
                    candidate.last_updated,
                    service.advisory_note.as_deref(),
                    service.metadata.last_updated(FieldGroup::AdvisoryNote),
                )
                .await?
            {
                patch.advisory_note = Some(note);
            }
        }

        patch.id_required = self.plan_id_required(candidate, service);
        Ok(patch)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub match_radius: f64,
    pub min_hours_fresher: i64,
    pub max_days_since_update: i64,
    /// Provenance label stamped on every write.
    pub source_label: String,
    pub normalizer: NormalizerConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            match_radius: 30.0,
            min_hours_fresher: 0,
            max_days_since_update: 7,
            source_label: "spreadsheet-import".to_string(),
            normalizer: NormalizerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_rows: usize,
    pub prefiltered_out: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Sequential per-record state machine:
/// `start -> normalize -> match -> (create | update) -> persist-memory -> done`.
pub struct ReconciliationDriver {
    config: ReconcilerConfig,
    api: Box<dyn DirectoryApi>,
    ui: Box<dyn Disambiguator>,
    memory: MatchMemory,
    geolocation: GeolocationResolver,
    matcher: EntityMatcher,
    policy: MergePolicy,
}

impl ReconciliationDriver {
    pub fn new(
        config: ReconcilerConfig,
        api: Box<dyn DirectoryApi>,
        ui: Box<dyn Disambiguator>,
        memory: MatchMemory,
        geolocation: GeolocationResolver,
    ) -> Self {
        let matcher = EntityMatcher::new(config.match_radius);
        let policy = MergePolicy::new(config.min_hours_fresher);
        Self {
            config,
            api,
            ui,
            memory,
            geolocation,
            matcher,
            policy,
        }
    }

    /// Strictly sequential: disambiguation is interactive and the
    /// match-memory is flushed between records.
    pub async fn run(&mut self, rows: Vec<RawRecord>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let input_rows = rows.len();
        let (rows, prefiltered_out) =
            prefilter_rows(rows, started_at, self.config.max_days_since_update);
        info!(input_rows, prefiltered_out, "starting reconciliation run");

        let tree = self
            .api
            .get_taxonomy_tree()
            .await
            .context("fetching taxonomy tree")?;
        let labels: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.facility_type.as_deref())
            .collect();
        let normalizer = RecordNormalizer::new(
            TaxonomyMapping::build(labels, &tree),
            self.config.normalizer.clone(),
        );

        let mut created = 0usize;
        let mut updated = 0usize;
        let mut unchanged = 0usize;
        let mut skipped = 0usize;

        for row in &rows {
            match self.process(&normalizer, row).await {
                Ok(RecordOutcome::Created) => created += 1,
                Ok(RecordOutcome::Updated) => updated += 1,
                Ok(RecordOutcome::Unchanged) => unchanged += 1,
                Err(err) => {
                    if err.downcast_ref::<MemoryError>().is_some() {
                        return Err(err)
                            .context("aborting run: match-memory could not be persisted");
                    }
                    warn!(source_id = %row.id, error = %format!("{err:#}"), "record skipped");
                    skipped += 1;
                }
            }
        }

        let finished_at = Utc::now();
        info!(
            created,
            updated, unchanged, skipped, prefiltered_out, "reconciliation run finished"
        );
        Ok(RunSummary {
            started_at,
            finished_at,
            input_rows,
            prefiltered_out,
            created,
            updated,
            unchanged,
            skipped,
        })
    }

    async fn process(
        &mut self,
        normalizer: &RecordNormalizer,
        row: &RawRecord,
    ) -> Result<RecordOutcome> {
        let candidate = normalizer.normalize(&mut self.geolocation, row).await?;
        let existing = self
            .matcher
            .get_existing_records(
                &candidate,
                &mut self.memory,
                self.api.as_ref(),
                self.ui.as_ref(),
            )
            .await?;
        let provenance = FieldProvenance {
            last_updated: candidate.last_updated,
            source: self.config.source_label.clone(),
        };

        let Some(location) = existing.location else {
            let (location, service) = self.create_fresh(&candidate).await?;
            self.memory
                .record_location(
                    &candidate.source_id,
                    location.id,
                    location.organization.name.clone(),
                )
                .await?;
            self.memory
                .record_service(&candidate.source_id, service.id)
                .await?;
            info!(source_id = %candidate.source_id, location_id = %location.id, "created entities");
            return Ok(RecordOutcome::Created);
        };

        let mut changed = false;
        let location_patch = self
            .policy
            .plan_location_update(self.ui.as_ref(), &candidate, &location)
            .await?;
        if location_patch.is_empty() {
            info!(source_id = %candidate.source_id, "no location changes to apply");
        } else {
            self.api
                .update_location(location.id, location_patch, provenance.clone())
                .await?;
            changed = true;
        }

        let outcome = match existing.service {
            None => {
                let service = self
                    .api
                    .create_service(self.new_service(&candidate, location.id))
                    .await?;
                self.memory
                    .record_service(&candidate.source_id, service.id)
                    .await?;
                RecordOutcome::Created
            }
            Some(service) => {
                let service_patch = self
                    .policy
                    .plan_service_update(self.ui.as_ref(), &candidate, &service)
                    .await?;
                if service_patch.is_empty() {
                    info!(source_id = %candidate.source_id, "no service changes to apply");
                } else {
                    self.api
                        .update_service(service.id, service_patch, provenance)
                        .await?;
                    changed = true;
                }
                self.memory
                    .record_service(&candidate.source_id, service.id)
                    .await?;
                if changed {
                    RecordOutcome::Updated
                } else {
                    RecordOutcome::Unchanged
                }
            }
        };

        self.memory
            .record_location(
                &candidate.source_id,
                location.id,
                location.organization.name.clone(),
            )
            .await?;
        Ok(outcome)
    }

    async fn create_fresh(&self, candidate: &CandidateRecord) -> Result<(Location, Service)> {
        let organization = self
            .api
            .create_organization(NewOrganization {
                name: candidate.organization_name.clone(),
                url: candidate.url.clone(),
            })
            .await?;
        let location = self
            .api
            .create_location(NewLocation {
                organization_id: organization.id,
                name: None,
                address: candidate.address.clone(),
                position: candidate.position,
                phones: candidate.phones.clone(),
                url: candidate.url.clone(),
                advisory_note: candidate
                    .status
                    .is_closed()
                    .then(|| candidate.advisory_note.clone())
                    .flatten(),
            })
            .await?;
        let service = self
            .api
            .create_service(self.new_service(candidate, location.id))
            .await?;
        Ok((location, service))
    }

    fn new_service(&self, candidate: &CandidateRecord, location_id: Uuid) -> NewService {
        NewService {
            location_id,
            name: candidate.service_name.clone(),
            taxonomy_id: candidate.taxonomy_id.clone(),
            status: candidate.status,
            schedule: if candidate.status.is_closed() {
                Vec::new()
            } else {
                candidate.schedule.clone()
            },
            advisory_note: (!candidate.status.is_closed())
                .then(|| candidate.advisory_note.clone())
                .flatten(),
            id_required: candidate.id_required,
        }
    }
}
