//! End-to-end driver tests against an in-memory directory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempfile::tempdir;
use uuid::Uuid;

use svcdir_core::{
    CandidateRecord, EntityMetadata, FieldGroup, FieldProvenance, Location, LocationPatch,
    NewLocation, NewOrganization, NewService, OpenStatus, Organization, Position, Service,
    ServicePatch, TaxonomyNode,
};
use svcdir_normalize::RawRecord;
use svcdir_recon::{
    AutoSkipDisambiguator, Disambiguator, NoteResolution, ReconcilerConfig, ReconciliationDriver,
};
use svcdir_storage::{
    DirectoryApi, DirectoryError, GeocodeError, Geocoder, GeolocationResolver, MatchMemory,
};

#[derive(Default)]
struct DirState {
    organizations: Vec<Organization>,
    locations: Vec<Location>,
    writes: usize,
}

/// Small-town directory: radius queries return every location.
#[derive(Clone)]
struct InMemoryDirectory {
    state: Arc<Mutex<DirState>>,
    taxonomy: Arc<Vec<TaxonomyNode>>,
}

impl InMemoryDirectory {
    fn new(taxonomy: Vec<TaxonomyNode>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DirState::default())),
            taxonomy: Arc::new(taxonomy),
        }
    }

    fn writes(&self) -> usize {
        self.state.lock().expect("lock").writes
    }

    fn locations(&self) -> Vec<Location> {
        self.state.lock().expect("lock").locations.clone()
    }

    fn seed_location(&self, organization_name: &str, position: Position) -> Uuid {
        let mut state = self.state.lock().expect("lock");
        let organization = Organization {
            id: Uuid::new_v4(),
            name: organization_name.to_string(),
            url: None,
        };
        let location = Location {
            id: Uuid::new_v4(),
            organization: organization.clone(),
            name: None,
            address: None,
            position: Some(position),
            phones: Vec::new(),
            url: None,
            advisory_note: None,
            services: Vec::new(),
            metadata: EntityMetadata::default(),
        };
        let id = location.id;
        state.organizations.push(organization);
        state.locations.push(location);
        id
    }

    fn remove_location(&self, id: Uuid) {
        let mut state = self.state.lock().expect("lock");
        state.locations.retain(|location| location.id != id);
    }
}

#[async_trait]
impl DirectoryApi for InMemoryDirectory {
    async fn get_taxonomy_tree(&self) -> Result<Vec<TaxonomyNode>, DirectoryError> {
        Ok((*self.taxonomy).clone())
    }

    async fn get_locations_near(
        &self,
        _position: Position,
        _radius: f64,
    ) -> Result<Vec<Location>, DirectoryError> {
        Ok(self.state.lock().expect("lock").locations.clone())
    }

    async fn get_location_by_id(&self, id: Uuid) -> Result<Option<Location>, DirectoryError> {
        Ok(self
            .state
            .lock()
            .expect("lock")
            .locations
            .iter()
            .find(|location| location.id == id)
            .cloned())
    }

    async fn create_organization(
        &self,
        organization: NewOrganization,
    ) -> Result<Organization, DirectoryError> {
        let mut state = self.state.lock().expect("lock");
        let created = Organization {
            id: Uuid::new_v4(),
            name: organization.name,
            url: organization.url,
        };
        state.organizations.push(created.clone());
        state.writes += 1;
        Ok(created)
    }

    async fn create_location(&self, location: NewLocation) -> Result<Location, DirectoryError> {
        let mut state = self.state.lock().expect("lock");
        let organization = state
            .organizations
            .iter()
            .find(|org| org.id == location.organization_id)
            .cloned()
            .expect("organization exists before location");
        let created = Location {
            id: Uuid::new_v4(),
            organization,
            name: location.name,
            address: Some(location.address),
            position: location.position,
            phones: location.phones,
            url: location.url,
            advisory_note: location.advisory_note,
            services: Vec::new(),
            metadata: EntityMetadata::default(),
        };
        state.locations.push(created.clone());
        state.writes += 1;
        Ok(created)
    }

    async fn create_service(&self, service: NewService) -> Result<Service, DirectoryError> {
        let mut state = self.state.lock().expect("lock");
        let created = Service {
            id: Uuid::new_v4(),
            name: service.name,
            taxonomy_ids: vec![service.taxonomy_id],
            status: service.status,
            schedule: service.schedule,
            phones: Vec::new(),
            advisory_note: service.advisory_note,
            id_required: service.id_required,
            metadata: EntityMetadata::default(),
        };
        let location = state
            .locations
            .iter_mut()
            .find(|location| location.id == service.location_id)
            .expect("location exists before service");
        location.services.push(created.clone());
        state.writes += 1;
        Ok(created)
    }

    async fn update_location(
        &self,
        id: Uuid,
        patch: LocationPatch,
        provenance: FieldProvenance,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("lock");
        let location = state
            .locations
            .iter_mut()
            .find(|location| location.id == id)
            .expect("location exists");
        if let Some(url) = patch.url {
            location.url = Some(url);
            location.metadata.record(FieldGroup::Url, provenance.clone());
        }
        if let Some(note) = patch.advisory_note {
            location.advisory_note = Some(note);
            location
                .metadata
                .record(FieldGroup::AdvisoryNote, provenance.clone());
        }
        if !patch.add_phones.is_empty() {
            location.phones.extend(patch.add_phones);
            location.metadata.record(FieldGroup::Phones, provenance);
        }
        state.writes += 1;
        Ok(())
    }

    async fn update_service(
        &self,
        id: Uuid,
        patch: ServicePatch,
        provenance: FieldProvenance,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("lock");
        let service = state
            .locations
            .iter_mut()
            .flat_map(|location| location.services.iter_mut())
            .find(|service| service.id == id)
            .expect("service exists");
        if let Some(status) = patch.status {
            service.status = status;
            service.schedule = patch.schedule.unwrap_or_default();
            service
                .metadata
                .record(FieldGroup::StatusHours, provenance.clone());
        }
        if let Some(note) = patch.advisory_note {
            service.advisory_note = Some(note);
            service
                .metadata
                .record(FieldGroup::AdvisoryNote, provenance.clone());
        }
        if let Some(id_required) = patch.id_required {
            service.id_required = Some(id_required);
            service.metadata.record(FieldGroup::IdRequired, provenance);
        }
        state.writes += 1;
        Ok(())
    }
}

struct StubGeocoder;

#[async_trait]
impl Geocoder for StubGeocoder {
    async fn geocode(&self, _address: &str) -> Result<Position, GeocodeError> {
        Ok(Position {
            latitude: 40.69,
            longitude: -73.99,
        })
    }

    async fn city_for_postal_code(&self, _postal_code: &str) -> Result<String, GeocodeError> {
        Ok("Brooklyn".to_string())
    }
}

/// Fails the test if the driver ever reaches for a human.
struct PanickingUi;

#[async_trait]
impl Disambiguator for PanickingUi {
    async fn choose_location(
        &self,
        candidate: &CandidateRecord,
        _options: &[Location],
    ) -> Result<Option<usize>> {
        panic!("unexpected location prompt for {}", candidate.source_id);
    }

    async fn choose_service(
        &self,
        candidate: &CandidateRecord,
        _options: &[Service],
    ) -> Result<Option<usize>> {
        panic!("unexpected service prompt for {}", candidate.source_id);
    }

    async fn resolve_note_conflict(
        &self,
        entity_name: &str,
        _existing: &str,
        _incoming: &str,
    ) -> Result<NoteResolution> {
        panic!("unexpected note prompt for {entity_name}");
    }
}

/// Always answers "none of these" and counts how often it was asked.
#[derive(Clone, Default)]
struct CountingNoneUi {
    asks: Arc<AtomicUsize>,
}

#[async_trait]
impl Disambiguator for CountingNoneUi {
    async fn choose_location(
        &self,
        _candidate: &CandidateRecord,
        _options: &[Location],
    ) -> Result<Option<usize>> {
        self.asks.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn choose_service(
        &self,
        _candidate: &CandidateRecord,
        _options: &[Service],
    ) -> Result<Option<usize>> {
        self.asks.fetch_add(1, Ordering::SeqCst);
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

fn taxonomy_tree() -> Vec<TaxonomyNode> {
    vec![TaxonomyNode {
        id: "tax-food".to_string(),
        name: "Food".to_string(),
        children: vec![TaxonomyNode {
            id: "tax-pantry".to_string(),
            name: "Food Pantry".to_string(),
            children: Vec::new(),
        }],
    }]
}

fn open_row(id: &str, last_updated: DateTime<Utc>) -> RawRecord {
    RawRecord {
        id: id.to_string(),
        last_updated,
        name: Some("Hope Pantry".to_string()),
        address: Some("123 Main St, Brooklyn, NY 11201".to_string()),
        zipcode: Some("11201".to_string()),
        neighborhood: None,
        phone: Some("(212) 555-1234".to_string()),
        hours: Some("Mon-Fri: 9-5PM".to_string()),
        status: Some("open".to_string()),
        facility_type: Some("Food Pantry".to_string()),
        additional_notes: Some("Ring the side bell.".to_string()),
        id_required: Some("no".to_string()),
        website: Some("https://hope.example.org".to_string()),
        longitude: Some(-73.99),
        latitude: Some(40.69),
        do_not_import: false,
    }
}

fn closed_row(id: &str, last_updated: DateTime<Utc>) -> RawRecord {
    let mut row = open_row(id, last_updated);
    row.status = Some("closed".to_string());
    row.hours = None;
    row.additional_notes = Some("Closed for renovations.".to_string());
    row
}

async fn driver_for(
    api: &InMemoryDirectory,
    ui: Box<dyn Disambiguator>,
    data_dir: &std::path::Path,
) -> Result<ReconciliationDriver> {
    let memory = MatchMemory::load(data_dir.join("matching_data.json")).await?;
    let geolocation = GeolocationResolver::load(data_dir, Box::new(StubGeocoder)).await?;
    Ok(ReconciliationDriver::new(
        ReconcilerConfig::default(),
        Box::new(api.clone()),
        ui,
        memory,
        geolocation,
    ))
}

#[tokio::test]
async fn second_identical_run_is_all_no_ops() {
    let dir = tempdir().expect("tempdir");
    let api = InMemoryDirectory::new(taxonomy_tree());
    let rows = vec![open_row("row-1", Utc::now() - Duration::hours(1))];

    let mut driver = driver_for(&api, Box::new(AutoSkipDisambiguator), dir.path())
        .await
        .expect("driver");
    let first = driver.run(rows.clone()).await.expect("first run");
    assert_eq!(first.created, 1);
    assert_eq!(first.skipped, 0);
    let writes_after_first = api.writes();
    assert_eq!(writes_after_first, 3); // organization + location + service

    let mut driver = driver_for(&api, Box::new(PanickingUi), dir.path())
        .await
        .expect("driver");
    let second = driver.run(rows).await.expect("second run");
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 1);
    assert_eq!(second.skipped, 0);
    assert_eq!(api.writes(), writes_after_first);
}

#[tokio::test]
async fn equal_name_nearby_matches_without_human_interaction() {
    let dir = tempdir().expect("tempdir");
    let api = InMemoryDirectory::new(taxonomy_tree());
    api.seed_location(
        "HOPE PANTRY",
        Position {
            latitude: 40.69,
            longitude: -73.99,
        },
    );

    let mut driver = driver_for(&api, Box::new(PanickingUi), dir.path())
        .await
        .expect("driver");
    let summary = driver
        .run(vec![open_row("row-1", Utc::now() - Duration::hours(1))])
        .await
        .expect("run");

    // A new service under the existing location, no new organization.
    assert_eq!(summary.created, 1);
    let locations = api.locations();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].services.len(), 1);
    assert_eq!(locations[0].services[0].name, "Food Pantry");
}

#[tokio::test]
async fn dangling_match_memory_falls_through_to_fresh_matching() {
    let dir = tempdir().expect("tempdir");
    let api = InMemoryDirectory::new(taxonomy_tree());

    {
        let mut memory = MatchMemory::load(dir.path().join("matching_data.json"))
            .await
            .expect("memory");
        memory
            .record_location("row-1", Uuid::new_v4(), "Hope Pantry".to_string())
            .await
            .expect("seed dangling entry");
    }

    let mut driver = driver_for(&api, Box::new(AutoSkipDisambiguator), dir.path())
        .await
        .expect("driver");
    let summary = driver
        .run(vec![open_row("row-1", Utc::now() - Duration::hours(1))])
        .await
        .expect("run");
    assert_eq!(summary.created, 1);
    assert_eq!(summary.skipped, 0);

    // Memory now points at the freshly created location.
    let memory = MatchMemory::load(dir.path().join("matching_data.json"))
        .await
        .expect("reload memory");
    let entry = memory.entry("row-1").expect("entry");
    let locations = api.locations();
    assert_eq!(entry.location_id, Some(locations[0].id));
}

#[tokio::test]
async fn rejected_nearby_org_is_never_asked_about_again() {
    let dir = tempdir().expect("tempdir");
    let api = InMemoryDirectory::new(taxonomy_tree());
    api.seed_location(
        "Other Org",
        Position {
            latitude: 40.69,
            longitude: -73.99,
        },
    );

    let ui = CountingNoneUi::default();
    let rows = vec![open_row("row-1", Utc::now() - Duration::hours(1))];

    let mut driver = driver_for(&api, Box::new(ui.clone()), dir.path())
        .await
        .expect("driver");
    let first = driver.run(rows.clone()).await.expect("first run");
    assert_eq!(first.created, 1);
    assert_eq!(ui.asks.load(Ordering::SeqCst), 1);

    // Simulate an out-of-band deletion of the created location so the next
    // run has to re-match instead of using the remembered id.
    let memory = MatchMemory::load(dir.path().join("matching_data.json"))
        .await
        .expect("memory");
    let created_id = memory.entry("row-1").expect("entry").location_id.expect("id");
    api.remove_location(created_id);

    let mut driver = driver_for(&api, Box::new(ui.clone()), dir.path())
        .await
        .expect("driver");
    let second = driver.run(rows).await.expect("second run");
    assert_eq!(second.created, 1);
    // "Other Org" is in the remembered near-but-different list, so the
    // remaining option set is empty and no question is asked.
    assert_eq!(ui.asks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn newer_closed_report_updates_once_then_settles() {
    let dir = tempdir().expect("tempdir");
    let api = InMemoryDirectory::new(taxonomy_tree());
    let base = Utc::now() - Duration::hours(6);

    let mut driver = driver_for(&api, Box::new(AutoSkipDisambiguator), dir.path())
        .await
        .expect("driver");
    let first = driver
        .run(vec![open_row("row-1", base)])
        .await
        .expect("first run");
    assert_eq!(first.created, 1);

    // A fresher report says the facility closed.
    let mut driver = driver_for(&api, Box::new(AutoSkipDisambiguator), dir.path())
        .await
        .expect("driver");
    let second = driver
        .run(vec![closed_row("row-1", base + Duration::hours(2))])
        .await
        .expect("second run");
    assert_eq!(second.updated, 1);

    let locations = api.locations();
    let service = &locations[0].services[0];
    assert_eq!(service.status, OpenStatus::Closed);
    assert!(service.schedule.is_empty());
    // The closed note lands on the location, not the service.
    assert_eq!(
        locations[0].advisory_note.as_deref(),
        Some("Closed for renovations.")
    );

    // Replaying the same closed report changes nothing further.
    let writes_before = api.writes();
    let mut driver = driver_for(&api, Box::new(PanickingUi), dir.path())
        .await
        .expect("driver");
    let third = driver
        .run(vec![closed_row("row-1", base + Duration::hours(2))])
        .await
        .expect("third run");
    assert_eq!(third.unchanged, 1);
    assert_eq!(api.writes(), writes_before);
}
