//! Durable key-value stores and external collaborators for the ingest engine.
//!
//! Everything that survives a run lives here: the match-memory, the geocode
//! and city caches, and the HTTP clients for the directory API and the
//! geocoding service. Stores are plain JSON files written atomically via a
//! temp file + rename so an interrupted run never leaves a truncated store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use svcdir_core::{
    FieldProvenance, Location, LocationPatch, NewLocation, NewOrganization, NewService,
    Organization, Position, Service, ServicePatch, TaxonomyNode,
};

pub const CRATE_NAME: &str = "svcdir-storage";

/// One JSON document on disk, written atomically.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `T::default()` when the file does not exist yet.
    pub async fn load<T: DeserializeOwned + Default>(&self) -> anyhow::Result<T> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?
        {
            return Ok(T::default());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    pub async fn save<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", self.path.display()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(temp_name);

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }
}

/// Match-memory persistence failure. Surfaced as its own type because it is
/// the one storage failure that must abort a whole run instead of skipping a
/// record: losing matching state silently would corrupt every later run.
#[derive(Debug, Error)]
#[error("persisting match-memory: {0}")]
pub struct MemoryError(pub anyhow::Error);

/// Everything remembered about one external source id across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchMemoryEntry {
    pub location_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    /// Organization name the location carried when last matched.
    pub organization_name: Option<String>,
    /// Nearby organizations a human confirmed to be distinct. Never asked
    /// about again for this source id.
    #[serde(default)]
    pub distinct_nearby_orgs: Vec<String>,
}

/// Durable map from external source id to previously-resolved target ids and
/// disambiguation history. Flushed to disk after every mutation.
#[derive(Debug)]
pub struct MatchMemory {
    store: JsonStore,
    entries: HashMap<String, MatchMemoryEntry>,
}

impl MatchMemory {
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let store = JsonStore::new(path);
        let entries = store
            .load()
            .await
            .context("loading match-memory; refusing to run without matching state")?;
        Ok(Self { store, entries })
    }

    pub fn entry(&self, source_id: &str) -> Option<&MatchMemoryEntry> {
        self.entries.get(source_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn record_location(
        &mut self,
        source_id: &str,
        location_id: Uuid,
        organization_name: String,
    ) -> Result<(), MemoryError> {
        let entry = self.entries.entry(source_id.to_string()).or_default();
        entry.location_id = Some(location_id);
        entry.organization_name = Some(organization_name);
        self.persist().await
    }

    pub async fn record_service(
        &mut self,
        source_id: &str,
        service_id: Uuid,
    ) -> Result<(), MemoryError> {
        let entry = self.entries.entry(source_id.to_string()).or_default();
        entry.service_id = Some(service_id);
        self.persist().await
    }

    pub async fn record_distinct_orgs(
        &mut self,
        source_id: &str,
        organization_names: Vec<String>,
    ) -> Result<(), MemoryError> {
        let entry = self.entries.entry(source_id.to_string()).or_default();
        for name in organization_names {
            if !entry
                .distinct_nearby_orgs
                .iter()
                .any(|known| known.eq_ignore_ascii_case(&name))
            {
                entry.distinct_nearby_orgs.push(name);
            }
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<(), MemoryError> {
        self.store.save(&self.entries).await.map_err(MemoryError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("no geocoding result for {query:?}")]
    Empty { query: String },
    #[error("{count} geocoding results for {query:?}, expected exactly one")]
    Ambiguous { query: String, count: usize },
    #[error("geocoding service returned status {status:?} for {query:?}")]
    Service { query: String, status: String },
    #[error("geocoding request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// External geocoding service. Both operations enforce the bounded-result
/// expectation: anything other than exactly one hit is a typed error the
/// caller handles by skipping the record.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Position, GeocodeError>;
    async fn city_for_postal_code(&self, postal_code: &str) -> Result<String, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    #[serde(default)]
    formatted_address: String,
    geometry: GeocodeGeometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeGeometry {
    location: GeocodeLatLng,
}

#[derive(Debug, Deserialize)]
struct GeocodeLatLng {
    lat: f64,
    lng: f64,
}

const GEOCODING_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Google Maps geocoding client with bounded retry.
#[derive(Debug)]
pub struct GoogleGeocoder {
    client: reqwest::Client,
    api_key: String,
    backoff: BackoffPolicy,
}

impl GoogleGeocoder {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building geocoding client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            backoff: BackoffPolicy::default(),
        })
    }

    async fn request(
        &self,
        query: &str,
        params: &[(&str, &str)],
    ) -> Result<GeocodeResponse, GeocodeError> {
        let mut last_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let result = self
                .client
                .get(GEOCODING_URL)
                .query(params)
                .query(&[("key", self.api_key.as_str())])
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json::<GeocodeResponse>().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(GeocodeError::Service {
                        query: query.to_string(),
                        status: status.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(GeocodeError::Transport(err));
                }
            }
        }

        Err(GeocodeError::Transport(
            last_error.expect("retry loop captures a request error"),
        ))
    }

    fn single_result(
        query: &str,
        response: GeocodeResponse,
    ) -> Result<GeocodeResult, GeocodeError> {
        if response.status != "OK" {
            if response.status == "ZERO_RESULTS" {
                return Err(GeocodeError::Empty {
                    query: query.to_string(),
                });
            }
            return Err(GeocodeError::Service {
                query: query.to_string(),
                status: response.status,
            });
        }
        let mut results = response.results;
        match results.len() {
            0 => Err(GeocodeError::Empty {
                query: query.to_string(),
            }),
            1 => Ok(results.remove(0)),
            count => Err(GeocodeError::Ambiguous {
                query: query.to_string(),
                count,
            }),
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &str) -> Result<Position, GeocodeError> {
        let response = self.request(address, &[("address", address)]).await?;
        let result = Self::single_result(address, response)?;
        Ok(Position {
            latitude: result.geometry.location.lat,
            longitude: result.geometry.location.lng,
        })
    }

    async fn city_for_postal_code(&self, postal_code: &str) -> Result<String, GeocodeError> {
        let components = format!("country:US|postal_code:{postal_code}");
        let response = self
            .request(postal_code, &[("components", components.as_str())])
            .await?;
        let result = Self::single_result(postal_code, response)?;
        let city = result
            .formatted_address
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if city.is_empty() {
            return Err(GeocodeError::Empty {
                query: postal_code.to_string(),
            });
        }
        Ok(city)
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("directory API returned {status} for {url}")]
    Status { status: u16, url: String },
}

/// Canonical target store, reachable only through explicit calls.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn get_taxonomy_tree(&self) -> Result<Vec<TaxonomyNode>, DirectoryError>;
    async fn get_locations_near(
        &self,
        position: Position,
        radius: f64,
    ) -> Result<Vec<Location>, DirectoryError>;
    async fn get_location_by_id(&self, id: Uuid) -> Result<Option<Location>, DirectoryError>;
    async fn create_organization(
        &self,
        organization: NewOrganization,
    ) -> Result<Organization, DirectoryError>;
    async fn create_location(&self, location: NewLocation) -> Result<Location, DirectoryError>;
    async fn create_service(&self, service: NewService) -> Result<Service, DirectoryError>;
    async fn update_location(
        &self,
        id: Uuid,
        patch: LocationPatch,
        provenance: FieldProvenance,
    ) -> Result<(), DirectoryError>;
    async fn update_service(
        &self,
        id: Uuid,
        patch: ServicePatch,
        provenance: FieldProvenance,
    ) -> Result<(), DirectoryError>;
}

#[derive(Debug, Serialize)]
struct PatchEnvelope<T> {
    #[serde(flatten)]
    patch: T,
    metadata: FieldProvenance,
}

/// HTTP client for the directory API.
#[derive(Debug)]
pub struct HttpDirectoryApi {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpDirectoryApi {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building directory client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn expect_success(
        url: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, DirectoryError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(DirectoryError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, DirectoryError> {
        let url = self.url(path);
        let response = self
            .authorize(self.client.get(&url))
            .query(query)
            .send()
            .await?;
        let response = Self::expect_success(&url, response).await?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, DirectoryError> {
        let url = self.url(path);
        let response = self
            .authorize(self.client.post(&url))
            .json(body)
            .send()
            .await?;
        let response = Self::expect_success(&url, response).await?;
        Ok(response.json().await?)
    }

    async fn patch_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), DirectoryError> {
        let url = self.url(path);
        let response = self
            .authorize(self.client.patch(&url))
            .json(body)
            .send()
            .await?;
        Self::expect_success(&url, response).await?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectoryApi {
    async fn get_taxonomy_tree(&self) -> Result<Vec<TaxonomyNode>, DirectoryError> {
        self.get_json("/taxonomy", &[]).await
    }

    async fn get_locations_near(
        &self,
        position: Position,
        radius: f64,
    ) -> Result<Vec<Location>, DirectoryError> {
        self.get_json(
            "/locations",
            &[
                ("latitude", position.latitude.to_string()),
                ("longitude", position.longitude.to_string()),
                ("radius", radius.to_string()),
            ],
        )
        .await
    }

    async fn get_location_by_id(&self, id: Uuid) -> Result<Option<Location>, DirectoryError> {
        let url = self.url(&format!("/locations/{id}"));
        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_success(&url, response).await?;
        Ok(Some(response.json().await?))
    }

    async fn create_organization(
        &self,
        organization: NewOrganization,
    ) -> Result<Organization, DirectoryError> {
        self.post_json("/organizations", &organization).await
    }

    async fn create_location(&self, location: NewLocation) -> Result<Location, DirectoryError> {
        self.post_json("/locations", &location).await
    }

    async fn create_service(&self, service: NewService) -> Result<Service, DirectoryError> {
        self.post_json("/services", &service).await
    }

    async fn update_location(
        &self,
        id: Uuid,
        patch: LocationPatch,
        provenance: FieldProvenance,
    ) -> Result<(), DirectoryError> {
        self.patch_json(
            &format!("/locations/{id}"),
            &PatchEnvelope {
                patch,
                metadata: provenance,
            },
        )
        .await
    }

    async fn update_service(
        &self,
        id: Uuid,
        patch: ServicePatch,
        provenance: FieldProvenance,
    ) -> Result<(), DirectoryError> {
        self.patch_json(
            &format!("/services/{id}"),
            &PatchEnvelope {
                patch,
                metadata: provenance,
            },
        )
        .await
    }
}

/// Address and postal-code resolution backed by durable caches, falling back
/// to the geocoder only on a miss. Keys are the exact composed address
/// string / postal code / neighborhood name, so re-running against the same
/// input never re-queries the external service.
pub struct GeolocationResolver {
    geocoder: Box<dyn Geocoder>,
    positions_store: JsonStore,
    positions: HashMap<String, Position>,
    zipcode_store: JsonStore,
    zipcode_cities: HashMap<String, String>,
    neighborhood_store: JsonStore,
    neighborhood_cities: HashMap<String, String>,
}

impl GeolocationResolver {
    pub async fn load(
        data_dir: impl AsRef<Path>,
        geocoder: Box<dyn Geocoder>,
    ) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref();
        let positions_store = JsonStore::new(data_dir.join("stored_positions.json"));
        let zipcode_store = JsonStore::new(data_dir.join("zipcode_mapping.json"));
        let neighborhood_store = JsonStore::new(data_dir.join("neighborhood_mapping.json"));
        Ok(Self {
            geocoder,
            positions: positions_store.load().await?,
            positions_store,
            zipcode_cities: zipcode_store.load().await?,
            zipcode_store,
            neighborhood_cities: neighborhood_store.load().await?,
            neighborhood_store,
        })
    }

    fn address_key(street: &str, city: &str, state: &str, postal_code: &str) -> String {
        format!("{street}, {city}, {state} {postal_code}, USA")
    }

    pub async fn position_for(
        &mut self,
        street: &str,
        city: &str,
        state: &str,
        postal_code: &str,
    ) -> anyhow::Result<Position> {
        let key = Self::address_key(street, city, state, postal_code);
        if let Some(position) = self.positions.get(&key) {
            return Ok(*position);
        }

        let position = self
            .geocoder
            .geocode(&key)
            .await
            .with_context(|| format!("resolving position for {key:?}"))?;
        info!(
            address = %key,
            latitude = position.latitude,
            longitude = position.longitude,
            "geocoded address"
        );

        self.positions.insert(key, position);
        self.positions_store.save(&self.positions).await?;
        Ok(position)
    }

    /// Postal-code cache wins over neighborhood cache; one reverse-geocode on
    /// the postal code otherwise. `None` when there is nothing to resolve by.
    pub async fn city_for(
        &mut self,
        postal_code: Option<&str>,
        neighborhood: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        if let Some(city) = postal_code.and_then(|zip| self.zipcode_cities.get(zip)) {
            return Ok(Some(city.clone()));
        }
        if let Some(city) = neighborhood.and_then(|hood| self.neighborhood_cities.get(hood)) {
            return Ok(Some(city.clone()));
        }

        let Some(zip) = postal_code else {
            warn!(?neighborhood, "no postal code to resolve city from");
            return Ok(None);
        };

        let city = self
            .geocoder
            .city_for_postal_code(zip)
            .await
            .with_context(|| format!("resolving city for postal code {zip:?}"))?;
        info!(postal_code = zip, city = %city, "reverse-geocoded city");

        self.zipcode_cities.insert(zip.to_string(), city.clone());
        self.zipcode_store.save(&self.zipcode_cities).await?;
        if let Some(hood) = neighborhood {
            self.neighborhood_cities
                .insert(hood.to_string(), city.clone());
            self.neighborhood_store
                .save(&self.neighborhood_cities)
                .await?;
        }
        Ok(Some(city))
    }
}
