//! Block Array REST Adapter
//!
//! Implements [`ArrayClient`] over the array's HTTP management API. Every
//! command is a `GET /api/<verb>/<object>/...` path; the array answers with a
//! JSON document holding a `status` list and the requested objects. The
//! return code of the last status entry is decoded into an [`ArrayOutcome`]
//! before anything else looks at the response.

use crate::domain::fault::ArrayOutcome;
use crate::domain::ports::{
    ArrayClient, ArrayCredentials, ArraySnapshot, ArrayVolume, HostMapping,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Size of one array block
pub const BLOCK_SIZE: u64 = 512;

/// Header carrying the session key on authenticated calls
const SESSION_KEY_HEADER: &str = "sessionKey";

/// Identifier the array reports for the implicit default mapping
const ALL_OTHER_HOSTS: &str = "all other hosts";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the REST adapter
#[derive(Debug, Clone)]
pub struct RestArrayConfig {
    /// Timeout applied to each HTTP request
    pub request_timeout: Duration,
    /// Accept self-signed management certificates
    pub accept_invalid_certs: bool,
}

impl Default for RestArrayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            // arrays ship with self-signed certificates
            accept_invalid_certs: true,
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(rename = "return-code")]
    return_code: i64,
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: Vec<ApiStatus>,
    #[serde(flatten)]
    objects: BTreeMap<String, serde_json::Value>,
}

impl ApiResponse {
    fn status(&self) -> Result<&ApiStatus> {
        self.status
            .last()
            .ok_or_else(|| Error::ArrayProtocol("response carries no status".into()))
    }

    /// Objects listed under `key`, empty if absent
    fn objects<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        match self.objects.get(key) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VolumeObject {
    #[serde(rename = "volume-name")]
    name: String,
    #[serde(rename = "size-numeric", deserialize_with = "numeric")]
    blocks: u64,
    #[serde(rename = "storage-pool-name", default)]
    pool: String,
}

#[derive(Debug, Deserialize)]
struct VolumeMapObject {
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct HostMapObject {
    #[serde(deserialize_with = "numeric")]
    lun: u64,
    #[serde(rename = "volume-name")]
    volume: String,
    #[serde(rename = "initiator-id")]
    initiator: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotObject {
    name: String,
    #[serde(rename = "master-volume-name")]
    source_volume: String,
    #[serde(rename = "total-size-numeric", deserialize_with = "numeric")]
    size_bytes: u64,
    #[serde(rename = "creation-date-time-numeric", deserialize_with = "numeric")]
    created_epoch: u64,
}

/// The array reports numbers either as JSON numbers or as strings
fn numeric<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numeric {
        Number(u64),
        Text(String),
    }

    match Numeric::deserialize(deserializer)? {
        Numeric::Number(n) => Ok(n),
        Numeric::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Size argument as the array expects it
pub fn size_spec(bytes: u64) -> String {
    format!("{}B", bytes)
}

fn timestamp(epoch_secs: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch_secs as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", urlencoding::encode(name))
}

// =============================================================================
// REST Array Client
// =============================================================================

#[derive(Debug, Default, Clone)]
struct Session {
    address: String,
    key: Option<String>,
}

/// HTTP client for the array's management API
pub struct RestArrayClient {
    config: RestArrayConfig,
    http: RwLock<reqwest::Client>,
    session: RwLock<Session>,
}

impl RestArrayClient {
    pub fn new(config: RestArrayConfig) -> Result<Self> {
        let http = build_http(&config)?;
        Ok(Self {
            config,
            http: RwLock::new(http),
            session: RwLock::new(Session::default()),
        })
    }

    /// Issue one command and decode the response envelope
    async fn request(&self, path: &str) -> Result<ApiResponse> {
        let session = self.session.read().clone();
        if session.address.is_empty() {
            return Err(Error::ArrayProtocol("array client is not logged in".into()));
        }

        let url = format!("{}/api{}", session.address.trim_end_matches('/'), path);
        trace!(url = %url, "array request");

        let http = self.http.read().clone();
        let mut request = http.get(&url).header("dataType", "json");
        if let Some(key) = &session.key {
            request = request.header(SESSION_KEY_HEADER, key);
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.text().await?;
        let decoded: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::ArrayProtocol(format!("{}: {}", path, e)))?;
        Ok(decoded)
    }

    /// Issue a command that returns no objects
    async fn command(&self, path: &str) -> Result<ArrayOutcome<()>> {
        let response = self.request(path).await?;
        let status = response.status()?;
        Ok(ArrayOutcome::decode(
            status.return_code,
            status.response.clone(),
            || (),
        ))
    }

    /// Issue a query and project its objects on success
    async fn query<T>(
        &self,
        path: &str,
        project: impl FnOnce(&ApiResponse) -> Result<T>,
    ) -> Result<ArrayOutcome<T>> {
        let response = self.request(path).await?;
        let status = response.status()?;
        match ArrayOutcome::decode(status.return_code, status.response.clone(), || ()) {
            ArrayOutcome::Ok(()) => Ok(ArrayOutcome::Ok(project(&response)?)),
            ArrayOutcome::KnownFault(fault) => Ok(ArrayOutcome::KnownFault(fault)),
            ArrayOutcome::Unknown { code, message } => Ok(ArrayOutcome::Unknown { code, message }),
        }
    }
}

fn build_http(config: &RestArrayConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(config.request_timeout)
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()?)
}

#[async_trait]
impl ArrayClient for RestArrayClient {
    async fn login(&self, credentials: &ArrayCredentials) -> Result<()> {
        let address = credentials.address.trim_end_matches('/').to_string();
        *self.session.write() = Session {
            address: address.clone(),
            key: None,
        };

        let http = self.http.read().clone();
        let response = http
            .get(format!("{}/api/login", address))
            .header("dataType", "json")
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await?;

        if matches!(
            response.status(),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
        ) {
            warn!(address = %address, status = %response.status(), "array refused login");
            return Err(Error::Unauthenticated {
                address,
                username: credentials.username.clone(),
                reason: response.status().to_string(),
            });
        }

        let body = response.error_for_status()?.text().await?;
        let decoded: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::ArrayProtocol(format!("login: {}", e)))?;
        let status = decoded.status()?;

        if status.return_code != 1 && status.return_code != 0 {
            warn!(address = %address, code = status.return_code, "array refused login");
            return Err(Error::Unauthenticated {
                address,
                username: credentials.username.clone(),
                reason: status.response.clone(),
            });
        }

        debug!(address = %address, "array session established");
        self.session.write().key = Some(status.response.clone());
        Ok(())
    }

    fn close_idle_connections(&self) {
        // dropping the pooled client closes its idle keep-alive connections
        match build_http(&self.config) {
            Ok(http) => *self.http.write() = http,
            Err(e) => warn!(error = %e, "failed to rebuild array HTTP client"),
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        size_bytes: u64,
        pool: &str,
    ) -> Result<ArrayOutcome<()>> {
        self.command(&format!(
            "/create/volume/pool/{}/size/{}/{}",
            urlencoding::encode(pool),
            size_spec(size_bytes),
            quoted(name)
        ))
        .await
    }

    async fn copy_volume(&self, source: &str, name: &str, pool: &str) -> Result<ArrayOutcome<()>> {
        self.command(&format!(
            "/copy/volume/destination-pool/{}/name/{}/{}",
            urlencoding::encode(pool),
            quoted(name),
            quoted(source)
        ))
        .await
    }

    async fn delete_volume(&self, name: &str) -> Result<ArrayOutcome<()>> {
        self.command(&format!("/delete/volumes/{}", quoted(name)))
            .await
    }

    async fn expand_volume(&self, name: &str, delta_bytes: u64) -> Result<ArrayOutcome<()>> {
        self.command(&format!(
            "/expand/volume/size/{}/{}",
            size_spec(delta_bytes),
            quoted(name)
        ))
        .await
    }

    async fn show_volumes(&self, name: Option<&str>) -> Result<ArrayOutcome<Vec<ArrayVolume>>> {
        let path = match name {
            Some(name) => format!("/show/volumes/{}", quoted(name)),
            None => "/show/volumes".to_string(),
        };
        self.query(&path, |response| {
            Ok(response
                .objects::<VolumeObject>("volumes")?
                .into_iter()
                .map(|v| ArrayVolume {
                    name: v.name,
                    size_bytes: v.blocks * BLOCK_SIZE,
                    pool: v.pool,
                })
                .collect())
        })
        .await
    }

    async fn show_volume_maps(&self, volume: &str) -> Result<ArrayOutcome<Vec<String>>> {
        self.query(&format!("/show/volume-maps/{}", quoted(volume)), |response| {
            Ok(response
                .objects::<VolumeMapObject>("volume-view-mappings")?
                .into_iter()
                .map(|m| m.identifier)
                .filter(|id| id != ALL_OTHER_HOSTS)
                .collect())
        })
        .await
    }

    async fn map_volume(
        &self,
        volume: &str,
        initiator: &str,
        mode: &str,
        lun: u32,
    ) -> Result<ArrayOutcome<()>> {
        self.command(&format!(
            "/map/volume/{}/access/{}/lun/{}/initiator/{}",
            quoted(volume),
            mode,
            lun,
            urlencoding::encode(initiator)
        ))
        .await
    }

    async fn unmap_volume(&self, volume: &str, initiator: &str) -> Result<ArrayOutcome<()>> {
        let path = if initiator.is_empty() {
            format!("/unmap/volume/{}", quoted(volume))
        } else {
            format!(
                "/unmap/volume/initiator/{}/{}",
                urlencoding::encode(initiator),
                quoted(volume)
            )
        };
        self.command(&path).await
    }

    async fn show_host_maps(
        &self,
        initiator: Option<&str>,
    ) -> Result<ArrayOutcome<Vec<HostMapping>>> {
        let path = match initiator {
            Some(initiator) => format!("/show/host-maps/{}", urlencoding::encode(initiator)),
            None => "/show/host-maps".to_string(),
        };
        self.query(&path, |response| {
            response
                .objects::<HostMapObject>("host-view-mappings")?
                .into_iter()
                .map(|m| {
                    let lun = u32::try_from(m.lun)
                        .map_err(|_| Error::ArrayProtocol(format!("LUN {} out of range", m.lun)))?;
                    Ok(HostMapping {
                        lun,
                        volume: m.volume,
                        initiator: m.initiator,
                    })
                })
                .collect()
        })
        .await
    }

    async fn create_host(&self, nickname: &str, initiator: &str) -> Result<ArrayOutcome<()>> {
        self.command(&format!(
            "/create/host/id/{}/{}",
            urlencoding::encode(initiator),
            quoted(nickname)
        ))
        .await
    }

    async fn create_snapshot(&self, source: &str, name: &str) -> Result<ArrayOutcome<()>> {
        self.command(&format!(
            "/create/snapshots/volumes/{}/{}",
            quoted(source),
            quoted(name)
        ))
        .await
    }

    async fn delete_snapshot(&self, name: &str) -> Result<ArrayOutcome<()>> {
        self.command(&format!("/delete/snapshot/{}", quoted(name)))
            .await
    }

    async fn show_snapshots(
        &self,
        name: Option<&str>,
    ) -> Result<ArrayOutcome<Vec<ArraySnapshot>>> {
        let path = match name {
            Some(name) => format!("/show/snapshots/{}", quoted(name)),
            None => "/show/snapshots".to_string(),
        };
        self.query(&path, |response| {
            Ok(response
                .objects::<SnapshotObject>("snapshots")?
                .into_iter()
                .map(|s| ArraySnapshot {
                    name: s.name,
                    source_volume: s.source_volume,
                    size_bytes: s.size_bytes,
                    created_at: timestamp(s.created_epoch),
                })
                .collect())
        })
        .await
    }
}
