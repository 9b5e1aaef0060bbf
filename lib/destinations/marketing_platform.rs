//! Marketing-automation platform client and the segment sync that pushes membership deltas to it.
//!
//! The App API (bearer auth) lists and creates segments and looks up customers. The Track API
//! (basic auth with the site id) adds and removes segment members. Every outbound request waits
//! on a shared governor budget and is retried on 429, 5xx and transport failures.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::{Arc, LazyLock};

use futures::future::BoxFuture;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use regex::Regex;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::retry::{run_with_retry, RetryPolicy};
use crate::config::MarketingPlatformConfig;
use crate::error::SyncError;
use crate::types::{DispatchStats, MembershipDelta, SegmentDefinition};

pub type PlatformRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

static SEGMENT_NAME_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$"));

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("platform responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("platform transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("platform response could not be decoded: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::Transport(_) => true,
            Self::Decode(_) => false,
        }
    }
}

impl From<PlatformError> for SyncError {
    fn from(err: PlatformError) -> Self {
        Self::ServiceFailure(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteSegment {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// How an outbound membership batch identifies people.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdType {
    Id,
    Email,
    CioId,
}

impl IdType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Email => "email",
            Self::CioId => "cio_id",
        }
    }
}

/// A person's identifier on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExternalIdentifier {
    Id(String),
    Email(String),
    CioId(String),
}

impl ExternalIdentifier {
    pub fn id_type(&self) -> IdType {
        match self {
            Self::Id(_) => IdType::Id,
            Self::Email(_) => IdType::Email,
            Self::CioId(_) => IdType::CioId,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Id(value) | Self::Email(value) | Self::CioId(value) => value,
        }
    }
}

pub trait MarketingPlatform: Send + Sync {
    fn list_segments<'a>(&'a self) -> BoxFuture<'a, Result<Vec<RemoteSegment>, SyncError>>;

    fn create_segment<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> BoxFuture<'a, Result<RemoteSegment, SyncError>>;

    /// Looks up one member. `None` means the platform does not know this person.
    fn resolve_identifier<'a>(
        &'a self,
        member_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExternalIdentifier>, SyncError>>;

    /// Adds one batch of people, all keyed by `id_type`.
    fn add_members<'a>(
        &'a self,
        segment_id: i64,
        id_type: IdType,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), SyncError>>;

    fn remove_members<'a>(
        &'a self,
        segment_id: i64,
        id_type: IdType,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), SyncError>>;
}

impl<T> MarketingPlatform for Arc<T>
where
    T: MarketingPlatform + ?Sized,
{
    fn list_segments<'a>(&'a self) -> BoxFuture<'a, Result<Vec<RemoteSegment>, SyncError>> {
        (**self).list_segments()
    }

    fn create_segment<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> BoxFuture<'a, Result<RemoteSegment, SyncError>> {
        (**self).create_segment(name, description)
    }

    fn resolve_identifier<'a>(
        &'a self,
        member_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExternalIdentifier>, SyncError>> {
        (**self).resolve_identifier(member_id)
    }

    fn add_members<'a>(
        &'a self,
        segment_id: i64,
        id_type: IdType,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        (**self).add_members(segment_id, id_type, ids)
    }

    fn remove_members<'a>(
        &'a self,
        segment_id: i64,
        id_type: IdType,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        (**self).remove_members(segment_id, id_type, ids)
    }
}

#[derive(Deserialize)]
struct SegmentListResponse {
    #[serde(default)]
    segments: Vec<RemoteSegment>,
}

#[derive(Deserialize)]
struct SegmentEnvelope {
    segment: RemoteSegment,
}

#[derive(Deserialize, Default)]
struct CustomerIdentifiers {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    cio_id: Option<String>,
}

#[derive(Deserialize)]
struct CustomerBody {
    #[serde(default)]
    identifiers: CustomerIdentifiers,
}

#[derive(Deserialize)]
struct CustomerEnvelope {
    customer: CustomerBody,
}

enum Api {
    App,
    Track,
}

/// `{base}/v1/customers/{member_id}/attributes` with the id percent-encoded as one segment.
fn customer_attributes_url(base: &str, member_id: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(base)
        .map_err(|err| SyncError::InvalidData(format!("invalid app api url `{base}`: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::InvalidData(format!("app api url `{base}` cannot carry a path")))?
        .pop_if_empty()
        .extend(["v1", "customers", member_id, "attributes"]);
    Ok(url)
}

pub struct HttpMarketingPlatform {
    client: reqwest::Client,
    config: MarketingPlatformConfig,
    rate_limiter: PlatformRateLimiter,
    retry_policy: RetryPolicy,
}

impl HttpMarketingPlatform {
    pub fn new(client: reqwest::Client, config: MarketingPlatformConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(nonzero!(10u32));
        Self {
            client,
            config,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            retry_policy: RetryPolicy::default(),
        }
    }

    fn request(&self, api: &Api, method: Method, path: &str) -> RequestBuilder {
        let base = match api {
            Api::App => &self.config.app_api_url,
            Api::Track => &self.config.track_api_url,
        };
        self.authorize(api, self.client.request(method, format!("{base}{path}")))
    }

    fn authorize(&self, api: &Api, builder: RequestBuilder) -> RequestBuilder {
        match api {
            Api::App => builder.bearer_auth(&self.config.app_api_key),
            Api::Track => builder.basic_auth(&self.config.site_id, Some(&self.config.track_api_key)),
        }
    }

    /// Sends a request built by `build` under the rate limit and retry policy. 404 comes back
    /// as `Ok(None)` so lookups can tell "unknown" apart from failure.
    async fn send<F>(&self, jitter_key: u64, build: F) -> Result<Option<String>, PlatformError>
    where
        F: Fn() -> RequestBuilder,
    {
        run_with_retry(
            &self.retry_policy,
            jitter_key,
            |attempt| {
                let request = build();
                async move {
                    self.rate_limiter.until_ready().await;
                    let response = request.send().await?;
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    let body = response.text().await?;
                    if !status.is_success() {
                        debug!(
                            event = "platform_request_failed",
                            status = status.as_u16(),
                            attempt,
                            "platform request failed"
                        );
                        return Err(PlatformError::Status { status, body });
                    }
                    Ok(Some(body))
                }
            },
            PlatformError::is_retryable,
        )
        .await
    }

    async fn send_expecting_body<F>(&self, jitter_key: u64, build: F) -> Result<String, PlatformError>
    where
        F: Fn() -> RequestBuilder,
    {
        self.send(jitter_key, build).await?.ok_or(PlatformError::Status {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        })
    }

    async fn change_members(
        &self,
        action: &str,
        segment_id: i64,
        id_type: IdType,
        ids: &[String],
    ) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        let path = format!(
            "/api/v1/segments/{segment_id}/{action}?id_type={}",
            id_type.as_str()
        );
        let body = json!({ "ids": ids });
        self.send_expecting_body(segment_id as u64, || {
            self.request(&Api::Track, Method::POST, &path).json(&body)
        })
        .await?;
        Ok(())
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, PlatformError> {
    serde_json::from_str(body).map_err(|err| PlatformError::Decode(err.to_string()))
}

impl MarketingPlatform for HttpMarketingPlatform {
    fn list_segments<'a>(&'a self) -> BoxFuture<'a, Result<Vec<RemoteSegment>, SyncError>> {
        Box::pin(async move {
            let body = self
                .send_expecting_body(0, || self.request(&Api::App, Method::GET, "/v1/segments"))
                .await?;
            Ok(decode::<SegmentListResponse>(&body)?.segments)
        })
    }

    fn create_segment<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> BoxFuture<'a, Result<RemoteSegment, SyncError>> {
        Box::pin(async move {
            let payload = json!({ "segment": { "name": name, "description": description } });
            let body = self
                .send_expecting_body(0, || {
                    self.request(&Api::App, Method::POST, "/v1/segments")
                        .json(&payload)
                })
                .await?;
            Ok(decode::<SegmentEnvelope>(&body)?.segment)
        })
    }

    fn resolve_identifier<'a>(
        &'a self,
        member_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExternalIdentifier>, SyncError>> {
        Box::pin(async move {
            let url = customer_attributes_url(&self.config.app_api_url, member_id)?;
            let Some(body) = self
                .send(0, || {
                    self.authorize(&Api::App, self.client.get(url.clone()))
                        .query(&[("id_type", IdType::Id.as_str())])
                })
                .await?
            else {
                return Ok(None);
            };

            let identifiers = decode::<CustomerEnvelope>(&body)?.customer.identifiers;
            Ok(identifiers
                .id
                .map(ExternalIdentifier::Id)
                .or(identifiers.cio_id.map(ExternalIdentifier::CioId))
                .or(identifiers.email.map(ExternalIdentifier::Email)))
        })
    }

    fn add_members<'a>(
        &'a self,
        segment_id: i64,
        id_type: IdType,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(self.change_members("add_customers", segment_id, id_type, ids))
    }

    fn remove_members<'a>(
        &'a self,
        segment_id: i64,
        id_type: IdType,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(self.change_members("remove_customers", segment_id, id_type, ids))
    }
}

pub fn validate_segment_name(name: &str) -> Result<(), SyncError> {
    let re = SEGMENT_NAME_RE
        .as_ref()
        .map_err(|err| SyncError::Exception(format!("segment name pattern failed to compile: {err}")))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(SyncError::InvalidData(format!(
            "segment name `{name}` may only contain letters, digits, `_` and `-`"
        )))
    }
}

/// Finds the remote segment with exactly `name`, creating it when absent.
pub async fn resolve_or_create_segment(
    platform: &dyn MarketingPlatform,
    name: &str,
    description: &str,
) -> Result<RemoteSegment, SyncError> {
    validate_segment_name(name)?;
    let existing = platform.list_segments().await?;
    if let Some(segment) = existing.into_iter().find(|segment| segment.name == name) {
        return Ok(segment);
    }
    info!(event = "platform_segment_created", segment_name = name, "creating remote segment");
    platform.create_segment(name, description).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Add,
    Remove,
}

/// Groups identifiers by type and sends them in batches of at most `batch_size`.
async fn send_in_batches(
    platform: &dyn MarketingPlatform,
    segment_id: i64,
    change: Change,
    identifiers: &[ExternalIdentifier],
    batch_size: usize,
) -> Result<(), SyncError> {
    let mut by_type: BTreeMap<IdType, Vec<String>> = BTreeMap::new();
    for identifier in identifiers {
        by_type
            .entry(identifier.id_type())
            .or_default()
            .push(identifier.value().to_string());
    }

    for (id_type, values) in by_type {
        for batch in values.chunks(batch_size.max(1)) {
            match change {
                Change::Add => platform.add_members(segment_id, id_type, batch).await?,
                Change::Remove => platform.remove_members(segment_id, id_type, batch).await?,
            }
        }
    }
    Ok(())
}

async fn resolve_all(
    platform: &dyn MarketingPlatform,
    member_ids: &[String],
) -> Result<(Vec<ExternalIdentifier>, usize), SyncError> {
    let mut resolved = Vec::with_capacity(member_ids.len());
    let mut unresolved = 0usize;
    for member_id in member_ids {
        match platform.resolve_identifier(member_id).await? {
            Some(identifier) => resolved.push(identifier),
            None => unresolved += 1,
        }
    }
    Ok((resolved, unresolved))
}

/// Pushes the latest membership delta of `definition` to its remote segment.
pub async fn sync_marketing_segment(
    platform: &dyn MarketingPlatform,
    batch_size: usize,
    definition: &SegmentDefinition,
    segment_name: Option<&str>,
    delta: Option<&MembershipDelta>,
) -> Result<DispatchStats, SyncError> {
    let name = segment_name.unwrap_or(&definition.label);
    let description = definition.description.as_deref().unwrap_or(&definition.label);
    let segment = resolve_or_create_segment(platform, name, description).await?;

    let Some(delta) = delta.filter(|delta| !delta.is_empty()) else {
        debug!(
            event = "platform_sync_nothing_to_send",
            definition_id = definition.id,
            segment_id = segment.id,
            "no membership history to push"
        );
        return Ok(DispatchStats::default());
    };

    let (added, unresolved_added) = resolve_all(platform, &delta.added).await?;
    let (removed, unresolved_removed) = resolve_all(platform, &delta.removed).await?;
    let unresolved = unresolved_added + unresolved_removed;
    if unresolved > 0 {
        warn!(
            event = "platform_identifiers_unresolved",
            definition_id = definition.id,
            unresolved,
            "skipping members without a platform identifier"
        );
    }

    send_in_batches(platform, segment.id, Change::Add, &added, batch_size).await?;
    send_in_batches(platform, segment.id, Change::Remove, &removed, batch_size).await?;

    info!(
        event = "platform_segment_synced",
        definition_id = definition.id,
        sync_id = delta.sync_id,
        segment_id = segment.id,
        members_added = added.len(),
        members_removed = removed.len(),
        unresolved,
        "pushed membership delta to platform"
    );
    Ok(DispatchStats {
        members_added: added.len(),
        members_removed: removed.len(),
        unresolved,
        ..DispatchStats::default()
    })
}
