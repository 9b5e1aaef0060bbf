use std::collections::HashMap;

use futures::future::BoxFuture;
use reqwest::Url;
use serde_json::{Map, Value};
use tracing::info;

use super::config::EndpointConfig;
use crate::error::SyncError;
use crate::query_builder::interpolate;
use crate::types::{DestinationMapping, DispatchStats, SegmentDefinition};

/// Issues the GET for an endpoint destination and returns the raw response body.
pub trait EndpointCaller: Send + Sync {
    fn get<'a>(
        &'a self,
        url: &'a str,
        query: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<String, SyncError>>;
}

pub struct HttpEndpointCaller {
    client: reqwest::Client,
}

impl HttpEndpointCaller {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl EndpointCaller for HttpEndpointCaller {
    fn get<'a>(
        &'a self,
        url: &'a str,
        query: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<String, SyncError>> {
        Box::pin(async move {
            let response = self.client.get(url).query(query).send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(SyncError::ServiceFailure(format!(
                    "endpoint {url} responded with {status}: {body}"
                )));
            }
            Ok(body)
        })
    }
}

/// URL plus query-string pairs for one endpoint dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Resolves every declared parameter: mapping config first, then destination parameters,
/// then the built-in `segmentDefinitionId`, `segmentLabel` and `syncId`. A missing value fails
/// the dispatch.
pub fn build_request(
    config: &EndpointConfig,
    mapping: &DestinationMapping,
    definition: &SegmentDefinition,
    sync_id: Option<i64>,
) -> Result<EndpointRequest, SyncError> {
    let empty = Map::new();
    let overrides = mapping.config.as_object().unwrap_or(&empty);
    let parameters = mapping.destination.parameters.as_object().unwrap_or(&empty);

    let mut builtins = HashMap::from([
        ("segmentDefinitionId".to_string(), definition.id.to_string()),
        ("segmentLabel".to_string(), definition.label.clone()),
    ]);
    if let Some(sync_id) = sync_id {
        builtins.insert("syncId".to_string(), sync_id.to_string());
    }

    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut query = Vec::with_capacity(config.parameters.len());
    for name in &config.parameters {
        let value = overrides
            .get(name)
            .and_then(scalar_text)
            .or_else(|| parameters.get(name).and_then(scalar_text))
            .or_else(|| builtins.get(name).cloned())
            .ok_or_else(|| {
                SyncError::InvalidData(format!("endpoint parameter `{name}` is required"))
            })?;
        resolved.insert(name.clone(), value.clone());
        query.push((name.clone(), value));
    }

    let url = interpolate(&config.api_url, Some(&resolved))?;
    Url::parse(&url)
        .map_err(|err| SyncError::InvalidData(format!("endpoint url `{url}` is invalid: {err}")))?;

    Ok(EndpointRequest { url, query })
}

pub async fn dispatch_endpoint(
    caller: &dyn EndpointCaller,
    config: &EndpointConfig,
    mapping: &DestinationMapping,
    definition: &SegmentDefinition,
    sync_id: Option<i64>,
) -> Result<DispatchStats, SyncError> {
    let request = build_request(config, mapping, definition, sync_id)?;
    let body = caller.get(&request.url, &request.query).await?;
    info!(
        event = "endpoint_dispatched",
        definition_id = definition.id,
        mapping_id = mapping.id,
        url = %request.url,
        response_bytes = body.len(),
        "endpoint destination responded"
    );
    Ok(DispatchStats {
        response: Some(body),
        ..DispatchStats::default()
    })
}
