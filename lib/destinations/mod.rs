pub mod config;
pub mod endpoint;
pub mod marketing_platform;
pub mod retry;
pub mod store_sink;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use self::config::{merged_config, EndpointConfig, ServiceOperationConfig, StoreSinkConfig};
use self::endpoint::{dispatch_endpoint, EndpointCaller};
use self::marketing_platform::{sync_marketing_segment, MarketingPlatform};
use self::store_sink::{dispatch_store, RelationalSink, StoreDispatch};
use crate::backend::BackendRouter;
use crate::config::DEFAULT_MARKETING_BATCH_SIZE;
use crate::error::SyncError;
use crate::types::{
    DestinationMapping, DispatchStats, MembershipDelta, SegmentDefinition, SegmentProfile,
};

/// Functions a `serviceOperation` destination may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOperation {
    MarketingSegmentSync,
}

impl ServiceOperation {
    pub fn from_name(name: &str) -> Result<Self, SyncError> {
        match name {
            "marketingSegmentSync" => Ok(Self::MarketingSegmentSync),
            other => Err(SyncError::InvalidData(format!(
                "unknown service operation `{other}`"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarketingSegmentSync => "marketingSegmentSync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Endpoint,
    ServiceOperation,
    Store,
}

impl DestinationKind {
    pub fn from_label(label: &str) -> Result<Self, SyncError> {
        match label {
            "endpoint" => Ok(Self::Endpoint),
            "serviceOperation" => Ok(Self::ServiceOperation),
            "store" => Ok(Self::Store),
            other => Err(SyncError::InvalidData(format!(
                "unknown destination type `{other}`"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Endpoint => "endpoint",
            Self::ServiceOperation => "serviceOperation",
            Self::Store => "store",
        }
    }
}

/// Everything a mapping dispatch reads about the segment being pushed.
pub struct DispatchContext<'a> {
    pub profile: &'a SegmentProfile,
    pub definition: &'a SegmentDefinition,
    pub params: &'a HashMap<String, String>,
    /// History of the latest sync that changed membership. `None` when nothing was recorded.
    pub delta: Option<&'a MembershipDelta>,
}

/// Routes a mapping to its adapter.
pub struct DestinationDispatcher {
    endpoint: Arc<dyn EndpointCaller>,
    sink: Arc<dyn RelationalSink>,
    marketing: Option<Arc<dyn MarketingPlatform>>,
    marketing_batch_size: usize,
    router: BackendRouter,
}

impl DestinationDispatcher {
    pub fn new(
        endpoint: Arc<dyn EndpointCaller>,
        sink: Arc<dyn RelationalSink>,
        router: BackendRouter,
    ) -> Self {
        Self {
            endpoint,
            sink,
            marketing: None,
            marketing_batch_size: DEFAULT_MARKETING_BATCH_SIZE,
            router,
        }
    }

    pub fn with_marketing_platform(
        mut self,
        platform: Arc<dyn MarketingPlatform>,
        batch_size: usize,
    ) -> Self {
        self.marketing = Some(platform);
        self.marketing_batch_size = batch_size.max(1);
        self
    }

    pub async fn dispatch_mapping(
        &self,
        ctx: &DispatchContext<'_>,
        mapping: &DestinationMapping,
    ) -> Result<DispatchStats, SyncError> {
        let kind = DestinationKind::from_label(&mapping.destination.destination)?;
        let merged = merged_config(&mapping.destination.parameters, &mapping.config)?;
        debug!(
            event = "destination_dispatch_started",
            definition_id = ctx.definition.id,
            mapping_id = mapping.id,
            destination = kind.as_str(),
            "dispatching destination mapping"
        );

        let sync_id = ctx.delta.map(|delta| delta.sync_id);
        match kind {
            DestinationKind::Endpoint => {
                let config = EndpointConfig::from_merged(&merged)?;
                dispatch_endpoint(
                    self.endpoint.as_ref(),
                    &config,
                    mapping,
                    ctx.definition,
                    sync_id,
                )
                .await
            }
            DestinationKind::Store => {
                let config = StoreSinkConfig::from_merged(&merged)?;
                let empty = MembershipDelta::default();
                dispatch_store(
                    self.sink.as_ref(),
                    &self.router,
                    &config,
                    StoreDispatch {
                        profile: ctx.profile,
                        definition: ctx.definition,
                        params: ctx.params,
                        delta: ctx.delta.unwrap_or(&empty),
                    },
                )
                .await
            }
            DestinationKind::ServiceOperation => {
                let config = ServiceOperationConfig::from_merged(&merged)?;
                match ServiceOperation::from_name(&config.operation)? {
                    ServiceOperation::MarketingSegmentSync => {
                        let platform = self.marketing.as_ref().ok_or_else(|| {
                            SyncError::ServiceFailure(
                                "marketing platform credentials are not configured".to_string(),
                            )
                        })?;
                        sync_marketing_segment(
                            platform.as_ref(),
                            self.marketing_batch_size,
                            ctx.definition,
                            config.segment_name.as_deref(),
                            ctx.delta,
                        )
                        .await
                    }
                }
            }
        }
    }
}
