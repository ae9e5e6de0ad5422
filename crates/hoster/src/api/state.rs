//! Shared handler state and the per-instance extractor.

use std::sync::Arc;

use axum::extract::{FromRequestParts, RawPathParams};
use axum::http::request::Parts;

use crate::api::error::ApiError;
use crate::instance::{InstanceRegistry, ServerInstance};

#[derive(Clone)]
pub struct AppState {
    pub instances: Arc<InstanceRegistry>,
    /// Instance addressed by the unprefixed routes.
    pub default_instance: String,
}

impl AppState {
    pub fn new(instances: Arc<InstanceRegistry>, default_instance: impl Into<String>) -> Self {
        Self {
            instances,
            default_instance: default_instance.into(),
        }
    }
}

/// The instance a request targets: the `{instance}` path segment when
/// present, the default instance otherwise.
pub struct InstanceRef(pub Arc<ServerInstance>);

impl FromRequestParts<AppState> for InstanceRef {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let named = RawPathParams::from_request_parts(parts, state)
            .await
            .ok()
            .and_then(|params| {
                params
                    .iter()
                    .find(|(key, _)| *key == "instance")
                    .map(|(_, value)| value.to_string())
            });
        let name = named.unwrap_or_else(|| state.default_instance.clone());

        state
            .instances
            .get(&name)
            .map(InstanceRef)
            .ok_or_else(|| ApiError::not_found(format!("Unknown server instance: {}", name)))
    }
}
