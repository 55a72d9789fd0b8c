//! Stage processor trait and wire types.

use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::Organization;
use crate::registry::StageDefinition;

/// Completed upstream payloads, in sequence order.
///
/// Serializes as a JSON object whose keys keep sequence order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorOutputs {
    entries: Vec<(String, serde_json::Value)>,
}

impl PriorOutputs {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an output. Callers append in sequence order.
    pub fn push(&mut self, stage_id: impl Into<String>, payload: serde_json::Value) {
        self.entries.push((stage_id.into(), payload));
    }

    /// Returns the output of an upstream stage, if it completed.
    #[must_use]
    pub fn get(&self, stage_id: &str) -> Option<&serde_json::Value> {
        self.entries
            .iter()
            .find(|(id, _)| id == stage_id)
            .map(|(_, payload)| payload)
    }

    /// Returns true if the upstream stage completed.
    #[must_use]
    pub fn contains(&self, stage_id: &str) -> bool {
        self.get(stage_id).is_some()
    }

    /// Stage ids in sequence order.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Iterates over `(stage_id, payload)` pairs in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(id, payload)| (id.as_str(), payload))
    }

    /// Number of outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no upstream stage has completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PriorOutputs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (stage_id, payload) in &self.entries {
            map.serialize_entry(stage_id, payload)?;
        }
        map.end()
    }
}

/// Input handed to a stage processor.
///
/// Only `organization` and `priorStageOutputs` go on the wire; the stage
/// travels in the endpoint path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    /// Stage being executed.
    #[serde(skip)]
    pub stage: StageDefinition,
    /// Organization context.
    pub organization: Organization,
    /// Completed upstream outputs.
    pub prior_stage_outputs: PriorOutputs,
    /// Run that issued the request.
    #[serde(skip)]
    pub run_id: String,
    /// One-based attempt number.
    #[serde(skip)]
    pub attempt: u32,
}

/// Response from a stage processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResponse {
    /// Whether the stage succeeded.
    pub success: bool,
    /// Stage payload on success.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResponse {
    /// Creates a successful response.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates a failed response.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl From<anyhow::Result<serde_json::Value>> for StageResponse {
    fn from(result: anyhow::Result<serde_json::Value>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::fail(format!("{e:#}")),
        }
    }
}

/// An external stage computation, treated as a black box.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Runs the stage once. Implementations should not retry internally.
    async fn process(&self, request: &StageRequest) -> StageResponse;
}

/// A processor backed by an async closure.
///
/// Errors returned by the closure become failed responses.
pub struct FnProcessor<F, Fut>
where
    F: Fn(StageRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProcessor<F, Fut>
where
    F: Fn(StageRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    /// Creates a new closure-backed processor.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnProcessor<F, Fut>
where
    F: Fn(StageRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProcessor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> StageProcessor for FnProcessor<F, Fut>
where
    F: Fn(StageRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn process(&self, request: &StageRequest) -> StageResponse {
        (self.func)(request.clone()).await.into()
    }
}

/// Dispatches each stage to the processor registered for its id.
#[derive(Default, Clone)]
pub struct ProcessorRouter {
    routes: HashMap<String, Arc<dyn StageProcessor>>,
    fallback: Option<Arc<dyn StageProcessor>>,
}

impl ProcessorRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor for a stage id.
    #[must_use]
    pub fn route(mut self, stage_id: impl Into<String>, processor: Arc<dyn StageProcessor>) -> Self {
        self.routes.insert(stage_id.into(), processor);
        self
    }

    /// Sets the processor used for stages without a route.
    #[must_use]
    pub fn fallback(mut self, processor: Arc<dyn StageProcessor>) -> Self {
        self.fallback = Some(processor);
        self
    }

    /// Returns true if a stage has a dedicated route.
    #[must_use]
    pub fn has_route(&self, stage_id: &str) -> bool {
        self.routes.contains_key(stage_id)
    }
}

impl Debug for ProcessorRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<&String> = self.routes.keys().collect();
        routes.sort();
        f.debug_struct("ProcessorRouter")
            .field("routes", &routes)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait]
impl StageProcessor for ProcessorRouter {
    async fn process(&self, request: &StageRequest) -> StageResponse {
        match self.routes.get(request.stage.id()).or(self.fallback.as_ref()) {
            Some(processor) => processor.process(request).await,
            None => StageResponse::fail(format!(
                "no processor registered for stage '{}'",
                request.stage.id()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{acme, market_registry};
    use serde_json::json;

    fn request(stage_id: &str) -> StageRequest {
        let registry = market_registry();
        StageRequest {
            stage: registry.get(stage_id).unwrap().clone(),
            organization: acme(),
            prior_stage_outputs: PriorOutputs::new(),
            run_id: "run-1".to_string(),
            attempt: 1,
        }
    }

    #[test]
    fn test_prior_outputs_keep_sequence_order_on_wire() {
        let mut prior = PriorOutputs::new();
        prior.push("media", json!({"mentions": 3}));
        prior.push("competitors", json!({"rivals": 2}));

        let text = serde_json::to_string(&prior).unwrap();
        assert_eq!(text, r#"{"media":{"mentions":3},"competitors":{"rivals":2}}"#);
        assert_eq!(prior.stage_ids(), vec!["media", "competitors"]);
        assert!(prior.contains("competitors"));
        assert!(!prior.contains("trends"));
    }

    #[test]
    fn test_request_wire_shape() {
        let mut req = request("media");
        req.prior_stage_outputs.push("competitors", json!({"rivals": 2}));

        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["organization"]["name"], "Acme Corp");
        assert_eq!(body["priorStageOutputs"]["competitors"]["rivals"], 2);
        assert!(body.get("run_id").is_none());
        assert!(body.get("stage").is_none());
    }

    #[test]
    fn test_response_decodes_without_error_field() {
        let response: StageResponse =
            serde_json::from_str(r#"{"success": true, "data": {"ok": 1}}"#).unwrap();
        assert_eq!(response, StageResponse::ok(json!({"ok": 1})));
    }

    #[tokio::test]
    async fn test_fn_processor_maps_errors() {
        let processor = FnProcessor::new(|req: StageRequest| async move {
            if req.stage.id() == "media" {
                anyhow::bail!("quota exceeded")
            }
            Ok(json!({"stage": req.stage.id()}))
        });

        let ok = processor.process(&request("competitors")).await;
        assert!(ok.success);

        let failed = processor.process(&request("media")).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn test_router_dispatches_by_stage() {
        let media: Arc<dyn StageProcessor> =
            Arc::new(FnProcessor::new(|_req: StageRequest| async { Ok(json!("media")) }));
        let router = ProcessorRouter::new().route("media", media);

        assert!(router.has_route("media"));
        assert_eq!(router.process(&request("media")).await.data, Some(json!("media")));

        let missing = router.process(&request("trends")).await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("trends"));
    }
}
