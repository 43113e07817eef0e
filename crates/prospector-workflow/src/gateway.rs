use std::sync::Arc;
use std::time::Instant;

use prospector_adapters::{ModelClient, ModelError, OutputSchema};
use prospector_storage::{ResilienceError, ResilientExecutor};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::metrics::PollerMetrics;

/// Circuit name shared by every model call.
pub const MODEL_DEPENDENCY: &str = "model";

/// Every model call in the workflow goes through here so retries, the shared
/// circuit and latency accounting are applied uniformly.
#[derive(Clone)]
pub struct ModelGateway {
    model: Arc<dyn ModelClient>,
    executor: ResilientExecutor,
    metrics: Arc<PollerMetrics>,
}

impl ModelGateway {
    pub fn new(model: Arc<dyn ModelClient>, executor: ResilientExecutor, metrics: Arc<PollerMetrics>) -> Self {
        Self {
            model,
            executor,
            metrics,
        }
    }

    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<PollerMetrics> {
        &self.metrics
    }

    pub async fn infer(
        &self,
        prompt: &str,
        schema: OutputSchema,
    ) -> Result<JsonValue, ResilienceError<ModelError>> {
        let started = Instant::now();
        let result = self
            .executor
            .call(MODEL_DEPENDENCY, || self.model.infer(prompt, schema))
            .await;
        self.metrics
            .record_model_latency_ms(started.elapsed().as_millis() as u64);

        if let Err(err) = &result {
            if err.is_circuit_open() {
                self.metrics.inc_circuit_rejections();
                warn!(schema = schema.name(), "model circuit open, call skipped");
            }
        }
        result
    }
}
