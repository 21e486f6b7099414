use crate::downstream::ActionClient;
use crate::error::FieldError;
use crate::event::EventRecord;
use crate::ratelimit::{LimitStatus, RateLimiter};
use crate::translation::{Enricher, TranslationResult};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::debug;

/// Batch admission bounds. Outside 1..=100 the whole call is rejected
/// before any item is processed.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ItemMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<TranslationResult>,
}

/// Outcome of one event's pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present when the item was denied by the rate limiter; carries the
    /// window reset time so callers can back off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<LimitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ItemMetadata>,
}

/// Aggregated response for one submitted batch. Result order always matches
/// submission order, regardless of completion order.
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub results: Vec<ItemResult>,
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchResult {
    fn from_ordered(results: Vec<ItemResult>) -> Self {
        let total_count = results.len();
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            failure_count: total_count - success_count,
            total_count,
            success_count,
            results,
        }
    }
}

/// Orchestrates the per-event pipeline (enrich, rate-limit, dispatch) and
/// runs batches as bounded concurrent sets of independent pipelines.
pub struct Dispatcher {
    enricher: Enricher,
    limiter: std::sync::Arc<RateLimiter>,
    downstream: ActionClient,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(
        enricher: Enricher,
        limiter: std::sync::Arc<RateLimiter>,
        downstream: ActionClient,
        concurrency: usize,
    ) -> Self {
        Self {
            enricher,
            limiter,
            downstream,
            concurrency: concurrency.max(1),
        }
    }

    /// Run the full pipeline for one already-normalized event.
    ///
    /// Enrichment failures degrade to "no translation"; a rate-limit denial
    /// short-circuits before any downstream call. Nothing here panics on a
    /// bad event - the worst outcome is a failed `ItemResult`.
    pub async fn dispatch_one(&self, event: EventRecord) -> ItemResult {
        let translation = self.enricher.enrich(&event).await;
        let metadata = translation.as_ref().map(|t| ItemMetadata {
            translation: Some(t.clone()),
        });

        let status = self
            .limiter
            .increment(&event.channel_id, &event.user_id, event.limit_type())
            .await;

        if !status.allowed {
            debug!(
                "Rate limit exceeded for user {} in community {}",
                event.user_id, event.channel_id
            );
            return ItemResult {
                success: false,
                result_data: None,
                error: Some("rate limit exceeded".to_string()),
                rate_limit: Some(status),
                metadata,
            };
        }

        let response = self.downstream.dispatch(&event, translation.as_ref()).await;
        ItemResult {
            success: response.success,
            result_data: if response.result_data.is_null() {
                None
            } else {
                Some(response.result_data)
            },
            error: response.error,
            rate_limit: None,
            metadata,
        }
    }

    /// Run a batch of 1..=100 events as independent concurrent pipelines.
    ///
    /// Concurrency is bounded by the configured ceiling; one item's failure
    /// never cancels its siblings. Results are re-assembled into submission
    /// order before returning.
    pub async fn dispatch_batch(
        &self,
        events: Vec<EventRecord>,
    ) -> Result<BatchResult, Vec<FieldError>> {
        validate_batch_size(events.len())?;

        let mut indexed: Vec<(usize, ItemResult)> = stream::iter(events.into_iter().enumerate())
            .map(|(index, event)| async move { (index, self.dispatch_one(event).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        let results = indexed.into_iter().map(|(_, result)| result).collect();
        Ok(BatchResult::from_ordered(results))
    }
}

/// Admission gate at the batch boundary, distinct from per-item outcomes.
pub fn validate_batch_size(len: usize) -> Result<(), Vec<FieldError>> {
    if len == 0 {
        return Err(vec![FieldError::new(
            "events",
            "batch must contain at least 1 event",
            "length",
        )]);
    }
    if len > MAX_BATCH_SIZE {
        return Err(vec![FieldError::new(
            "events",
            format!("batch must contain at most {} events, got {}", MAX_BATCH_SIZE, len),
            "length",
        )]);
    }
    Ok(())
}
