use crate::event::EventRecord;
use crate::translation::TranslationResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// What the action handler reports back for one dispatched event.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default)]
    pub result_data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionResponse {
    fn transport_failure(message: String) -> Self {
        Self {
            success: false,
            result_data: serde_json::Value::Null,
            error: Some(message),
        }
    }
}

#[derive(Serialize)]
struct ActionRequest<'a> {
    event: &'a EventRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    translation: Option<&'a TranslationResult>,
}

/// RPC boundary to the interaction/action handlers.
///
/// The router only depends on the request/response contract: one call per
/// admitted event, answered within a bounded timeout. Transport errors and
/// timeouts are folded into a `success=false` response; dispatch is a single
/// attempt, retries are the caller's business.
pub struct ActionClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl ActionClient {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self { client, url, timeout }
    }

    pub async fn dispatch(
        &self,
        event: &EventRecord,
        translation: Option<&TranslationResult>,
    ) -> ActionResponse {
        let request = ActionRequest { event, translation };

        let response = match self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Downstream dispatch transport error: {}", e);
                return ActionResponse::transport_failure(format!("downstream unreachable: {}", e));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            warn!("Downstream dispatch returned {}", status);
            return ActionResponse::transport_failure(format!("downstream returned {}", status));
        }

        match response.json::<ActionResponse>().await {
            Ok(action) => action,
            Err(e) => {
                warn!("Downstream dispatch returned malformed body: {}", e);
                ActionResponse::transport_failure(format!("malformed downstream response: {}", e))
            }
        }
    }
}
