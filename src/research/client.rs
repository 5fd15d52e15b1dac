//! HTTP client for the external Interactions research API.
//!
//! Two calls: create an interaction (`POST {base}/interactions`) and fetch
//! its current state (`GET {base}/interactions/{id}`). Research jobs run in
//! the background on the provider side for 5–15 minutes; this client never
//! waits for them — polling cadence is the governor's job.
//!
//! Failure contract: a non-success HTTP status becomes
//! [`BackendError::Http`] carrying the response body verbatim, so callers
//! can surface the provider's own message. No retries here.

use serde::{Deserialize, Serialize};
use std::future::Future;

/// One unit of remote work as the provider reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    pub id: String,
    /// Provider status string. Treated as opaque except for
    /// `"completed"` / `"failed"`; anything else means still running.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub outputs: Vec<InteractionOutput>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InteractionOutput {
    #[serde(default)]
    pub text: Option<String>,
}

impl Interaction {
    /// Text of the last output item — the provider appends progress
    /// snapshots, so the final item is the full report.
    pub fn final_output_text(&self) -> Option<&str> {
        self.outputs.iter().rev().find_map(|o| o.text.as_deref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("research backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("research backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Seam between the governor and the remote research provider.
///
/// The governor is written against this trait so its timing and persistence
/// behavior can be exercised without a network.
pub trait ResearchBackend: Send + Sync {
    /// Start a new background interaction. `previous_interaction_id` chains
    /// the new job onto a prior one's context.
    fn start_interaction(
        &self,
        credential: &str,
        query: &str,
        previous_interaction_id: Option<&str>,
    ) -> impl Future<Output = Result<Interaction, BackendError>> + Send;

    /// Fetch the current remote state of an interaction.
    fn get_interaction(
        &self,
        credential: &str,
        interaction_id: &str,
    ) -> impl Future<Output = Result<Interaction, BackendError>> + Send;
}

// ─── HTTP implementation ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateInteractionBody<'a> {
    input: &'a str,
    agent: &'a str,
    background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_interaction_id: Option<&'a str>,
}

pub struct HttpResearchBackend {
    client: reqwest::Client,
    base_url: String,
    agent_model: String,
}

impl HttpResearchBackend {
    pub fn new(base_url: &str, agent_model: &str, timeout_secs: u64) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_model: agent_model.to_string(),
        })
    }

    /// Turn a non-success response into `BackendError::Http` with the body
    /// text; pass success responses through.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

impl ResearchBackend for HttpResearchBackend {
    async fn start_interaction(
        &self,
        credential: &str,
        query: &str,
        previous_interaction_id: Option<&str>,
    ) -> Result<Interaction, BackendError> {
        let url = format!("{}/interactions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", credential)
            .json(&CreateInteractionBody {
                input: query,
                agent: &self.agent_model,
                background: true,
                previous_interaction_id,
            })
            .send()
            .await?;

        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn get_interaction(
        &self,
        credential: &str,
        interaction_id: &str,
    ) -> Result<Interaction, BackendError> {
        let url = format!("{}/interactions/{}", self.base_url, interaction_id);
        let resp = self
            .client
            .get(&url)
            .header("x-goog-api-key", credential)
            .send()
            .await?;

        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_interaction_posts_and_parses_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/interactions")
            .match_header("x-goog-api-key", "sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"int-123","status":"in_progress"}"#)
            .create_async()
            .await;

        let backend = HttpResearchBackend::new(&server.url(), "deep-research-test", 5).unwrap();
        let interaction = backend
            .start_interaction("sk-test", "why is the sky blue", None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(interaction.id, "int-123");
        assert_eq!(interaction.status.as_deref(), Some("in_progress"));
    }

    #[tokio::test]
    async fn non_success_status_carries_response_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/interactions/int-404")
            .with_status(404)
            .with_body("interaction not found")
            .create_async()
            .await;

        let backend = HttpResearchBackend::new(&server.url(), "deep-research-test", 5).unwrap();
        let err = backend
            .get_interaction("sk-test", "int-404")
            .await
            .unwrap_err();

        match err {
            BackendError::Http { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "interaction not found");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[test]
    fn final_output_is_the_last_item_with_text() {
        let interaction = Interaction {
            id: "int-1".into(),
            status: Some("completed".into()),
            outputs: vec![
                InteractionOutput { text: Some("X".into()) },
                InteractionOutput { text: Some("Y".into()) },
            ],
            error: None,
        };
        assert_eq!(interaction.final_output_text(), Some("Y"));

        let empty = Interaction {
            id: "int-2".into(),
            status: Some("completed".into()),
            outputs: vec![],
            error: None,
        };
        assert_eq!(empty.final_output_text(), None);
    }
}
