//! Data-request registration: trade a request for a subscription token.

use sluice_protocol::{DataRequest, DataRequestResponse, Token, REGISTER_PATH};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("registration rejected: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("registration returned an empty token")]
    EmptyToken,

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct RegistrationClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistrationClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, REGISTER_PATH)
    }

    /// POST the request and return the token the service issued.
    pub async fn register(&self, request: &DataRequest) -> Result<Token, RegistrationError> {
        let url = self.endpoint();
        tracing::debug!(%url, user_id = %request.user_id, resource_id = %request.resource_id, "registering data request");

        let resp = self.http.post(&url).json(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%url, status = status.as_u16(), "registration rejected");
            return Err(RegistrationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let response: DataRequestResponse = resp.json().await?;
        if response.token.is_empty() {
            return Err(RegistrationError::EmptyToken);
        }
        tracing::info!(token = %response.token, "data request registered");
        Ok(response.token)
    }
}
