use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("rentcal/", env!("CARGO_PKG_VERSION"));

/// Downloads the raw iCalendar payload behind an external calendar URL.
#[async_trait]
pub trait IcsFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestIcsFetcher {
    client: Client,
    timeout: Duration,
}

impl ReqwestIcsFetcher {
    pub fn new(timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| InfraError::Fetch(format!("failed to build http client: {error}")))?;
        Ok(Self { client, timeout })
    }

    /// `webcal://` is the calendar-subscription spelling of `https://`.
    pub fn request_url(url: &str) -> String {
        let url = url.trim();
        match url.strip_prefix("webcal://") {
            Some(rest) => format!("https://{rest}"),
            None => url.to_string(),
        }
    }

    fn http_error(status: reqwest::StatusCode, body: &str) -> InfraError {
        let body = body.trim();
        let message = if body.is_empty() {
            format!("ics feed error: http {}", status.as_u16())
        } else {
            let excerpt: String = body.chars().take(200).collect();
            format!("ics feed error: http {}; body={excerpt}", status.as_u16())
        };
        InfraError::Fetch(message)
    }

    fn transport_error(&self, error: reqwest::Error) -> InfraError {
        if error.is_timeout() {
            return InfraError::Timeout(self.timeout.as_millis() as u64);
        }
        InfraError::Fetch(format!("network error while fetching ics feed: {error}"))
    }
}

#[async_trait]
impl IcsFetcher for ReqwestIcsFetcher {
    async fn fetch(&self, url: &str) -> Result<String, InfraError> {
        if url.trim().is_empty() {
            return Err(InfraError::Validation("ics url must not be empty".to_string()));
        }

        let response = self
            .client
            .get(Self::request_url(url))
            .header(reqwest::header::ACCEPT, "text/calendar, */*;q=0.5")
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| self.transport_error(error))?;

        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(body)
    }
}
