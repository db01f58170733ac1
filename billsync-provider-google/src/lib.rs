//! Google Calendar adapter.
//!
//! Talks to the Calendar v3 REST API with a bearer token. Events are written
//! to the calendar named by the credential's `calendar_id` extra (default
//! `primary`) and tagged with a private extended property holding the bill id.

mod convert;
pub mod types;

use std::time::Instant;

use async_trait::async_trait;
use billsync_core::error::parse_retry_after;
use billsync_core::{
    CalendarEvent, ConnectionResult, ConnectionStatus, Credential, DateRange, EventResult,
    ProviderAdapter, ProviderError,
};
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use url::Url;

pub use convert::{BILL_ID_PROPERTY, nearest_color_id};
use types::{ApiErrorBody, CalendarInfo, EventList, GoogleEvent, TokenResponse};

pub const PROVIDER_NAME: &str = "google";
pub const API_BASE: &str = "https://www.googleapis.com/calendar/v3";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

const DEFAULT_CALENDAR: &str = "primary";
const PAGE_SIZE: &str = "250";

#[derive(Debug, Clone)]
pub struct GoogleAdapter {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    token_url: String,
    revoke_url: String,
}

impl GoogleAdapter {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        GoogleAdapter {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: API_BASE.to_string(),
            token_url: TOKEN_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
        }
    }

    /// Point the adapter at different endpoints (used against mock servers).
    pub fn with_endpoints(
        mut self,
        api_base: impl Into<String>,
        token_url: impl Into<String>,
        revoke_url: impl Into<String>,
    ) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self.revoke_url = revoke_url.into();
        self
    }

    fn calendar_id(credential: &Credential) -> &str {
        credential.extra("calendar_id").unwrap_or(DEFAULT_CALENDAR)
    }

    /// `{api_base}/calendars/{calendar}/{segments...}` with each segment escaped.
    fn calendar_url(
        &self,
        credential: &Credential,
        segments: &[&str],
    ) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| {
                ProviderError::Transient(format!("invalid API base {}: {e}", self.api_base))
            })?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ProviderError::Transient(format!(
                    "API base cannot be a base URL: {}",
                    self.api_base
                ))
            })?;
            path.pop_if_empty()
                .push("calendars")
                .push(Self::calendar_id(credential));
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, credential: &Credential) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&credential.access_token)
    }

    async fn write_event(
        &self,
        method: Method,
        url: Url,
        credential: &Credential,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        let body = convert::to_google(event);
        let response = send(self.request(method, url, credential).json(&body)).await?;
        let written: GoogleEvent = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable Google response: {e}")))?;
        let external_id = written
            .id
            .ok_or_else(|| ProviderError::Transient("Google response carried no event id".into()))?;
        Ok(EventResult {
            external_id,
            updated: written.updated,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn refresh_token(&self, credential: &Credential) -> Result<Credential, ProviderError> {
        let Some(refresh_token) = credential.refresh_token.as_deref() else {
            return Err(ProviderError::Auth("no refresh token stored".into()));
        };

        let response = send(self.http.post(&self.token_url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ]))
        .await
        .map_err(|e| match e {
            // invalid_grant comes back as 400
            ProviderError::Validation(v) => ProviderError::Auth(v.message),
            other => other,
        })?;

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable token response: {e}")))?;

        let mut fresh = credential.clone();
        fresh.access_token = tokens.access_token;
        fresh.expires_at = Some(Utc::now() + chrono::Duration::seconds(tokens.expires_in));
        // Google usually omits the refresh token on refresh.
        if let Some(rotated) = tokens.refresh_token {
            fresh.refresh_token = Some(rotated);
        }
        Ok(fresh)
    }

    async fn revoke(&self, credential: &Credential) -> Result<(), ProviderError> {
        let token = credential
            .refresh_token
            .as_deref()
            .unwrap_or(&credential.access_token);
        send(self.http.post(&self.revoke_url).form(&[("token", token)])).await?;
        Ok(())
    }

    async fn create_event(
        &self,
        credential: &Credential,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        let url = self.calendar_url(credential, &["events"])?;
        let result = self.write_event(Method::POST, url, credential, event).await?;
        tracing::debug!(
            bill_id = event.bill_id,
            external_id = %result.external_id,
            "Created Google event"
        );
        Ok(result)
    }

    async fn update_event(
        &self,
        credential: &Credential,
        external_id: &str,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        let url = self.calendar_url(credential, &["events", external_id])?;
        self.write_event(Method::PUT, url, credential, event).await
    }

    async fn delete_event(
        &self,
        credential: &Credential,
        external_id: &str,
    ) -> Result<(), ProviderError> {
        let url = self.calendar_url(credential, &["events", external_id])?;
        match send(self.request(Method::DELETE, url, credential)).await {
            Ok(_) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_events(
        &self,
        credential: &Credential,
        range: &DateRange,
    ) -> Result<Vec<CalendarEvent>, ProviderError> {
        let url = self.calendar_url(credential, &["events"])?;
        let (time_min, time_max) = (range.from_rfc3339(), range.to_rfc3339());
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let request = {
                let mut query = vec![
                    ("timeMin", time_min.as_str()),
                    ("timeMax", time_max.as_str()),
                    ("singleEvents", "true"),
                    ("maxResults", PAGE_SIZE),
                ];
                if let Some(token) = page_token.as_deref() {
                    query.push(("pageToken", token));
                }
                self.request(Method::GET, url.clone(), credential).query(&query)
            };
            let response = send(request).await?;
            let page: EventList = response
                .json()
                .await
                .map_err(|e| ProviderError::Transient(format!("unreadable event list: {e}")))?;

            events.extend(page.items.into_iter().filter_map(convert::from_google));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(events)
    }

    async fn test_connection(
        &self,
        credential: &Credential,
    ) -> Result<ConnectionResult, ProviderError> {
        let started = Instant::now();
        let url = self.calendar_url(credential, &[])?;
        let outcome = send(self.request(Method::GET, url, credential)).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let (status, message) = match outcome {
            Ok(response) => match response.json::<CalendarInfo>().await {
                Ok(calendar) => (
                    ConnectionStatus::Connected,
                    format!("Connected to calendar {} ({})", calendar.summary, calendar.id),
                ),
                Err(e) => (ConnectionStatus::Failed, format!("unreadable calendar metadata: {e}")),
            },
            Err(e) => (ConnectionStatus::Failed, e.to_string()),
        };
        Ok(ConnectionResult {
            provider: PROVIDER_NAME.to_string(),
            status,
            account: Some(credential.account.clone()),
            response_time_ms,
            message,
        })
    }
}

/// Send a request and fold non-success responses into [`ProviderError`].
async fn send(request: RequestBuilder) -> Result<Response, ProviderError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();

    // Google reports quota exhaustion as 403 with a rate-limit reason.
    let throttled = parsed
        .error
        .errors
        .iter()
        .any(|e| matches!(e.reason.as_str(), "rateLimitExceeded" | "userRateLimitExceeded"));
    if status == StatusCode::FORBIDDEN && throttled {
        return Err(ProviderError::RateLimited { retry_after });
    }

    let detail = if parsed.error.message.is_empty() {
        body
    } else {
        parsed.error.message
    };
    Err(ProviderError::from_http_status(status.as_u16(), retry_after, detail))
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Transient(format!("request to Google failed: {e}"))
}
