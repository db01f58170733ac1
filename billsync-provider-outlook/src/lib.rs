//! Microsoft Outlook adapter over the Graph v1.0 calendar API.
//!
//! Events go to the signed-in user's default calendar, or to the calendar
//! named by the credential's `calendar_id` extra. Each event carries a
//! single-value extended property holding the bill id; listing expands that
//! property so events map back to bills.

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

pub use convert::{BILL_CATEGORY, BILL_ID_PROPERTY};
use types::{CalendarInfo, EventPage, GraphErrorBody, GraphEvent, TokenResponse};

pub const PROVIDER_NAME: &str = "outlook";
pub const API_BASE: &str = "https://graph.microsoft.com/v1.0";
pub const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

const SCOPES: &str = "offline_access Calendars.ReadWrite";
const PREFER_UTC: &str = r#"outlook.timezone="UTC""#;
const PREFER_TEXT_BODY: &str = r#"outlook.body-content-type="text""#;
const PAGE_SIZE: &str = "100";

#[derive(Debug, Clone)]
pub struct OutlookAdapter {
    http: reqwest::Client,
    client_id: String,
    /// Absent for public (desktop) app registrations.
    client_secret: Option<String>,
    api_base: String,
    token_url: String,
}

impl OutlookAdapter {
    pub fn new(client_id: impl Into<String>) -> Self {
        OutlookAdapter {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: None,
            api_base: API_BASE.to_string(),
            token_url: TOKEN_URL.to_string(),
        }
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Point the adapter at different endpoints (used against mock servers).
    pub fn with_endpoints(
        mut self,
        api_base: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self
    }

    /// `{api_base}/me/{calendar scope}/{segments...}`
    fn me_url(&self, credential: &Credential, segments: &[&str]) -> Result<Url, ProviderError> {
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
            path.pop_if_empty().push("me");
            match credential.extra("calendar_id") {
                Some(calendar) => {
                    path.push("calendars").push(calendar);
                }
                None => {
                    path.push("calendar");
                }
            }
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, credential: &Credential) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&credential.access_token)
            .header("Prefer", PREFER_UTC)
    }

    async fn write_event(
        &self,
        method: Method,
        url: Url,
        credential: &Credential,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        let body = convert::to_graph(event);
        let response = send(self.request(method, url, credential).json(&body)).await?;
        let written: GraphEvent = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable Graph response: {e}")))?;
        let external_id = written
            .id
            .ok_or_else(|| ProviderError::Transient("Graph response carried no event id".into()))?;
        Ok(EventResult {
            external_id,
            updated: written.last_modified_date_time,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OutlookAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn refresh_token(&self, credential: &Credential) -> Result<Credential, ProviderError> {
        let Some(refresh_token) = credential.refresh_token.as_deref() else {
            return Err(ProviderError::Auth("no refresh token stored".into()));
        };

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("scope", SCOPES),
        ];
        if let Some(secret) = self.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = send(self.http.post(&self.token_url).form(&form))
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
        // Microsoft rotates refresh tokens.
        if let Some(rotated) = tokens.refresh_token {
            fresh.refresh_token = Some(rotated);
        }
        Ok(fresh)
    }

    async fn create_event(
        &self,
        credential: &Credential,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        let url = self.me_url(credential, &["events"])?;
        let result = self.write_event(Method::POST, url, credential, event).await?;
        tracing::debug!(
            bill_id = event.bill_id,
            external_id = %result.external_id,
            "Created Outlook event"
        );
        Ok(result)
    }

    async fn update_event(
        &self,
        credential: &Credential,
        external_id: &str,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        let url = self.me_url(credential, &["events", external_id])?;
        self.write_event(Method::PATCH, url, credential, event).await
    }

    async fn delete_event(
        &self,
        credential: &Credential,
        external_id: &str,
    ) -> Result<(), ProviderError> {
        let url = self.me_url(credential, &["events", external_id])?;
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
        let mut url = self.me_url(credential, &["calendarView"])?;
        url.query_pairs_mut()
            .append_pair("startDateTime", &range.from_rfc3339())
            .append_pair("endDateTime", &range.to_rfc3339())
            .append_pair("$top", PAGE_SIZE)
            .append_pair(
                "$expand",
                &format!("singleValueExtendedProperties($filter=id eq '{BILL_ID_PROPERTY}')"),
            );

        let mut events = Vec::new();
        let mut next = Some(url);
        while let Some(page_url) = next.take() {
            let response = send(
                self.request(Method::GET, page_url, credential)
                    .header("Prefer", PREFER_TEXT_BODY),
            )
            .await?;
            let page: EventPage = response
                .json()
                .await
                .map_err(|e| ProviderError::Transient(format!("unreadable calendar view: {e}")))?;

            events.extend(page.value.into_iter().filter_map(convert::from_graph));
            next = page
                .next_link
                .map(|link| {
                    Url::parse(&link).map_err(|e| {
                        ProviderError::Transient(format!("invalid nextLink {link}: {e}"))
                    })
                })
                .transpose()?;
        }
        Ok(events)
    }

    async fn test_connection(
        &self,
        credential: &Credential,
    ) -> Result<ConnectionResult, ProviderError> {
        let started = Instant::now();
        let url = self.me_url(credential, &[])?;
        let outcome = send(self.request(Method::GET, url, credential)).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let (status, message) = match outcome {
            Ok(response) => match response.json::<CalendarInfo>().await {
                Ok(calendar) => (
                    ConnectionStatus::Connected,
                    format!("Connected to calendar {} ({})", calendar.name, calendar.id),
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
    let parsed: GraphErrorBody = serde_json::from_str(&body).unwrap_or_default();

    // Graph throttles with 503 plus Retry-After as well as 429.
    if status == StatusCode::SERVICE_UNAVAILABLE && retry_after.is_some() {
        return Err(ProviderError::RateLimited { retry_after });
    }

    let detail = match (parsed.error.code.is_empty(), parsed.error.message.is_empty()) {
        (_, true) => body,
        (true, false) => parsed.error.message,
        (false, false) => format!("{}: {}", parsed.error.code, parsed.error.message),
    };
    Err(ProviderError::from_http_status(status.as_u16(), retry_after, detail))
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Transient(format!("request to Microsoft Graph failed: {e}"))
}
