//! Generic CalDAV adapter.
//!
//! Each mirrored event is one `{uid}.ics` resource in a calendar collection,
//! addressed by its UID (which doubles as the external id). Credentials are a
//! username and password sent with basic auth: the password travels in
//! `access_token`, the username in the `username` extra (falling back to the
//! account label), and the collection in the `calendar_url` extra unless the
//! adapter was built with one.

pub mod ics;
pub mod xml;

use std::time::Instant;

use async_trait::async_trait;
use billsync_core::error::parse_retry_after;
use billsync_core::{
    CalendarEvent, ConnectionResult, ConnectionStatus, Credential, DateRange, EventResult,
    ProviderAdapter, ProviderError, ValidationError,
};
use reqwest::header::{CONTENT_TYPE, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use url::Url;
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "caldav";

const ICS_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";
const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

#[derive(Debug, Clone, Default)]
pub struct CalDavAdapter {
    http: reqwest::Client,
    calendar_url: Option<String>,
}

impl CalDavAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collection used when the credential does not name one.
    pub fn with_calendar_url(mut self, url: impl Into<String>) -> Self {
        self.calendar_url = Some(url.into());
        self
    }

    fn collection(&self, credential: &Credential) -> Result<Url, ProviderError> {
        let raw = credential
            .extra("calendar_url")
            .or(self.calendar_url.as_deref())
            .ok_or_else(|| ProviderError::Auth("no CalDAV calendar URL configured".into()))?;
        let mut url = Url::parse(raw)
            .map_err(|e| {
                ValidationError::new("calendar_url", format!("'{raw}' is not a URL: {e}"))
            })?;
        // Collections are directories; make joins land inside them.
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    fn resource_url(&self, credential: &Credential, id: &str) -> Result<Url, ProviderError> {
        let mut url = self.collection(credential)?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Transient("calendar URL cannot be a base URL".into()))?
            .pop_if_empty()
            .push(&format!("{id}.ics"));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, credential: &Credential) -> RequestBuilder {
        let username = credential.extra("username").unwrap_or(&credential.account);
        self.http
            .request(method, url)
            .basic_auth(username, Some(&credential.access_token))
    }

    async fn put_event(
        &self,
        credential: &Credential,
        id: &str,
        event: &CalendarEvent,
        precondition: (reqwest::header::HeaderName, &'static str),
    ) -> Result<EventResult, ProviderError> {
        let url = self.resource_url(credential, id)?;
        let body = ics::generate(id, event);
        send(
            self.request(Method::PUT, url, credential)
                .header(CONTENT_TYPE, ICS_CONTENT_TYPE)
                .header(precondition.0, precondition.1)
                .body(body),
        )
        .await?;
        Ok(EventResult {
            external_id: id.to_string(),
            updated: None,
        })
    }
}

fn dav_method(name: &str) -> Result<Method, ProviderError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| ProviderError::Transient(format!("invalid method {name}: {e}")))
}

#[async_trait]
impl ProviderAdapter for CalDavAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn refresh_token(&self, _credential: &Credential) -> Result<Credential, ProviderError> {
        Err(ProviderError::Auth(
            "CalDAV passwords cannot be refreshed; reconnect with new credentials".into(),
        ))
    }

    async fn create_event(
        &self,
        credential: &Credential,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        let id = format!("billsync-{}", Uuid::new_v4());
        let result = self
            .put_event(credential, &id, event, (IF_NONE_MATCH, "*"))
            .await?;
        tracing::debug!(bill_id = event.bill_id, external_id = %id, "Created CalDAV event");
        Ok(result)
    }

    async fn update_event(
        &self,
        credential: &Credential,
        external_id: &str,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        // If-Match: * fails with 412 when the resource is gone.
        self.put_event(credential, external_id, event, (IF_MATCH, "*"))
            .await
            .map_err(|e| match e {
                ProviderError::Conflict(detail) => ProviderError::NotFound(detail),
                other => other,
            })
    }

    async fn delete_event(
        &self,
        credential: &Credential,
        external_id: &str,
    ) -> Result<(), ProviderError> {
        let url = self.resource_url(credential, external_id)?;
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
        let url = self.collection(credential)?;
        let response = send(
            self.request(dav_method("REPORT")?, url, credential)
                .header("Depth", "1")
                .header(CONTENT_TYPE, XML_CONTENT_TYPE)
                .body(xml::calendar_query(range.from, range.to)),
        )
        .await?;
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable REPORT response: {e}")))?;
        let resources = xml::parse_calendar_resources(&body)
            .map_err(|e| ProviderError::Transient(format!("malformed multistatus: {e}")))?;

        let events = resources
            .into_iter()
            .filter_map(|resource| {
                let id = xml::resource_id(&resource.href)?.to_string();
                let event = ics::parse(&resource.data)?;
                Some(event.with_external_id(Some(id)))
            })
            .collect();
        Ok(events)
    }

    async fn test_connection(
        &self,
        credential: &Credential,
    ) -> Result<ConnectionResult, ProviderError> {
        let started = Instant::now();
        let url = self.collection(credential)?;
        let outcome = send(
            self.request(dav_method("PROPFIND")?, url.clone(), credential)
                .header("Depth", "0")
                .header(CONTENT_TYPE, XML_CONTENT_TYPE)
                .body(xml::PROPFIND_DISPLAY_NAME),
        )
        .await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let (status, message) = match outcome {
            Ok(response) => {
                let body = response.text().await.unwrap_or_default();
                match xml::parse_display_name(&body) {
                    Ok(name) => {
                        let name = name.unwrap_or_else(|| "calendar".into());
                        (ConnectionStatus::Connected, format!("Connected to {name} ({url})"))
                    }
                    Err(e) => (
                        ConnectionStatus::Failed,
                        format!("malformed PROPFIND response: {e}"),
                    ),
                }
            }
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
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Transient(format!("CalDAV request failed: {e}")))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    if status == StatusCode::SERVICE_UNAVAILABLE && retry_after.is_some() {
        return Err(ProviderError::RateLimited { retry_after });
    }
    let detail = response.text().await.unwrap_or_default();
    let detail = if detail.trim().is_empty() {
        status.to_string()
    } else {
        detail
    };
    Err(ProviderError::from_http_status(status.as_u16(), retry_after, detail))
}
