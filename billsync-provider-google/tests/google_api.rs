use billsync_core::{
    CalendarEvent, Credential, DateRange, ErrorKind, ProviderAdapter, ProviderError, Reminder,
};
use billsync_provider_google::GoogleAdapter;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{
    body_partial_json, body_string_contains, header, method, path, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn make_test_adapter(server: &MockServer) -> GoogleAdapter {
    GoogleAdapter::new("client-id", "client-secret").with_endpoints(
        server.uri(),
        format!("{}/token", server.uri()),
        format!("{}/revoke", server.uri()),
    )
}

fn make_test_credential() -> Credential {
    let mut credential = Credential::new("me@example.com", "access-1");
    credential.refresh_token = Some("refresh-1".into());
    credential
}

fn make_test_event() -> CalendarEvent {
    let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
    CalendarEvent {
        bill_id: 7,
        external_id: None,
        title: "[Bill] Rent - $1200.00".into(),
        description: "Due 2025-03-01".into(),
        start,
        end: start + Duration::days(1),
        all_day: true,
        reminders: vec![Reminder::popup(1440)],
        color: Some("#dc2127".into()),
        location: None,
        updated: None,
    }
}

#[tokio::test]
async fn create_posts_tagged_all_day_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/calendars/primary/events"))
        .and(header("authorization", "Bearer access-1"))
        .and(body_partial_json(json!({
            "summary": "[Bill] Rent - $1200.00",
            "start": { "date": "2025-03-01" },
            "end": { "date": "2025-03-02" },
            "colorId": "11",
            "extendedProperties": { "private": { "billsync_bill_id": "7" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "evt-123",
            "summary": "[Bill] Rent - $1200.00",
            "updated": "2025-02-01T10:00:00.000Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = make_test_adapter(&server)
        .create_event(&make_test_credential(), &make_test_event())
        .await
        .unwrap();

    assert_eq!(result.external_id, "evt-123");
    assert_eq!(result.updated, Some(Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap()));
}

#[tokio::test]
async fn delete_of_missing_event_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/calendars/primary/events/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    make_test_adapter(&server)
        .delete_event(&make_test_credential(), "gone")
        .await
        .unwrap();
}

#[tokio::test]
async fn quota_errors_become_rate_limits() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/calendars/primary/events/evt-1"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("Retry-After", "60")
                .set_body_json(json!({
                    "error": {
                        "code": 403,
                        "message": "Rate Limit Exceeded",
                        "errors": [{ "reason": "rateLimitExceeded" }]
                    }
                })),
        )
        .mount(&server)
        .await;

    let err = make_test_adapter(&server)
        .update_event(&make_test_credential(), "evt-1", &make_test_event())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ProviderError::RateLimited {
            retry_after: Some(std::time::Duration::from_secs(60))
        }
    );
}

#[tokio::test]
async fn forbidden_without_quota_reason_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/calendars/primary/events"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": 403, "message": "Insufficient Permission", "errors": [{ "reason": "insufficientPermissions" }] }
        })))
        .mount(&server)
        .await;

    let err = make_test_adapter(&server)
        .create_event(&make_test_credential(), &make_test_event())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthError);
}

#[tokio::test]
async fn list_follows_pages_and_skips_foreign_events() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/calendars/primary/events"))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{
                "id": "evt-2",
                "summary": "[Bill] Water - $40.00",
                "start": { "dateTime": "2025-03-05T09:00:00Z" },
                "end": { "dateTime": "2025-03-05T09:30:00Z" },
                "updated": "2025-02-02T08:00:00Z",
                "extendedProperties": { "private": { "billsync_bill_id": "8" } }
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/calendars/primary/events"))
        .and(query_param("singleEvents", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": "evt-1",
                    "summary": "[Bill] Rent - $1200.00",
                    "start": { "date": "2025-03-01" },
                    "end": { "date": "2025-03-02" },
                    "extendedProperties": { "private": { "billsync_bill_id": "7" } }
                },
                {
                    "id": "dentist",
                    "summary": "Dentist",
                    "start": { "date": "2025-03-01" },
                    "end": { "date": "2025-03-02" }
                }
            ],
            "nextPageToken": "p2"
        })))
        .mount(&server)
        .await;

    let range = DateRange::new(
        Utc.with_ymd_and_hms(2025, 2, 20, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap(),
    );
    let events = make_test_adapter(&server)
        .list_events(&make_test_credential(), &range)
        .await
        .unwrap();

    let ids: Vec<_> = events.iter().filter_map(|e| e.external_id.as_deref()).collect();
    assert_eq!(ids, ["evt-1", "evt-2"]);
    assert!(events[0].all_day);
    assert_eq!(events[1].bill_id, 8);
    assert!(events[1].updated.is_some());
}

#[tokio::test]
async fn refresh_exchanges_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "expires_in": 3599,
            "token_type": "Bearer"
        })))
        .mount(&server)
        .await;

    let fresh = make_test_adapter(&server)
        .refresh_token(&make_test_credential())
        .await
        .unwrap();

    assert_eq!(fresh.access_token, "access-2");
    assert_eq!(fresh.refresh_token.as_deref(), Some("refresh-1"));
    assert!(fresh.expires_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn rejected_refresh_surfaces_as_auth_expired() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;

    let mut expired = make_test_credential();
    expired.expires_at = Some(Utc::now() - Duration::minutes(1));
    let err = make_test_adapter(&server)
        .authenticate(&expired)
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::AuthExpired(_)));
}
