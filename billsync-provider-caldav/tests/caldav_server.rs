use billsync_core::{
    CalendarEvent, ConnectionStatus, Credential, DateRange, ProviderAdapter, ProviderError,
    Reminder,
};
use billsync_provider_caldav::CalDavAdapter;
use chrono::{Duration, TimeZone, Utc};
use wiremock::matchers::{body_string_contains, header, header_exists, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn make_test_credential(server: &MockServer) -> Credential {
    let mut credential = Credential::new("alice", "s3cret");
    credential
        .extra
        .insert("calendar_url".into(), format!("{}/dav/calendars/alice/bills", server.uri()));
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
        color: None,
        location: None,
        updated: None,
    }
}

const RENT_ICS: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\nBEGIN:VEVENT\r\n\
UID:billsync-rent\r\nDTSTAMP:20250201T100000Z\r\nLAST-MODIFIED:20250201T100000Z\r\n\
SUMMARY:[Bill] Rent - $1200.00\r\nDTSTART;VALUE=DATE:20250301\r\nDTEND;VALUE=DATE:20250302\r\n\
X-BILLSYNC-BILL-ID:7\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

const DENTIST_ICS: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\nBEGIN:VEVENT\r\n\
UID:dentist\r\nDTSTAMP:20250201T100000Z\r\nSUMMARY:Dentist\r\n\
DTSTART:20250303T090000Z\r\nDTEND:20250303T100000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

fn multistatus() -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:" xmlns:cal="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/dav/calendars/alice/bills/billsync-rent.ics</d:href>
    <d:propstat><d:prop><d:getetag>"1"</d:getetag><cal:calendar-data>{RENT_ICS}</cal:calendar-data></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/calendars/alice/bills/dentist.ics</d:href>
    <d:propstat><d:prop><d:getetag>"2"</d:getetag><cal:calendar-data>{DENTIST_ICS}</cal:calendar-data></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#
    )
}

#[tokio::test]
async fn create_puts_new_resource_with_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/dav/calendars/alice/bills/billsync-[0-9a-f-]+\.ics$"))
        .and(header("if-none-match", "*"))
        // alice:s3cret
        .and(header("authorization", "Basic YWxpY2U6czNjcmV0"))
        .and(body_string_contains("X-BILLSYNC-BILL-ID:7"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let result = CalDavAdapter::new()
        .create_event(&make_test_credential(&server), &make_test_event())
        .await
        .unwrap();
    assert!(result.external_id.starts_with("billsync-"));
}

#[tokio::test]
async fn update_of_vanished_resource_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/dav/calendars/alice/bills/billsync-rent.ics"))
        .and(header_exists("if-match"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let err = CalDavAdapter::new()
        .update_event(&make_test_credential(&server), "billsync-rent", &make_test_event())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::NotFound(_)));
}

#[tokio::test]
async fn delete_of_missing_resource_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/dav/calendars/alice/bills/billsync-rent.ics"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    CalDavAdapter::new()
        .delete_event(&make_test_credential(&server), "billsync-rent")
        .await
        .unwrap();
}

#[tokio::test]
async fn report_returns_only_tagged_events() {
    let server = MockServer::start().await;
    Mock::given(method("REPORT"))
        .and(path("/dav/calendars/alice/bills/"))
        .and(header("depth", "1"))
        .and(body_string_contains(r#"start="20250220T000000Z""#))
        .respond_with(ResponseTemplate::new(207).set_body_string(multistatus()))
        .mount(&server)
        .await;

    let range = DateRange::new(
        Utc.with_ymd_and_hms(2025, 2, 20, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap(),
    );
    let events = CalDavAdapter::new()
        .list_events(&make_test_credential(&server), &range)
        .await
        .unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].bill_id, 7);
    assert_eq!(events[0].external_id.as_deref(), Some("billsync-rent"));
    assert!(events[0].all_day);
    assert_eq!(events[0].updated, Some(Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap()));
}

#[tokio::test]
async fn wrong_password_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = CalDavAdapter::new()
        .create_event(&make_test_credential(&server), &make_test_event())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Auth(_)));
}

#[tokio::test]
async fn missing_calendar_url_is_auth_error() {
    let err = CalDavAdapter::new()
        .create_event(&Credential::new("alice", "s3cret"), &make_test_event())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Auth(_)));
}

#[tokio::test]
async fn propfind_reports_display_name() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/calendars/alice/bills/"))
        .and(header("depth", "0"))
        .respond_with(ResponseTemplate::new(207).set_body_string(
            r#"<?xml version="1.0"?><d:multistatus xmlns:d="DAV:"><d:response><d:href>/dav/calendars/alice/bills/</d:href>
<d:propstat><d:prop><d:displayname>Bills</d:displayname></d:prop></d:propstat></d:response></d:multistatus>"#,
        ))
        .mount(&server)
        .await;

    let result = CalDavAdapter::new()
        .test_connection(&make_test_credential(&server))
        .await
        .unwrap();
    assert_eq!(result.status, ConnectionStatus::Connected);
    assert!(result.message.starts_with("Connected to Bills"));
}
