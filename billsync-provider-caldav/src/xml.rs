//! WebDAV request bodies and multistatus parsing.

use chrono::{DateTime, Utc};

/// A calendar object returned by a calendar-query REPORT.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarResource {
    pub href: String,
    pub etag: Option<String>,
    pub data: String,
}

/// calendar-query REPORT body with a server-side time-range filter.
pub fn calendar_query(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
    <D:prop>
        <D:getetag/>
        <C:calendar-data/>
    </D:prop>
    <C:filter>
        <C:comp-filter name="VCALENDAR">
            <C:comp-filter name="VEVENT">
                <C:time-range start="{}" end="{}"/>
            </C:comp-filter>
        </C:comp-filter>
    </C:filter>
</C:calendar-query>"#,
        caldav_time(from),
        caldav_time(to)
    )
}

pub const PROPFIND_DISPLAY_NAME: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
    <D:prop>
        <D:displayname/>
        <D:resourcetype/>
    </D:prop>
</D:propfind>"#;

/// `YYYYMMDDTHHMMSSZ`, the form time-range filters take.
pub fn caldav_time(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Resources carrying calendar data in a multistatus body.
pub fn parse_calendar_resources(body: &str) -> Result<Vec<CalendarResource>, roxmltree::Error> {
    let doc = roxmltree::Document::parse(body)?;

    let resources = doc
        .root_element()
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
        .filter_map(|response| {
            let text_of = |name: &str| {
                response
                    .descendants()
                    .find(|n| n.tag_name().name() == name)
                    .and_then(|n| n.text())
                    .map(str::to_string)
            };
            Some(CalendarResource {
                href: text_of("href")?,
                etag: text_of("getetag"),
                data: text_of("calendar-data")?,
            })
        })
        .collect();
    Ok(resources)
}

/// First `displayname` in a PROPFIND response.
pub fn parse_display_name(body: &str) -> Result<Option<String>, roxmltree::Error> {
    let doc = roxmltree::Document::parse(body)?;
    Ok(doc
        .descendants()
        .find(|n| n.tag_name().name() == "displayname")
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string()))
}

/// Resource name without the `.ics` suffix, used as the external id.
pub fn resource_id(href: &str) -> Option<&str> {
    let name = href.trim_end_matches('/').rsplit('/').next()?;
    let id = name.strip_suffix(".ics").unwrap_or(name);
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MULTISTATUS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:" xmlns:cal="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/dav/calendars/me/bills/billsync-1.ics</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"abc"</d:getetag>
        <cal:calendar-data>BEGIN:VCALENDAR
END:VCALENDAR</cal:calendar-data>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/calendars/me/bills/</d:href>
    <d:propstat><d:prop><d:getetag>"coll"</d:getetag></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn resources_without_calendar_data_are_skipped() {
        let resources = parse_calendar_resources(MULTISTATUS).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].href, "/dav/calendars/me/bills/billsync-1.ics");
        assert_eq!(resources[0].etag.as_deref(), Some("\"abc\""));
        assert!(resources[0].data.starts_with("BEGIN:VCALENDAR"));
    }

    #[test]
    fn time_range_uses_basic_format() {
        let from = Utc.with_ymd_and_hms(2025, 2, 20, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 3, 10, 12, 30, 0).unwrap();
        let body = calendar_query(from, to);
        assert!(body.contains(r#"start="20250220T000000Z" end="20250310T123000Z""#));
    }

    #[test]
    fn resource_ids_come_from_href() {
        assert_eq!(resource_id("/cal/billsync-1.ics"), Some("billsync-1"));
        assert_eq!(resource_id("https://dav.example.com/cal/x.ics"), Some("x"));
        assert_eq!(resource_id("/"), None);
    }
}
