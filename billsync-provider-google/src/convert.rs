//! Conversion between engine events and Google events.

use std::collections::BTreeMap;

use billsync_core::event::parse_hex_color;
use billsync_core::{CalendarEvent, Reminder, ReminderMethod};
use chrono::{Duration, NaiveTime};

use crate::types::{EventDateTime, ExtendedProperties, GoogleEvent, ReminderOverride, Reminders};

/// Private extended property carrying the bill id.
pub const BILL_ID_PROPERTY: &str = "billsync_bill_id";

/// Google's fixed event palette, indexed by `colorId`.
const EVENT_COLORS: [(&str, (u8, u8, u8)); 11] = [
    ("1", (0xa4, 0xbd, 0xfc)),
    ("2", (0x7a, 0xe7, 0xbf)),
    ("3", (0xdb, 0xad, 0xff)),
    ("4", (0xff, 0x88, 0x7c)),
    ("5", (0xfb, 0xd7, 0x5b)),
    ("6", (0xff, 0xb8, 0x78)),
    ("7", (0x46, 0xd6, 0xdb)),
    ("8", (0xe1, 0xe1, 0xe1)),
    ("9", (0x54, 0x84, 0xed)),
    ("10", (0x51, 0xb7, 0x49)),
    ("11", (0xdc, 0x21, 0x27)),
];

/// Nearest palette entry to a `#RRGGBB` colour.
pub fn nearest_color_id(hex: &str) -> Option<&'static str> {
    let (r, g, b) = parse_hex_color(hex)?;
    EVENT_COLORS
        .iter()
        .min_by_key(|(_, (pr, pg, pb))| {
            let dr = i32::from(r) - i32::from(*pr);
            let dg = i32::from(g) - i32::from(*pg);
            let db = i32::from(b) - i32::from(*pb);
            dr * dr + dg * dg + db * db
        })
        .map(|(id, _)| *id)
}

fn color_hex(color_id: &str) -> Option<String> {
    EVENT_COLORS
        .iter()
        .find(|(id, _)| *id == color_id)
        .map(|(_, (r, g, b))| format!("#{r:02x}{g:02x}{b:02x}"))
}

pub fn to_google(event: &CalendarEvent) -> GoogleEvent {
    let (start, end) = if event.all_day {
        (
            EventDateTime {
                date: Some(event.start.date_naive()),
                ..Default::default()
            },
            EventDateTime {
                date: Some(event.end.date_naive()),
                ..Default::default()
            },
        )
    } else {
        let utc = |dt| EventDateTime {
            date_time: Some(dt),
            time_zone: Some("UTC".into()),
            ..Default::default()
        };
        (utc(event.start), utc(event.end))
    };

    let reminders = Reminders {
        use_default: false,
        overrides: event
            .reminders
            .iter()
            .map(|r| ReminderOverride {
                method: match r.method {
                    ReminderMethod::Popup => "popup".into(),
                    ReminderMethod::Email => "email".into(),
                },
                minutes: r.minutes,
            })
            .collect(),
    };

    GoogleEvent {
        id: None,
        status: None,
        summary: event.title.clone(),
        description: (!event.description.is_empty()).then(|| event.description.clone()),
        location: event.location.clone(),
        color_id: event
            .color
            .as_deref()
            .and_then(nearest_color_id)
            .map(String::from),
        start: Some(start),
        end: Some(end),
        reminders: Some(reminders),
        extended_properties: Some(ExtendedProperties {
            private: BTreeMap::from([(BILL_ID_PROPERTY.to_string(), event.bill_id.to_string())]),
        }),
        updated: None,
    }
}

/// Map a listed Google event back. Events not created by billsync, cancelled
/// events and events without usable times yield `None`.
pub fn from_google(event: GoogleEvent) -> Option<CalendarEvent> {
    if event.status.as_deref() == Some("cancelled") {
        return None;
    }
    let bill_id = event
        .extended_properties
        .as_ref()?
        .private
        .get(BILL_ID_PROPERTY)?
        .parse()
        .ok()?;

    let start = event.start.as_ref()?;
    let end = event.end.as_ref()?;
    let (start, end, all_day) = match (start.date, start.date_time, end.date, end.date_time) {
        (Some(s), _, Some(e), _) => (
            s.and_time(NaiveTime::MIN).and_utc(),
            e.and_time(NaiveTime::MIN).and_utc(),
            true,
        ),
        (Some(s), _, None, _) => {
            let s = s.and_time(NaiveTime::MIN).and_utc();
            (s, s + Duration::days(1), true)
        }
        (None, Some(s), _, Some(e)) => (s, e, false),
        _ => return None,
    };

    let reminders = event
        .reminders
        .map(|r| {
            r.overrides
                .into_iter()
                .map(|o| Reminder {
                    minutes: o.minutes,
                    method: if o.method == "email" {
                        ReminderMethod::Email
                    } else {
                        ReminderMethod::Popup
                    },
                })
                .collect()
        })
        .unwrap_or_default();

    Some(CalendarEvent {
        bill_id,
        external_id: event.id,
        title: event.summary,
        description: event.description.unwrap_or_default(),
        start,
        end,
        all_day,
        reminders,
        color: event.color_id.as_deref().and_then(color_hex),
        location: event.location,
        updated: event.updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn make_test_event(all_day: bool) -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        CalendarEvent {
            bill_id: 42,
            external_id: None,
            title: "[Bill] Rent - $1200.00".into(),
            description: "Due 2025-03-01".into(),
            start,
            end: start + Duration::days(1),
            all_day,
            reminders: vec![Reminder::popup(1440)],
            color: Some("#1f538d".into()),
            location: None,
            updated: None,
        }
    }

    #[test]
    fn all_day_events_use_dates() {
        let google = to_google(&make_test_event(true));
        let start = google.start.unwrap();
        assert_eq!(start.date, chrono::NaiveDate::from_ymd_opt(2025, 3, 1));
        assert!(start.date_time.is_none());
        assert_eq!(google.end.unwrap().date, chrono::NaiveDate::from_ymd_opt(2025, 3, 2));
    }

    #[test]
    fn bill_id_marker_survives_the_trip() {
        let mut google = to_google(&make_test_event(false));
        google.id = Some("abc".into());
        let back = from_google(google).unwrap();
        assert_eq!(back.bill_id, 42);
        assert_eq!(back.external_id.as_deref(), Some("abc"));
        assert!(!back.all_day);
    }

    #[test]
    fn foreign_and_cancelled_events_are_skipped() {
        let mut foreign = to_google(&make_test_event(true));
        foreign.extended_properties = None;
        assert!(from_google(foreign).is_none());

        let mut cancelled = to_google(&make_test_event(true));
        cancelled.status = Some("cancelled".into());
        assert!(from_google(cancelled).is_none());
    }

    #[test]
    fn colours_snap_to_palette() {
        assert_eq!(nearest_color_id("#dc2127"), Some("11"));
        assert_eq!(nearest_color_id("#1f538d"), Some("9"));
        assert_eq!(nearest_color_id("blue"), None);
    }
}
