//! Conversion between engine events and Graph events.

use billsync_core::{CalendarEvent, Reminder, ReminderMethod};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::types::{DateTimeTimeZone, GraphEvent, ItemBody, Location, SingleValueProperty};

/// Single-value extended property carrying the bill id.
pub const BILL_ID_PROPERTY: &str =
    "String {6f1b8f3a-2d4e-4c61-9a0e-7b5d3c2e1f48} Name billsync_bill_id";

/// Outlook colours events through categories, so coloured bills get this one.
pub const BILL_CATEGORY: &str = "Bills";

const GRAPH_DATETIME: &str = "%Y-%m-%dT%H:%M:%S";

fn graph_time(instant: DateTime<Utc>) -> DateTimeTimeZone {
    DateTimeTimeZone {
        date_time: instant.format(GRAPH_DATETIME).to_string(),
        time_zone: "UTC".into(),
    }
}

/// Parse Graph's wall-clock string. Listing asks for UTC, so the zone is ignored.
fn parse_graph_time(value: &DateTimeTimeZone) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.date_time.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn to_graph(event: &CalendarEvent) -> GraphEvent {
    // Graph holds a single reminder per event.
    let reminder = event.reminders.iter().map(|r| r.minutes).min();

    GraphEvent {
        subject: event.title.clone(),
        body: Some(ItemBody {
            content_type: "text".into(),
            content: event.description.clone(),
        }),
        start: Some(graph_time(event.start)),
        end: Some(graph_time(event.end)),
        is_all_day: event.all_day,
        is_reminder_on: reminder.is_some(),
        reminder_minutes_before_start: reminder,
        location: event.location.as_ref().map(|name| Location {
            display_name: name.clone(),
        }),
        categories: event
            .color
            .as_ref()
            .map(|_| vec![BILL_CATEGORY.to_string()])
            .unwrap_or_default(),
        single_value_extended_properties: vec![SingleValueProperty {
            id: BILL_ID_PROPERTY.to_string(),
            value: event.bill_id.to_string(),
        }],
        ..Default::default()
    }
}

/// Map a listed Graph event back; events without the bill property are not ours.
pub fn from_graph(event: GraphEvent) -> Option<CalendarEvent> {
    if event.is_cancelled {
        return None;
    }
    let bill_id = event
        .single_value_extended_properties
        .iter()
        .find(|p| p.id.eq_ignore_ascii_case(BILL_ID_PROPERTY))?
        .value
        .parse()
        .ok()?;
    let start = parse_graph_time(event.start.as_ref()?)?;
    let end = parse_graph_time(event.end.as_ref()?)?;

    let reminders = match (event.is_reminder_on, event.reminder_minutes_before_start) {
        (true, Some(minutes)) => vec![Reminder {
            minutes,
            method: ReminderMethod::Popup,
        }],
        _ => Vec::new(),
    };

    Some(CalendarEvent {
        bill_id,
        external_id: event.id,
        title: event.subject,
        description: event.body.map(|b| b.content).unwrap_or_default(),
        start,
        end,
        all_day: event.is_all_day,
        reminders,
        color: None,
        location: event
            .location
            .map(|l| l.display_name)
            .filter(|name| !name.is_empty()),
        updated: event.last_modified_date_time,
    })
}
