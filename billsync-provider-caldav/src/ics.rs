//! ICS generation and parsing for mirrored events.

use billsync_core::{CalendarEvent, Reminder};
use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use icalendar::parser::{read_calendar, unfold};
use icalendar::{
    Alarm, Calendar, CalendarDateTime, Component, DatePerhapsTime, EventLike, Property, Trigger,
    ValueType,
};

/// VEVENT property carrying the bill id.
pub const BILL_ID_PROPERTY: &str = "X-BILLSYNC-BILL-ID";

const ICS_UTC: &str = "%Y%m%dT%H%M%SZ";

/// Render `event` as a single-VEVENT calendar object with the given UID.
pub fn generate(uid: &str, event: &CalendarEvent) -> String {
    let stamp = Utc::now().format(ICS_UTC).to_string();

    let mut ics_event = icalendar::Event::new();
    ics_event.uid(uid);
    ics_event.summary(&event.title);
    ics_event.add_property("DTSTAMP", &stamp);
    ics_event.add_property("LAST-MODIFIED", &stamp);
    add_time(&mut ics_event, "DTSTART", event.start, event.all_day);
    add_time(&mut ics_event, "DTEND", event.end, event.all_day);

    if !event.description.is_empty() {
        ics_event.description(&event.description);
    }
    if let Some(location) = &event.location {
        ics_event.location(location);
    }
    if event.all_day {
        ics_event.add_property("TRANSP", "TRANSPARENT");
    }
    for reminder in &event.reminders {
        let trigger = Trigger::before_start(chrono::Duration::minutes(i64::from(reminder.minutes)));
        ics_event.alarm(Alarm::display("Reminder", trigger));
    }
    ics_event.add_property(BILL_ID_PROPERTY, event.bill_id.to_string());

    let mut cal = Calendar::new();
    cal.push(ics_event.done());
    cal.done().to_string()
}

fn add_time(ics_event: &mut icalendar::Event, name: &str, time: DateTime<Utc>, all_day: bool) {
    if all_day {
        let mut prop = Property::new(name, time.date_naive().format("%Y%m%d").to_string());
        prop.append_parameter(ValueType::Date);
        ics_event.append_property(prop);
    } else {
        ics_event.add_property(name, time.format(ICS_UTC).to_string());
    }
}

/// Parse a calendar object written by [`generate`].
///
/// Objects without the bill id property, and those whose times cannot be
/// read, yield `None`. `external_id` is left for the caller to fill from the
/// resource href.
pub fn parse(content: &str) -> Option<CalendarEvent> {
    let unfolded = unfold(content);
    let calendar = read_calendar(&unfolded).ok()?;
    let vevent = calendar.components.iter().find(|c| c.name == "VEVENT")?;

    let bill_id = vevent.find_prop(BILL_ID_PROPERTY)?.val.as_ref().trim().parse().ok()?;
    if vevent
        .find_prop("STATUS")
        .is_some_and(|p| p.val.as_ref() == "CANCELLED")
    {
        return None;
    }

    let (start, all_day) = to_utc(DatePerhapsTime::try_from(vevent.find_prop("DTSTART")?).ok()?);
    let end = match vevent.find_prop("DTEND") {
        Some(prop) => to_utc(DatePerhapsTime::try_from(prop).ok()?).0,
        None if all_day => start + chrono::Duration::days(1),
        None => start,
    };

    let reminders = vevent
        .components
        .iter()
        .filter(|c| c.name == "VALARM")
        .filter_map(|alarm| parse_trigger_minutes(alarm.find_prop("TRIGGER")?.val.as_ref()))
        .map(Reminder::popup)
        .collect();

    let updated = vevent
        .find_prop("LAST-MODIFIED")
        .or_else(|| vevent.find_prop("DTSTAMP"))
        .and_then(|p| NaiveDateTime::parse_from_str(p.val.as_ref(), ICS_UTC).ok())
        .map(|naive| naive.and_utc());

    Some(CalendarEvent {
        bill_id,
        external_id: None,
        title: vevent
            .find_prop("SUMMARY")
            .map(|p| p.val.to_string())
            .unwrap_or_default(),
        description: vevent
            .find_prop("DESCRIPTION")
            .map(|p| p.val.to_string())
            .unwrap_or_default(),
        start,
        end,
        all_day,
        reminders,
        color: None,
        location: vevent.find_prop("LOCATION").map(|p| p.val.to_string()),
        updated,
    })
}

/// Zoned and floating times are read as UTC wall clock; billsync only writes UTC.
fn to_utc(dpt: DatePerhapsTime) -> (DateTime<Utc>, bool) {
    match dpt {
        DatePerhapsTime::Date(d) => (d.and_time(NaiveTime::MIN).and_utc(), true),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => (dt, false),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => (naive.and_utc(), false),
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, .. }) => {
            (date_time.and_utc(), false)
        }
    }
}

/// Minutes before start for a `-PT15M` style trigger. Triggers after the
/// start are ignored.
fn parse_trigger_minutes(value: &str) -> Option<u32> {
    let duration = iso8601::duration(value.strip_prefix('-')?).ok()?;
    let std_duration: std::time::Duration = duration.into();
    u32::try_from(std_duration.as_secs() / 60).ok()
}
