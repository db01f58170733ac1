//! Event template engine: renders a bill into a [`CalendarEvent`].
//!
//! Templates are plain strings with named placeholders:
//! `{name}`, `{amount}`, `{category}` and `{due_date}`. Literal braces are
//! written as `{{` and `}}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::bill::BillSnapshot;
use crate::error::{TemplateError, ValidationError};
use crate::event::{self, CalendarEvent, Reminder};

pub const DEFAULT_TITLE: &str = "[Bill] {name} - ${amount}";
pub const DEFAULT_DESCRIPTION: &str =
    "Bill: {name}\nAmount: ${amount}\nCategory: {category}\nDue Date: {due_date}";
pub const DEFAULT_COLOR: &str = "#1f538d";
const MAX_DESCRIPTION_TEMPLATE_LEN: usize = 2048;
const MAX_DURATION_MINUTES: u32 = 1440;

const PLACEHOLDERS: [&str; 4] = ["name", "amount", "category", "due_date"];

/// All-day vs timed rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventTiming {
    #[default]
    AllDay,
    Timed {
        hour: u32,
        minute: u32,
        duration_minutes: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventTemplate {
    pub title: String,
    pub description: String,
    pub timing: EventTiming,
    /// IANA zone for timed events; UTC when absent.
    pub timezone: Option<String>,
    pub reminders: Vec<Reminder>,
    pub default_color: Option<String>,
    /// Colour by bill category name.
    pub category_colors: BTreeMap<String, String>,
    pub location: Option<String>,
}

impl Default for EventTemplate {
    fn default() -> Self {
        EventTemplate {
            title: DEFAULT_TITLE.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            timing: EventTiming::AllDay,
            timezone: None,
            reminders: vec![Reminder::popup(24 * 60)],
            default_color: Some(DEFAULT_COLOR.to_string()),
            category_colors: BTreeMap::new(),
            location: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Brace(char),
    Field(&'a str),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let bytes = template.as_bytes();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'}' if bytes.get(i + 1) == Some(&bytes[i]) => {
                if text_start < i {
                    segments.push(Segment::Text(&template[text_start..i]));
                }
                segments.push(Segment::Brace(bytes[i] as char));
                i += 2;
                text_start = i;
            }
            b'{' => {
                let close = template[i + 1..]
                    .find('}')
                    .map(|offset| i + 1 + offset)
                    .ok_or(TemplateError::Unclosed(i))?;
                let name = &template[i + 1..close];
                if !PLACEHOLDERS.contains(&name) {
                    return Err(TemplateError::UnknownPlaceholder(name.to_string()));
                }
                if text_start < i {
                    segments.push(Segment::Text(&template[text_start..i]));
                }
                segments.push(Segment::Field(name));
                i = close + 1;
                text_start = i;
            }
            b'}' => return Err(TemplateError::StrayBrace(i)),
            _ => i += 1,
        }
    }
    if text_start < template.len() {
        segments.push(Segment::Text(&template[text_start..]));
    }
    Ok(segments)
}

fn render(segments: &[Segment<'_>], bill: &BillSnapshot, due: NaiveDate) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(s) => out.push_str(s),
            Segment::Brace(c) => out.push(*c),
            Segment::Field("name") => out.push_str(&bill.name),
            Segment::Field("amount") => match bill.amount {
                Some(amount) => out.push_str(&format!("{amount:.2}")),
                None => out.push_str("n/a"),
            },
            Segment::Field("category") => {
                out.push_str(bill.category.as_deref().unwrap_or("Uncategorized"))
            }
            Segment::Field("due_date") => out.push_str(&due.format("%Y-%m-%d").to_string()),
            Segment::Field(_) => {}
        }
    }
    out
}

impl EventTemplate {
    /// Validate at configuration time. Generation never calls this as a gate;
    /// it falls back to the default template instead.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::new("template.title", "must not be empty").into());
        }
        if self.title.chars().count() > event::MAX_TITLE_LEN {
            return Err(ValidationError::new(
                "template.title",
                format!("longer than {} characters", event::MAX_TITLE_LEN),
            )
            .into());
        }
        if self.description.chars().count() > MAX_DESCRIPTION_TEMPLATE_LEN {
            return Err(ValidationError::new(
                "template.description",
                format!("longer than {MAX_DESCRIPTION_TEMPLATE_LEN} characters"),
            )
            .into());
        }
        parse(&self.title)?;
        parse(&self.description)?;

        if let EventTiming::Timed {
            hour,
            minute,
            duration_minutes,
        } = self.timing
        {
            if hour > 23 || minute > 59 {
                return Err(ValidationError::new(
                    "template.timing",
                    format!("{hour:02}:{minute:02} is not a valid time of day"),
                )
                .into());
            }
            if duration_minutes == 0 || duration_minutes > MAX_DURATION_MINUTES {
                return Err(ValidationError::new(
                    "template.timing.duration_minutes",
                    format!("must be between 1 and {MAX_DURATION_MINUTES}"),
                )
                .into());
            }
        }
        if let Some(tz) = &self.timezone
            && tz.parse::<Tz>().is_err()
        {
            return Err(
                ValidationError::new("template.timezone", format!("unknown zone '{tz}'")).into(),
            );
        }
        if let Some(color) = &self.default_color
            && !event::is_hex_color(color)
        {
            return Err(ValidationError::new("template.default_color", "must be #RRGGBB").into());
        }
        if let Some((category, _)) = self
            .category_colors
            .iter()
            .find(|(_, color)| !event::is_hex_color(color))
        {
            return Err(ValidationError::new(
                "template.category_colors",
                format!("colour for '{category}' must be #RRGGBB"),
            )
            .into());
        }
        if let Some(r) = self
            .reminders
            .iter()
            .find(|r| r.minutes > event::MAX_REMINDER_MINUTES)
        {
            return Err(ValidationError::new(
                "template.reminders",
                format!("{} minutes exceeds {}", r.minutes, event::MAX_REMINDER_MINUTES),
            )
            .into());
        }
        if let Some(location) = &self.location
            && location.chars().count() > event::MAX_LOCATION_LEN
        {
            return Err(ValidationError::new("template.location", "too long").into());
        }
        Ok(())
    }

    fn color_for(&self, bill: &BillSnapshot) -> Option<String> {
        bill.category
            .as_ref()
            .and_then(|c| self.category_colors.get(c))
            .or(self.default_color.as_ref())
            .cloned()
    }

    fn window(&self, due: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>, bool) {
        match self.timing {
            EventTiming::AllDay => {
                let start = due.and_time(NaiveTime::MIN).and_utc();
                (start, start + Duration::days(1), true)
            }
            EventTiming::Timed {
                hour,
                minute,
                duration_minutes,
            } => {
                let local = due.and_time(
                    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN),
                );
                let start = self
                    .timezone
                    .as_deref()
                    .and_then(|tz| tz.parse::<Tz>().ok())
                    .and_then(|tz| tz.from_local_datetime(&local).earliest())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|| local.and_utc());
                let minutes = duration_minutes.clamp(1, MAX_DURATION_MINUTES);
                (start, start + Duration::minutes(i64::from(minutes)), false)
            }
        }
    }
}

/// Render `bill` into an event using `template`.
///
/// Never fails: an invalid template is replaced by [`EventTemplate::default`],
/// and rendered text that would not pass event validation is clipped or
/// replaced with a plain fallback title.
pub fn generate_event(bill: &BillSnapshot, template: &EventTemplate) -> CalendarEvent {
    let default_template;
    let template = match template.validate() {
        Ok(()) => template,
        Err(e) => {
            tracing::warn!(bill_id = bill.id, error = %e, "Invalid event template, using default");
            default_template = EventTemplate::default();
            &default_template
        }
    };

    let due = bill
        .due_date
        .unwrap_or_else(|| bill.last_modified.date_naive());

    // Both parse calls succeed: the template was validated above.
    let title = parse(&template.title)
        .map(|s| render(&s, bill, due))
        .unwrap_or_default();
    let description = parse(&template.description)
        .map(|s| render(&s, bill, due))
        .unwrap_or_default();

    let title = if title.trim().is_empty() {
        format!("Bill due: {}", bill.name)
    } else {
        title
    };
    let title = clip(&title, event::MAX_TITLE_LEN);
    let title = if title.trim().is_empty() {
        "Bill due".to_string()
    } else {
        title
    };

    let (start, end, all_day) = template.window(due);

    CalendarEvent {
        bill_id: bill.id,
        external_id: None,
        title,
        description: clip(&description, event::MAX_DESCRIPTION_LEN),
        start,
        end,
        all_day,
        reminders: template.reminders.clone(),
        color: template.color_for(bill),
        location: template.location.clone(),
        updated: None,
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
