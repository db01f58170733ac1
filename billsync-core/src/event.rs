//! Calendar event: the externally-visible projection of a bill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bill::BillId;
use crate::error::ValidationError;

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 8192;
pub const MAX_LOCATION_LEN: usize = 255;
/// Four weeks, the longest reminder any supported provider accepts.
pub const MAX_REMINDER_MINUTES: u32 = 40_320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderMethod {
    #[default]
    Popup,
    Email,
}

/// A reminder that fires `minutes` before the event starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub minutes: u32,
    #[serde(default)]
    pub method: ReminderMethod,
}

impl Reminder {
    pub fn popup(minutes: u32) -> Self {
        Reminder {
            minutes,
            method: ReminderMethod::Popup,
        }
    }
}

/// A calendar event mirrored from a bill.
///
/// All-day events start at 00:00 UTC on the due date and end at 00:00 UTC on
/// the following day (exclusive end).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub bill_id: BillId,
    /// Provider-assigned id; `None` until the first successful create.
    pub external_id: Option<String>,
    pub title: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
    /// `#RRGGBB`
    pub color: Option<String>,
    pub location: Option<String>,
    /// Last-modified time as reported by the provider (only set on listed events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::new("title", "must not be empty"));
        }
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(ValidationError::new(
                "title",
                format!("longer than {MAX_TITLE_LEN} characters"),
            ));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ValidationError::new(
                "description",
                format!("longer than {MAX_DESCRIPTION_LEN} characters"),
            ));
        }
        if self.start >= self.end {
            return Err(ValidationError::new("end", "must be after start"));
        }
        if let Some(color) = &self.color
            && !is_hex_color(color)
        {
            return Err(ValidationError::new(
                "color",
                format!("'{color}' is not a #RRGGBB colour"),
            ));
        }
        if let Some(location) = &self.location
            && location.chars().count() > MAX_LOCATION_LEN
        {
            return Err(ValidationError::new(
                "location",
                format!("longer than {MAX_LOCATION_LEN} characters"),
            ));
        }
        if let Some(r) = self.reminders.iter().find(|r| r.minutes > MAX_REMINDER_MINUTES) {
            return Err(ValidationError::new(
                "reminders",
                format!("{} minutes exceeds {MAX_REMINDER_MINUTES}", r.minutes),
            ));
        }
        Ok(())
    }

    pub fn with_external_id(mut self, external_id: Option<String>) -> Self {
        self.external_id = external_id;
        self
    }
}

pub fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse `#RRGGBB` into its components.
pub fn parse_hex_color(s: &str) -> Option<(u8, u8, u8)> {
    if !is_hex_color(s) {
        return None;
    }
    let r = u8::from_str_radix(&s[1..3], 16).ok()?;
    let g = u8::from_str_radix(&s[3..5], 16).ok()?;
    let b = u8::from_str_radix(&s[5..7], 16).ok()?;
    Some((r, g, b))
}
