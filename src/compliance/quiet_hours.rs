use crate::error::ComplianceError;
use crate::types::Purpose;
use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Daily local-time window during which marketing sends are held back.
/// `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuietHours {
    pub enabled: bool,
    pub start_minute: u32,
    pub end_minute: u32,
    pub timezone: Tz,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start_minute: 0,
            end_minute: 0,
            timezone: Tz::UTC,
        }
    }
}

impl QuietHours {
    pub fn new(start_minute: u32, end_minute: u32, timezone: Tz) -> Self {
        Self {
            enabled: true,
            start_minute: start_minute % MINUTES_PER_DAY,
            end_minute: end_minute % MINUTES_PER_DAY,
            timezone,
        }
    }

    pub fn parse(start: &str, end: &str, timezone: &str) -> Result<Self, ComplianceError> {
        let tz_name = timezone.trim();
        let tz: Tz = if tz_name.is_empty() {
            Tz::UTC
        } else {
            tz_name
                .parse()
                .map_err(|_| ComplianceError::UnknownTimezone(tz_name.to_string()))?
        };
        Ok(Self::new(parse_clock(start)?, parse_clock(end)?, tz))
    }

    fn local_minute(&self, now: DateTime<Utc>) -> u32 {
        let local = now.with_timezone(&self.timezone);
        local.hour() * 60 + local.minute()
    }

    fn in_window(&self, minute: u32) -> bool {
        if self.start_minute < self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            minute >= self.start_minute || minute < self.end_minute
        }
    }

    pub fn suppress(&self, now: DateTime<Utc>, purpose: Purpose) -> bool {
        if !self.enabled || purpose != Purpose::Marketing {
            return false;
        }
        if self.start_minute == self.end_minute {
            return false;
        }
        self.in_window(self.local_minute(now))
    }

    /// When a suppressed send may go out. Returns `now` when not suppressed.
    pub fn window_end(&self, now: DateTime<Utc>, purpose: Purpose) -> DateTime<Utc> {
        if !self.suppress(now, purpose) {
            return now;
        }
        let minute = self.local_minute(now);
        let remaining = if minute < self.end_minute {
            self.end_minute - minute
        } else {
            MINUTES_PER_DAY - minute + self.end_minute
        };
        let second = now.with_timezone(&self.timezone).second();
        now + Duration::minutes(remaining as i64) - Duration::seconds(second as i64)
    }
}

pub fn parse_clock(value: &str) -> Result<u32, ComplianceError> {
    let invalid = || ComplianceError::InvalidClock(value.to_string());
    let (hours, minutes) = value.trim().split_once(':').ok_or_else(invalid)?;
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    Ok(hours * 60 + minutes)
}
