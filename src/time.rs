use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::engine::EngineError;
use crate::model::{Minute, MINUTES_PER_DAY};

/// Parse `"HH:MM"` or `"HH:MM:SS"` into minutes since midnight.
///
/// Seconds are validated and then dropped (minute resolution). `"24:00"` is
/// accepted as the end of the day so a block can run until midnight.
pub fn to_minutes(time: &str) -> Result<Minute, EngineError> {
    let invalid = || EngineError::InvalidTimeFormat(time.to_string());

    let mut parts = time.split(':');
    let (Some(h), Some(m)) = (parts.next(), parts.next()) else {
        return Err(invalid());
    };
    let s = parts.next();
    if parts.next().is_some() {
        return Err(invalid());
    }

    let field = |raw: &str, max: u32| -> Result<u32, EngineError> {
        if raw.len() != 2 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u32 = raw.parse().map_err(|_| invalid())?;
        if value > max {
            return Err(invalid());
        }
        Ok(value)
    };

    let hours = field(h, 24)?;
    let minutes = field(m, 59)?;
    let seconds = match s {
        Some(raw) => field(raw, 59)?,
        None => 0,
    };
    if hours == 24 && (minutes != 0 || seconds != 0) {
        return Err(invalid());
    }

    Ok((hours * 60 + minutes) as Minute)
}

/// Render minutes since midnight as `"HH:MM"`.
pub fn format_minutes(minutes: Minute) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// 0 = Sunday … 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// `"YYYY-MM-DD"`.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Wall-clock instant for `minutes` past midnight on `date`. 1440 rolls to the next midnight.
pub fn at(date: NaiveDate, minutes: Minute) -> NaiveDateTime {
    let midnight = NaiveDateTime::new(date, NaiveTime::MIN);
    midnight + chrono::Duration::minutes(minutes as i64)
}

/// Split an instant into its date and minute of day, truncating seconds.
pub fn split(instant: NaiveDateTime) -> (NaiveDate, Minute) {
    let t = instant.time();
    (instant.date(), (t.hour() * 60 + t.minute()) as Minute)
}

/// Date and `[start, end)` minutes for a proposal given as two instants.
///
/// An end at exactly the next midnight maps to 1440 on the start date; anything
/// else crossing midnight is rejected because bookings live on a single date.
pub fn same_day_minutes(
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<(NaiveDate, Minute, Minute), EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInput("end must be after start".into()));
    }
    let (date, start_min) = split(start);
    let (end_date, end_min) = split(end);
    let end_min = if end_date == date {
        end_min
    } else if end_date == date.succ_opt().unwrap_or(date) && end_min == 0 {
        MINUTES_PER_DAY
    } else {
        return Err(EngineError::InvalidInput(
            "a booking must start and end on the same date".into(),
        ));
    };
    if end_min <= start_min {
        return Err(EngineError::InvalidInput(
            "a booking must last at least one minute".into(),
        ));
    }
    Ok((date, start_min, end_min))
}

/// Serde adapter for minute-of-day fields.
///
/// Human-readable formats write `"HH:MM"` and read either that string (with
/// optional seconds, as `to_minutes` accepts) or a bare minute count. Binary
/// formats such as the WAL carry the plain integer.
pub mod wall_clock {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_minutes, to_minutes};
    use crate::model::Minute;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Minutes(Minute),
        Text(String),
    }

    pub fn serialize<S: Serializer>(minutes: &Minute, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format_minutes(*minutes))
        } else {
            serializer.serialize_i32(*minutes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Minute, D::Error> {
        if !deserializer.is_human_readable() {
            return Minute::deserialize(deserializer);
        }
        match Raw::deserialize(deserializer)? {
            Raw::Minutes(minutes) => Ok(minutes),
            Raw::Text(text) => to_minutes(&text).map_err(serde::de::Error::custom),
        }
    }
}
