use std::fmt;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::sync::OnceLock;

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Duration,
  Local,
  NaiveDate,
  NaiveDateTime,
  Timelike,
  Utc
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

/// Storage and display form of an entry
/// timestamp, e.g. `05 Mar 2026 21:30`.
pub const ENTRY_DATETIME_FORMAT: &str =
  "%d %b %Y %H:%M";
pub const NOT_APPLICABLE: &str = "N/A";
pub const INVALID_DATE: &str =
  "Invalid Date";

const TIMEZONE_CONFIG_FILE: &str =
  "knell-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "KNELL_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "KNELL_TIME_CONFIG";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// The date/time column of an entry.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq,
)]
pub enum Schedule {
  #[default]
  NotApplicable,
  At(NaiveDateTime),
  Invalid
}

impl Schedule {
  /// Interprets a stored or edited
  /// value. Anything that is neither
  /// `N/A` nor the canonical format is
  /// coerced to `Invalid`.
  #[must_use]
  pub fn from_text(raw: &str) -> Self {
    let trimmed = raw.trim();
    if trimmed == NOT_APPLICABLE {
      return Self::NotApplicable;
    }
    match parse_entry_datetime(trimmed) {
      | Some(dt) => Self::At(dt),
      | None => Self::Invalid
    }
  }

  #[must_use]
  pub fn at(&self) -> Option<NaiveDateTime> {
    match self {
      | Self::At(dt) => Some(*dt),
      | _ => None
    }
  }
}

impl fmt::Display for Schedule {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    match self {
      | Self::NotApplicable => {
        f.write_str(NOT_APPLICABLE)
      }
      | Self::At(dt) => {
        write!(
          f,
          "{}",
          format_entry_datetime(*dt)
        )
      }
      | Self::Invalid => {
        f.write_str(INVALID_DATE)
      }
    }
  }
}

#[must_use]
pub fn parse_entry_datetime(
  raw: &str
) -> Option<NaiveDateTime> {
  NaiveDateTime::parse_from_str(
    raw.trim(),
    ENTRY_DATETIME_FORMAT
  )
  .ok()
}

#[must_use]
pub fn format_entry_datetime(
  dt: NaiveDateTime
) -> String {
  dt.format(ENTRY_DATETIME_FORMAT)
    .to_string()
}

/// Renders a positive remaining
/// duration as `D d : HH h : MM m`.
#[must_use]
pub fn format_remaining(
  remaining: Duration
) -> String {
  let total =
    remaining.num_seconds().max(0);
  let days = total / 86_400;
  let rest = total % 86_400;
  format!(
    "{days} d : {:02} h : {:02} m",
    rest / 3_600,
    (rest % 3_600) / 60
  )
}

pub fn configured_timezone()
-> Option<&'static Tz> {
  static ZONE: OnceLock<Option<Tz>> =
    OnceLock::new();
  ZONE
    .get_or_init(resolve_timezone)
    .as_ref()
}

/// Wall-clock time in the configured
/// zone, falling back to the system
/// local zone.
#[must_use]
pub fn to_wall_clock(
  now: DateTime<Utc>
) -> NaiveDateTime {
  match configured_timezone() {
    | Some(tz) => {
      now.with_timezone(tz).naive_local()
    }
    | None => {
      now.with_timezone(&Local)
        .naive_local()
    }
  }
}

fn resolve_timezone() -> Option<Tz> {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) =
      parse_timezone(&raw, TIMEZONE_ENV_VAR)
  {
    return Some(tz);
  }

  let path = timezone_config_path()?;
  load_timezone_from_file(&path)
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &Path
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found; using system local time"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// Parses a user-supplied due time
/// relative to the wall-clock `now`.
#[tracing::instrument(skip(now), fields(input = input))]
pub fn parse_when(
  input: &str,
  now: NaiveDateTime
) -> anyhow::Result<Schedule> {
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();

  if matches!(
    lower.as_str(),
    "n/a" | "na" | "none" | "-"
  ) {
    return Ok(Schedule::NotApplicable);
  }

  if let Some(dt) =
    parse_entry_datetime(token)
  {
    return Ok(Schedule::At(dt));
  }

  if lower == "now" {
    return Ok(Schedule::At(
      truncate_to_minute(now)
    ));
  }

  let rel_re = Regex::new(r"^(?P<sign>[+-])(?P<num>\d+)(?P<unit>[dhmw])$")
        .map_err(|e| anyhow!("internal regex compile failure: {e}"))?;

  if let Some(caps) =
    rel_re.captures(&lower)
  {
    let num: i64 = caps["num"]
      .parse()
      .context(
        "invalid relative number"
      )?;
    let duration =
      match &caps["unit"] {
        | "w" => Duration::weeks(num),
        | "d" => Duration::days(num),
        | "h" => Duration::hours(num),
        | _ => Duration::minutes(num)
      };
    let shifted = if &caps["sign"] == "-"
    {
      now - duration
    } else {
      now + duration
    };
    return Ok(Schedule::At(
      truncate_to_minute(shifted)
    ));
  }

  if let Some((day_part, clock_part)) =
    lower.split_once(char::is_whitespace)
  {
    let day = match day_part {
      | "today" => Some(now.date()),
      | "tomorrow" => {
        now.date().succ_opt()
      }
      | other => {
        NaiveDate::parse_from_str(
          other, "%Y-%m-%d"
        )
        .ok()
      }
    };

    if let Some(day) = day {
      let (hour, minute) =
        parse_clock_time(clock_part)
          .ok_or_else(|| {
            anyhow!(
              "invalid clock time: \
               {clock_part}"
            )
          })?;
      let dt = day
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| {
          anyhow!(
            "failed to construct \
             date time"
          )
        })?;
      return Ok(Schedule::At(dt));
    }
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%Y-%m-%d"
    )
  {
    let midnight = date
      .and_hms_opt(0, 0, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct \
           midnight for date"
        )
      })?;
    return Ok(Schedule::At(midnight));
  }

  if let Some((hour, minute)) =
    parse_clock_time(token)
  {
    let mut day = now.date();
    let candidate = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct clock \
           time candidate"
        )
      })?;
    if candidate <= now {
      day = day.succ_opt().ok_or_else(
        || {
          anyhow!(
            "failed to advance to \
             next day"
          )
        }
      )?;
    }
    let next = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct next \
           clock time candidate"
        )
      })?;
    return Ok(Schedule::At(next));
  }

  Err(anyhow!(
    "unrecognized date expression: \
     {input}"
  ))
  .with_context(|| {
    "supported formats: N/A, \
     'DD Mon YYYY HH:MM', \
     'YYYY-MM-DD HH:MM', \
     'YYYY-MM-DD 3:23pm', \
     today/tomorrow <clock>, bare \
     clock times (e.g. 21:30 or \
     9:30pm), +Nw/+Nd/+Nh/+Nm, \
     YYYY-MM-DD"
  })
}

fn truncate_to_minute(
  dt: NaiveDateTime
) -> NaiveDateTime {
  dt.with_second(0)
    .and_then(|d| d.with_nanosecond(0))
    .unwrap_or(dt)
}

fn parse_clock_time(
  token: &str
) -> Option<(u32, u32)> {
  let clock_re = Regex::new(
    r"(?i)^(?P<hour>\d{1,2}):(?P<minute>\d{2})\s*(?P<ampm>[ap]m)?$",
  )
  .ok()?;
  let captures =
    clock_re.captures(token.trim())?;

  let raw_hour = captures
    .name("hour")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let minute = captures
    .name("minute")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  if minute > 59 {
    return None;
  }

  let hour = if let Some(ampm_match) =
    captures.name("ampm")
  {
    let ampm = ampm_match
      .as_str()
      .to_ascii_lowercase();
    if raw_hour == 0 || raw_hour > 12 {
      return None;
    }
    match (ampm.as_str(), raw_hour) {
      | ("am", 12) => 0,
      | ("am", h) => h,
      | ("pm", 12) => 12,
      | ("pm", h) => h + 12,
      | _ => return None
    }
  } else {
    if raw_hour > 23 {
      return None;
    }
    raw_hour
  };

  Some((hour, minute))
}

#[cfg(test)]
mod tests {
  use chrono::{
    Duration,
    NaiveDate,
    NaiveDateTime
  };

  use super::{
    Schedule,
    format_remaining,
    parse_when
  };

  fn at(
    y: i32,
    m: u32,
    d: u32,
    hh: u32,
    mm: u32
  ) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
      .expect("valid date")
      .and_hms_opt(hh, mm, 0)
      .expect("valid time")
  }

  #[test]
  fn canonical_text_round_trips() {
    let schedule = Schedule::from_text(
      "05 Mar 2026 21:30"
    );
    assert_eq!(
      schedule,
      Schedule::At(at(2026, 3, 5, 21, 30))
    );
    assert_eq!(
      schedule.to_string(),
      "05 Mar 2026 21:30"
    );
  }

  #[test]
  fn malformed_text_becomes_invalid_date(
  ) {
    for raw in [
      "tomorrow-ish",
      "2026-03-05 21:30",
      "31 Feb 2026 10:00",
      ""
    ] {
      let schedule =
        Schedule::from_text(raw);
      assert_eq!(
        schedule,
        Schedule::Invalid
      );
      assert_eq!(
        schedule.to_string(),
        "Invalid Date"
      );
    }
  }

  #[test]
  fn not_applicable_is_preserved() {
    assert_eq!(
      Schedule::from_text("N/A"),
      Schedule::NotApplicable
    );
    assert_eq!(
      Schedule::NotApplicable
        .to_string(),
      "N/A"
    );
  }

  #[test]
  fn remaining_is_days_hours_minutes() {
    let remaining = Duration::days(2)
      + Duration::hours(3)
      + Duration::minutes(7)
      + Duration::seconds(59);
    assert_eq!(
      format_remaining(remaining),
      "2 d : 03 h : 07 m"
    );
    assert_eq!(
      format_remaining(
        Duration::seconds(30)
      ),
      "0 d : 00 h : 00 m"
    );
  }

  #[test]
  fn parses_clock_time_with_meridiem() {
    let now = at(2026, 2, 17, 23, 0);
    let parsed = parse_when(
      "2026-02-20 3:23pm",
      now
    )
    .expect("parse date and clock");
    assert_eq!(
      parsed,
      Schedule::At(at(2026, 2, 20, 15, 23))
    );
  }

  #[test]
  fn bare_clock_time_rolls_to_next_day() {
    let now = at(2026, 2, 17, 23, 0);
    let parsed =
      parse_when("21:30", now)
        .expect("parse clock");
    assert_eq!(
      parsed,
      Schedule::At(at(2026, 2, 18, 21, 30))
    );
  }

  #[test]
  fn relative_offsets_drop_seconds() {
    let now = at(2026, 2, 17, 12, 0)
      + Duration::seconds(42);
    assert_eq!(
      parse_when("+2h", now)
        .expect("parse relative"),
      Schedule::At(at(2026, 2, 17, 14, 0))
    );
    assert_eq!(
      parse_when("+1w", now)
        .expect("parse weeks"),
      Schedule::At(at(2026, 2, 24, 12, 0))
    );
  }

  #[test]
  fn tomorrow_with_clock() {
    let now = at(2026, 2, 28, 8, 0);
    assert_eq!(
      parse_when("tomorrow 7:05am", now)
        .expect("parse tomorrow"),
      Schedule::At(at(2026, 3, 1, 7, 5))
    );
  }

  #[test]
  fn rejects_garbage() {
    let now = at(2026, 2, 17, 12, 0);
    assert!(
      parse_when("whenever", now)
        .is_err()
    );
    assert!(
      parse_when("today 25:00", now)
        .is_err()
    );
  }
}

pub mod schedule_serde {
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  use super::Schedule;

  pub fn serialize<S>(
    schedule: &Schedule,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    serializer.collect_str(schedule)
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<Schedule, D::Error>
  where
    D: Deserializer<'de>
  {
    let raw = Option::<String>::deserialize(
      deserializer
    )?;
    Ok(match raw {
      | Some(raw) => {
        Schedule::from_text(&raw)
      }
      | None => Schedule::NotApplicable
    })
  }
}
