use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::datetime::{Schedule, schedule_serde};

pub const DEFAULT_EPISODE: &str = "S01 E-00";

pub const DEFAULT_WATCH_KEYWORDS: &[&str] = &[
    "anime", "animes", "movie", "movies", "tv", "series", "shows", "show", "seasons",
];

/// Whether a tab tracks episodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabKind {
    Plain,
    Watch,
}

impl TabKind {
    /// A tab is a watch tab when its backing file name contains one of the keywords.
    pub fn detect<S: AsRef<str>>(backing_file: &Path, keywords: &[S]) -> Self {
        let name = backing_file
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if keywords
            .iter()
            .any(|word| name.contains(&word.as_ref().to_lowercase()))
        {
            Self::Watch
        } else {
            Self::Plain
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub entry_position: usize,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<String>,

    #[serde(default, with = "schedule_serde")]
    pub datetime: Schedule,

    #[serde(default)]
    pub status: bool,

    #[serde(default)]
    pub alarm: bool,

    #[serde(default)]
    pub snooze: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceRefusal {
    NotCompleted,
    NoEpisodeNumber,
    NoTimestamp,
}

impl fmt::Display for AdvanceRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCompleted => f.write_str("entry is not marked done"),
            Self::NoEpisodeNumber => f.write_str("episode has no E-<number> part"),
            Self::NoTimestamp => f.write_str("entry has no valid date and time"),
        }
    }
}

impl std::error::Error for AdvanceRefusal {}

impl Entry {
    pub fn new(
        name: String,
        datetime: Schedule,
        episode: Option<String>,
        entry_position: usize,
    ) -> Self {
        Self {
            entry_position,
            name,
            episode,
            datetime,
            status: false,
            alarm: false,
            snooze: false,
            extra: BTreeMap::new(),
        }
    }

    /// Snooze only counts while the alarm itself is on.
    pub fn snooze_armed(&self) -> bool {
        self.alarm && self.snooze
    }

    /// Moves a finished episode to next week's slot and bumps the episode number.
    pub fn advance_week(&mut self) -> Result<(), AdvanceRefusal> {
        if !self.status {
            return Err(AdvanceRefusal::NotCompleted);
        }
        let Some(episode) = self.episode.as_deref() else {
            return Err(AdvanceRefusal::NoEpisodeNumber);
        };
        let Some(next_episode) = next_episode(episode) else {
            return Err(AdvanceRefusal::NoEpisodeNumber);
        };
        let Some(at) = self.datetime.at() else {
            return Err(AdvanceRefusal::NoTimestamp);
        };

        self.datetime = Schedule::At(at + Duration::weeks(1));
        self.status = false;
        self.episode = Some(next_episode);
        Ok(())
    }
}

/// `S01 E-07` style tags.
pub fn episode_is_well_formed(episode: &str) -> bool {
    Regex::new(r"^S\d+ E-\d+$")
        .map(|re| re.is_match(episode.trim()))
        .unwrap_or(false)
}

fn next_episode(episode: &str) -> Option<String> {
    let re = Regex::new(r"E-(\d+)").ok()?;
    let number: u64 = re.captures(episode)?.get(1)?.as_str().parse().ok()?;
    let replacement = format!("E-{:02}", number + 1);
    Some(re.replace(episode, replacement.as_str()).into_owned())
}
