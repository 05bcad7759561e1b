use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;

use chrono::{Duration, NaiveDateTime, Utc};
use tracing::{debug, info};

use crate::config::Config;
use crate::datetime::{Schedule, format_remaining, to_wall_clock};
use crate::entry::Entry;
use crate::store::StoredEntry;

/// Source of wall-clock time for countdowns.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        to_wall_clock(Utc::now())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Cell<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        self.now.get()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> NaiveDateTime {
        (**self).now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmTimings {
    /// Minimum gap between two regular firings, across all tabs.
    pub cooldown: Duration,
    pub snooze: Duration,
    /// How long the sound plays.
    pub ring: std::time::Duration,
}

impl Default for AlarmTimings {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(2),
            snooze: Duration::minutes(3),
            ring: std::time::Duration::from_secs(5),
        }
    }
}

impl AlarmTimings {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let seconds = |key: &str, fallback: Duration| -> anyhow::Result<Duration> {
            Ok(cfg
                .get_u64(key)?
                .and_then(|secs| i64::try_from(secs).ok())
                .map(Duration::seconds)
                .unwrap_or(fallback))
        };
        Ok(Self {
            cooldown: seconds("alarm.cooldown", defaults.cooldown)?,
            snooze: seconds("alarm.snooze", defaults.snooze)?,
            ring: cfg
                .get_u64("alarm.duration")?
                .map(std::time::Duration::from_secs)
                .unwrap_or(defaults.ring),
        })
    }
}

/// Process-wide rate limiter shared by every tab.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown: Duration,
    last_fired: Option<NaiveDateTime>,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: None,
        }
    }

    pub fn is_open(&self, now: NaiveDateTime) -> bool {
        match self.last_fired {
            None => true,
            Some(last) => now - last > self.cooldown,
        }
    }

    pub fn stamp(&mut self, now: NaiveDateTime) {
        self.last_fired = Some(now);
    }

    pub fn last_fired(&self) -> Option<NaiveDateTime> {
        self.last_fired
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Countdown {
    NotApplicable,
    InvalidDate,
    Completed,
    Remaining(Duration),
    Overtime,
}

impl Countdown {
    pub fn of(entry: &Entry, now: NaiveDateTime) -> Self {
        match entry.datetime {
            Schedule::NotApplicable => Self::NotApplicable,
            Schedule::Invalid => Self::InvalidDate,
            Schedule::At(_) if entry.status => Self::Completed,
            Schedule::At(due) => {
                let remaining = due - now;
                if remaining > Duration::zero() {
                    Self::Remaining(remaining)
                } else {
                    Self::Overtime
                }
            }
        }
    }
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotApplicable => f.write_str("N/A"),
            Self::InvalidDate => f.write_str("Invalid Date"),
            Self::Completed => f.write_str("Completed"),
            Self::Remaining(remaining) => f.write_str(&format_remaining(*remaining)),
            Self::Overtime => f.write_str("Overtime"),
        }
    }
}

/// Identifies an entry across tabs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub tab: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    Due,
    Snooze,
    Startup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub key: EntryKey,
    pub name: String,
    pub position: usize,
    pub reason: FireReason,
    pub at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowStatus {
    pub id: String,
    pub position: usize,
    pub countdown: Countdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub rows: Vec<RowStatus>,
    pub fired: Vec<Firing>,
}

#[derive(Debug, Clone, Copy, Default)]
struct AlarmState {
    rung: bool,
    snooze_due: Option<NaiveDateTime>,
}

/// Countdown and alarm bookkeeping for every watched tab.
///
/// Rung marks and pending snoozes live in memory only; a fresh evaluator
/// starts with nothing rung.
#[derive(Debug)]
pub struct AlarmEvaluator {
    gate: CooldownGate,
    timings: AlarmTimings,
    states: HashMap<EntryKey, AlarmState>,
}

impl AlarmEvaluator {
    pub fn new(timings: AlarmTimings) -> Self {
        Self {
            gate: CooldownGate::new(timings.cooldown),
            timings,
            states: HashMap::new(),
        }
    }

    pub fn timings(&self) -> AlarmTimings {
        self.timings
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    pub fn has_rung(&self, key: &EntryKey) -> bool {
        self.states.get(key).is_some_and(|state| state.rung)
    }

    pub fn snooze_due(&self, key: &EntryKey) -> Option<NaiveDateTime> {
        self.states.get(key).and_then(|state| state.snooze_due)
    }

    /// Drops rung marks and pending snoozes of a tab that is no longer watched.
    pub fn forget_tab(&mut self, tab: &str) {
        self.states.retain(|key, _| key.tab != tab);
    }

    /// One evaluation pass over a tab's rows, in display order.
    #[tracing::instrument(skip(self, rows, now), fields(rows = rows.len()))]
    pub fn tick(&mut self, tab: &str, rows: &[StoredEntry], now: NaiveDateTime) -> TickReport {
        let mut report = TickReport::default();
        self.forget_missing(tab, rows);
        self.run_due_snoozes(tab, rows, now, &mut report);

        for (position, row) in rows.iter().enumerate() {
            let countdown = Countdown::of(&row.entry, now);
            let key = entry_key(tab, row);

            match countdown {
                Countdown::Overtime => {
                    if row.entry.alarm && !self.has_rung(&key) && self.gate.is_open(now) {
                        let firing = self.fire(key, row, position, FireReason::Due, now);
                        report.fired.push(firing);
                    }
                }
                Countdown::Remaining(_) => {
                    // rescheduled into the future; the next occurrence may ring again
                    if let Some(state) = self.states.get_mut(&key) {
                        state.rung = false;
                    }
                }
                Countdown::Completed | Countdown::NotApplicable | Countdown::InvalidDate => {}
            }

            report.rows.push(RowStatus {
                id: row.id.clone(),
                position,
                countdown,
            });
        }

        report
    }

    /// Rings the first overdue alarm of a freshly opened tab, ignoring the cooldown.
    #[tracing::instrument(skip(self, rows, now))]
    pub fn startup_scan(
        &mut self,
        tab: &str,
        rows: &[StoredEntry],
        now: NaiveDateTime,
    ) -> Option<Firing> {
        let (position, row) = rows.iter().enumerate().find(|(_, row)| {
            row.entry.alarm && row.entry.datetime.at().is_some_and(|due| due <= now)
        })?;
        let key = entry_key(tab, row);
        Some(self.fire(key, row, position, FireReason::Startup, now))
    }

    fn run_due_snoozes(
        &mut self,
        tab: &str,
        rows: &[StoredEntry],
        now: NaiveDateTime,
        report: &mut TickReport,
    ) {
        let mut due: Vec<EntryKey> = self
            .states
            .iter()
            .filter(|(key, state)| {
                key.tab == tab && state.snooze_due.is_some_and(|at| at <= now)
            })
            .map(|(key, _)| key.clone())
            .collect();
        due.sort();

        for key in due {
            if let Some(state) = self.states.get_mut(&key) {
                state.snooze_due = None;
            }
            let Some((position, row)) = rows
                .iter()
                .enumerate()
                .find(|(_, row)| row.id == key.id)
            else {
                continue;
            };
            if !row.entry.snooze_armed() {
                debug!(id = %key.id, "snooze lapsed; alarm or snooze was turned off");
                continue;
            }
            if let Some(state) = self.states.get_mut(&key) {
                state.rung = false;
            }
            let firing = self.fire(key, row, position, FireReason::Snooze, now);
            report.fired.push(firing);
        }
    }

    fn fire(
        &mut self,
        key: EntryKey,
        row: &StoredEntry,
        position: usize,
        reason: FireReason,
        now: NaiveDateTime,
    ) -> Firing {
        self.gate.stamp(now);
        let snooze_due = row.entry.snooze.then(|| now + self.timings.snooze);
        let state = self.states.entry(key.clone()).or_default();
        state.rung = true;
        state.snooze_due = snooze_due;

        info!(
            tab = %key.tab,
            id = %key.id,
            name = %row.entry.name,
            ?reason,
            snooze_due = ?snooze_due,
            "alarm fired"
        );
        Firing {
            key,
            name: row.entry.name.clone(),
            position,
            reason,
            at: now,
        }
    }

    fn forget_missing(&mut self, tab: &str, rows: &[StoredEntry]) {
        self.states
            .retain(|key, _| key.tab != tab || rows.iter().any(|row| row.id == key.id));
    }
}

fn entry_key(tab: &str, row: &StoredEntry) -> EntryKey {
    EntryKey {
        tab: tab.to_string(),
        id: row.id.clone(),
    }
}
