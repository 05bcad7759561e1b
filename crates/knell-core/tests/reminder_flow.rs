use chrono::{Duration, NaiveDate, NaiveDateTime};
use knell_core::alarm::{AlarmTimings, Countdown, FireReason, ManualClock};
use knell_core::datetime::Schedule;
use knell_core::entry::TabKind;
use knell_core::registry::TabRegistry;
use knell_core::sound::RecordingSink;
use knell_core::store::EntryStore;
use knell_core::watch::Watcher;
use tempfile::tempdir;

fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 6, day)
        .expect("date")
        .and_hms_opt(hour, minute, 0)
        .expect("time")
}

fn keywords() -> Vec<String> {
    ["anime", "series"].iter().map(ToString::to_string).collect()
}

fn positions(store: &EntryStore) -> Vec<usize> {
    store
        .entries()
        .iter()
        .map(|row| row.entry.entry_position)
        .collect()
}

#[test]
fn positions_stay_dense_across_edits_and_reopen() {
    let temp = tempdir().expect("tempdir");
    let registry = TabRegistry::load(temp.path()).expect("registry");
    let path = registry.backing_path(0).expect("path");
    let mut store = EntryStore::open(&path, TabKind::Plain).expect("store");

    for name in ["a", "b", "c", "d", "e"] {
        store.add(name, Schedule::NotApplicable, None).expect("add");
    }
    store.remove(1).expect("remove");
    store.move_up(3).expect("up");
    store.move_down(0).expect("down");
    assert_eq!(positions(&store), vec![0, 1, 2, 3]);

    let names: Vec<&str> = store
        .entries()
        .iter()
        .map(|row| row.entry.name.as_str())
        .collect();
    assert_eq!(names, vec!["c", "a", "e", "d"]);

    let reopened = EntryStore::open(&path, TabKind::Plain).expect("reopen");
    assert_eq!(reopened.entries(), store.entries());
}

#[test]
fn malformed_datetime_edit_shows_invalid_date() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("chores.json");
    let mut store = EntryStore::open(&path, TabKind::Plain).expect("store");
    store
        .add("laundry", Schedule::At(at(1, 10, 0)), None)
        .expect("add");

    let schedule = store
        .set_datetime_text(0, "sometime next week")
        .expect("edit");
    assert_eq!(schedule, Schedule::Invalid);
    assert_eq!(
        Countdown::of(&store.get(0).expect("row").entry, at(1, 9, 0)).to_string(),
        "Invalid Date"
    );

    let raw = std::fs::read_to_string(&path).expect("read");
    assert!(raw.contains("Invalid Date"));
}

#[test]
fn clearing_alarm_before_snooze_delay_prevents_second_ring() {
    let temp = tempdir().expect("tempdir");
    let registry = TabRegistry::load(temp.path()).expect("registry");
    let path = registry.backing_path(0).expect("path");
    let mut store = EntryStore::open(&path, TabKind::Plain).expect("store");
    store
        .add("call home", Schedule::At(at(2, 18, 0)), None)
        .expect("add");
    store.set_alarm(0, true).expect("alarm");
    store.set_snooze(0, true).expect("snooze");

    let clock = ManualClock::new(at(2, 17, 59));
    let mut watcher = Watcher::open(
        &registry,
        &keywords(),
        AlarmTimings::default(),
        &clock,
        RecordingSink::default(),
    )
    .expect("watcher");
    watcher.tick();

    clock.set(at(2, 18, 1));
    watcher.tick();
    assert_eq!(watcher.sink().rings.len(), 1);

    // another invocation turns the alarm off while the snooze is pending
    store.set_alarm(0, false).expect("alarm off");
    clock.advance(Duration::minutes(5));
    watcher.tick();
    watcher.tick();
    assert_eq!(watcher.sink().rings.len(), 1);
}

#[test]
fn completed_entries_never_ring() {
    let temp = tempdir().expect("tempdir");
    let registry = TabRegistry::load(temp.path()).expect("registry");
    let path = registry.backing_path(0).expect("path");
    let mut store = EntryStore::open(&path, TabKind::Plain).expect("store");
    store
        .add("pay rent", Schedule::At(at(3, 9, 0)), None)
        .expect("add");
    store.set_alarm(0, true).expect("alarm");
    store.set_status(0, true).expect("done");

    let clock = ManualClock::new(at(3, 12, 0));
    let mut watcher = Watcher::open(
        &registry,
        &keywords(),
        AlarmTimings::default(),
        &clock,
        RecordingSink::default(),
    )
    .expect("watcher");
    let reports = watcher.tick();
    assert_eq!(reports[0].rows[0].countdown, Countdown::Completed);
    assert!(watcher.sink().rings.is_empty());
}

#[test]
fn watch_tab_episode_advances_by_a_week() {
    let temp = tempdir().expect("tempdir");
    let mut registry = TabRegistry::load(temp.path()).expect("registry");
    let index = registry.add("Series night", at(4, 20, 0)).expect("tab");
    let path = registry.backing_path(index).expect("path");
    assert_eq!(TabKind::detect(&path, &keywords()), TabKind::Watch);

    let mut store = EntryStore::open(&path, TabKind::Watch).expect("store");
    store
        .add("Severance", Schedule::At(at(4, 21, 0)), Some("S02 E-09".to_string()))
        .expect("add");
    assert!(store.advance_week(0).is_err());

    store.set_status(0, true).expect("done");
    store.advance_week(0).expect("advance");
    let entry = &store.get(0).expect("row").entry;
    assert_eq!(entry.episode.as_deref(), Some("S02 E-10"));
    assert_eq!(entry.datetime, Schedule::At(at(11, 21, 0)));
    assert!(!entry.status);
}

#[test]
fn rung_alarm_rearms_after_reschedule() {
    let temp = tempdir().expect("tempdir");
    let registry = TabRegistry::load(temp.path()).expect("registry");
    let path = registry.backing_path(0).expect("path");
    let mut store = EntryStore::open(&path, TabKind::Plain).expect("store");
    store
        .add("water plants", Schedule::At(at(5, 8, 0)), None)
        .expect("add");
    store.set_alarm(0, true).expect("alarm");

    let clock = ManualClock::new(at(5, 7, 59));
    let mut watcher = Watcher::open(
        &registry,
        &keywords(),
        AlarmTimings::default(),
        &clock,
        RecordingSink::default(),
    )
    .expect("watcher");
    watcher.tick();
    clock.set(at(5, 8, 1));
    watcher.tick();
    assert_eq!(watcher.sink().rings.len(), 1);

    store
        .set_datetime(0, Schedule::At(at(5, 9, 0)))
        .expect("reschedule");
    clock.set(at(5, 8, 30));
    watcher.tick();
    clock.set(at(5, 9, 1));
    watcher.tick();

    let rings = &watcher.sink().rings;
    assert_eq!(rings.len(), 2);
    assert!(rings.iter().all(|ring| ring.reason == FireReason::Due));
}
