use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::alarm::{AlarmTimings, Clock, SystemClock};
use crate::cli::Invocation;
use crate::config::{Config, expand_tilde};
use crate::datetime::{Schedule, parse_when};
use crate::entry::TabKind;
use crate::registry::TabRegistry;
use crate::render::Renderer;
use crate::sound::SoundPlayer;
use crate::store::{EntryStore, SortKey, SortOrder};
use crate::watch::{self, WatchOptions, Watcher};

const DEFAULT_SOUND_FILE: &str = "alarm.mp3";

pub fn known_command_names() -> Vec<&'static str> {
    vec![
        "list", "info", "add", "edit", "done", "undone", "alarm", "snooze", "delete", "up",
        "down", "week", "tabs", "tab", "watch", "config", "help", "version",
    ]
}

pub fn expand_command_abbrev<'a>(token: &'a str, known: &[&'a str]) -> Option<&'a str> {
    if known.contains(&token) {
        return Some(token);
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

/// Everything a command needs: settings, the data directory and the tab registry.
#[derive(Debug)]
pub struct Session {
    pub cfg: Config,
    pub data_dir: PathBuf,
    pub registry: TabRegistry,
    /// `--tab` selector; the registry's current tab when absent.
    pub tab: Option<String>,
}

impl Session {
    pub fn new(cfg: Config, data_dir: PathBuf, tab: Option<String>) -> anyhow::Result<Self> {
        let registry = TabRegistry::load(&data_dir)?;
        Ok(Self {
            cfg,
            data_dir,
            registry,
            tab,
        })
    }

    pub fn active_index(&self) -> anyhow::Result<usize> {
        match self.tab.as_deref() {
            Some(selector) => self.registry.resolve(selector),
            None => {
                self.registry.current()?;
                Ok(self.registry.current_index())
            }
        }
    }

    pub fn watch_keywords(&self) -> Vec<String> {
        self.cfg.get_list("watch.keywords")
    }

    /// Opens the store behind the active tab.
    #[instrument(skip(self))]
    pub fn open_active(&self) -> anyhow::Result<(usize, EntryStore)> {
        let index = self.active_index()?;
        let path = self.registry.backing_path(index)?;
        let kind = TabKind::detect(&path, &self.watch_keywords());
        let store = EntryStore::open(&path, kind)?;
        Ok((index, store))
    }

    fn tab_title(&self, index: usize) -> anyhow::Result<String> {
        Ok(format!("[{index}] {}", self.registry.tab(index)?.name))
    }
}

#[instrument(skip(session, renderer, inv))]
pub fn dispatch(
    session: &mut Session,
    renderer: &mut Renderer,
    inv: Invocation,
) -> anyhow::Result<()> {
    let command = inv.command.as_str();
    let args = inv.command_args.as_slice();
    debug!(command, args = ?args, "dispatching command");

    match command {
        "list" => cmd_list(session, renderer, args),
        "info" => cmd_info(session, renderer, args),
        "add" => cmd_add(session, args),
        "edit" => cmd_edit(session, args),
        "done" => cmd_status(session, args, true),
        "undone" => cmd_status(session, args, false),
        "alarm" => cmd_alarm(session, args),
        "snooze" => cmd_snooze(session, args),
        "delete" => cmd_delete(session, args),
        "up" => cmd_move(session, args, true),
        "down" => cmd_move(session, args, false),
        "week" => cmd_week(session, args),
        "tabs" => cmd_tabs(session, renderer),
        "tab" => cmd_tab(session, args),
        "watch" => cmd_watch(session, renderer, args),
        "config" => renderer.print_config(&session.cfg),
        "help" => cmd_help(),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

#[instrument(skip(session, renderer, args))]
fn cmd_list(session: &Session, renderer: &mut Renderer, args: &[String]) -> anyhow::Result<()> {
    info!("command list");

    let mut sort = None;
    let mut order = SortOrder::Ascending;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--sort" => {
                let key = iter
                    .next()
                    .ok_or_else(|| anyhow!("--sort needs name or datetime"))?;
                sort = Some(parse_sort_key(key)?);
            }
            "--desc" => order = SortOrder::Descending,
            other => bail!("unexpected list argument: {other}"),
        }
    }

    let (index, store) = session.open_active()?;
    let rows = match sort {
        Some(key) => store.sorted(key, order),
        None if order == SortOrder::Descending => store.entries().iter().rev().collect(),
        None => store.entries().iter().collect(),
    };
    renderer.print_entries(
        &session.tab_title(index)?,
        store.kind(),
        &rows,
        SystemClock.now(),
    )
}

#[instrument(skip(session, renderer, args))]
fn cmd_info(session: &Session, renderer: &mut Renderer, args: &[String]) -> anyhow::Result<()> {
    info!("command info");
    let (position, _) = take_position(args)?;
    let (_, store) = session.open_active()?;
    let row = store.get(position)?;
    renderer.print_entry_info(store.kind(), row, SystemClock.now())
}

#[instrument(skip(session, args))]
fn cmd_add(session: &Session, args: &[String]) -> anyhow::Result<()> {
    info!("command add");

    let parsed = parse_add_args(args)?;
    let schedule = match parsed.at.as_deref() {
        Some(when) => parse_when(when, SystemClock.now())?,
        None => Schedule::NotApplicable,
    };

    let (_, mut store) = session.open_active()?;
    let row = store.add(&parsed.name, schedule, parsed.episode)?;
    let position = row.entry.entry_position;
    println!("Added entry {position} ({}).", row.entry.name);
    Ok(())
}

#[instrument(skip(session, args))]
fn cmd_edit(session: &Session, args: &[String]) -> anyhow::Result<()> {
    info!("command edit");

    let (position, rest) = take_position(args)?;
    let Some((field, value)) = rest.split_first() else {
        bail!("usage: edit POS name|episode|datetime VALUE...");
    };
    let value = value.join(" ");
    if value.trim().is_empty() {
        bail!("edit needs a value for {field}");
    }

    let (_, mut store) = session.open_active()?;
    let shown = match field.to_ascii_lowercase().as_str() {
        "name" => {
            store.set_name(position, &value)?;
            store.get(position)?.entry.name.clone()
        }
        "episode" | "ep" => {
            store.set_episode(position, &value)?;
            store.get(position)?.entry.episode.clone().unwrap_or_default()
        }
        "datetime" | "date" | "when" => {
            let schedule = match parse_when(&value, SystemClock.now()) {
                Ok(schedule) => {
                    store.set_datetime(position, schedule)?;
                    schedule
                }
                Err(err) => {
                    debug!(error = %format!("{err:#}"), "storing datetime as typed");
                    store.set_datetime_text(position, &value)?
                }
            };
            schedule.to_string()
        }
        other => bail!("unknown field {other:?}; expected name, episode or datetime"),
    };
    println!("Modified entry {position}: {field} = {shown}.");
    Ok(())
}

#[instrument(skip(session, args))]
fn cmd_status(session: &Session, args: &[String], done: bool) -> anyhow::Result<()> {
    info!(done, "command status");
    let (position, _) = take_position(args)?;
    let (_, mut store) = session.open_active()?;
    store.set_status(position, done)?;
    let verb = if done { "Completed" } else { "Reopened" };
    println!("{verb} entry {position}.");
    Ok(())
}

#[instrument(skip(session, args))]
fn cmd_alarm(session: &Session, args: &[String]) -> anyhow::Result<()> {
    info!("command alarm");
    let (position, on) = take_position_and_switch(args)?;
    let (_, mut store) = session.open_active()?;
    store.set_alarm(position, on)?;
    println!("Alarm {} for entry {position}.", if on { "on" } else { "off" });
    Ok(())
}

#[instrument(skip(session, args))]
fn cmd_snooze(session: &Session, args: &[String]) -> anyhow::Result<()> {
    info!("command snooze");
    let (position, on) = take_position_and_switch(args)?;
    let (_, mut store) = session.open_active()?;
    store.set_snooze(position, on)?;
    println!("Snooze {} for entry {position}.", if on { "on" } else { "off" });
    Ok(())
}

#[instrument(skip(session, args))]
fn cmd_delete(session: &Session, args: &[String]) -> anyhow::Result<()> {
    info!("command delete");
    let (position, _) = take_position(args)?;
    let (_, mut store) = session.open_active()?;
    let removed = store.remove(position)?;
    println!("Deleted entry {position} ({}).", removed.entry.name);
    Ok(())
}

#[instrument(skip(session, args))]
fn cmd_move(session: &Session, args: &[String], up: bool) -> anyhow::Result<()> {
    info!(up, "command move");
    let (position, _) = take_position(args)?;
    let (_, mut store) = session.open_active()?;
    let moved_to = if up {
        store.move_up(position)?
    } else {
        store.move_down(position)?
    };
    if moved_to == position {
        println!("Entry {position} is already at the edge.");
    } else {
        println!("Moved entry {position} to {moved_to}.");
    }
    Ok(())
}

#[instrument(skip(session, args))]
fn cmd_week(session: &Session, args: &[String]) -> anyhow::Result<()> {
    info!("command week");
    let (position, _) = take_position(args)?;
    let (_, mut store) = session.open_active()?;
    store.advance_week(position)?;
    let entry = &store.get(position)?.entry;
    println!(
        "Advanced entry {position} to {} ({}).",
        entry.episode.as_deref().unwrap_or_default(),
        entry.datetime
    );
    Ok(())
}

#[instrument(skip(session, renderer))]
fn cmd_tabs(session: &Session, renderer: &mut Renderer) -> anyhow::Result<()> {
    info!("command tabs");
    if session.registry.tabs().is_empty() {
        println!("No tabs.");
        return Ok(());
    }
    renderer.print_tabs(&session.registry)
}

#[instrument(skip(session, args))]
fn cmd_tab(session: &mut Session, args: &[String]) -> anyhow::Result<()> {
    info!("command tab");

    let Some((action, rest)) = args.split_first() else {
        bail!("usage: tab add|remove|rename|switch ...");
    };
    let registry = &mut session.registry;
    match action.as_str() {
        "add" => {
            let name = rest.join(" ");
            let index = registry.add(&name, SystemClock.now())?;
            println!(
                "Created tab {index} ({}) in {}.",
                registry.tab(index)?.name,
                registry.tab(index)?.filename
            );
        }
        "remove" => {
            let selector = rest
                .first()
                .ok_or_else(|| anyhow!("tab remove needs an index or name"))?;
            let index = registry.resolve(selector)?;
            let removed = registry.remove(index)?;
            println!("Removed tab {index} ({}).", removed.name);
        }
        "rename" => {
            let Some((selector, name)) = rest.split_first() else {
                bail!("usage: tab rename IDX NAME...");
            };
            let index = registry.resolve(selector)?;
            registry.rename(index, &name.join(" "))?;
            println!("Renamed tab {index}.");
        }
        "switch" => {
            let selector = rest
                .first()
                .ok_or_else(|| anyhow!("tab switch needs an index or name"))?;
            let index = registry.resolve(selector)?;
            registry.switch(index)?;
            println!("Switched to tab {index} ({}).", registry.tab(index)?.name);
        }
        other => bail!("unknown tab action {other:?}; expected add, remove, rename or switch"),
    }
    Ok(())
}

#[instrument(skip(session, renderer, args))]
fn cmd_watch(session: &Session, renderer: &mut Renderer, args: &[String]) -> anyhow::Result<()> {
    info!("command watch");

    let mut options = WatchOptions {
        all_tabs: false,
        ticks: None,
        interval: Duration::from_millis(session.cfg.get_u64("tick.interval")?.unwrap_or(1000)),
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--all" => options.all_tabs = true,
            "--ticks" => {
                let raw = iter.next().ok_or_else(|| anyhow!("--ticks needs a count"))?;
                let ticks = raw
                    .parse::<u64>()
                    .with_context(|| format!("invalid tick count {raw:?}"))?;
                options.ticks = Some(ticks);
            }
            other => bail!("unexpected watch argument: {other}"),
        }
    }

    let current = session.active_index()?;
    let timings = AlarmTimings::from_config(&session.cfg)?;
    let sound = resolve_sound_path(&session.cfg, &session.data_dir);
    if !sound.is_file() {
        warn!(sound = %sound.display(), "alarm sound not found; alarms will use the terminal bell");
    }
    let player = session.cfg.get("alarm.player");
    let sink = SoundPlayer::new(&sound, player.as_deref(), timings.ring);

    let mut watcher = Watcher::open(
        &session.registry,
        &session.watch_keywords(),
        timings,
        SystemClock,
        sink,
    )?;
    watch::run(&mut watcher, renderer, current, &options)
}

fn cmd_help() -> anyhow::Result<()> {
    println!(
        "Commands: list [--sort name|datetime] [--desc], info POS, add NAME... [--at WHEN] [--episode EP], \
         edit POS name|episode|datetime VALUE..., done POS, undone POS, alarm POS on|off, \
         snooze POS on|off, delete POS, up POS, down POS, week POS, tabs, \
         tab add|remove|rename|switch, watch [--all] [--ticks N], config, help, version"
    );
    Ok(())
}

fn resolve_sound_path(cfg: &Config, data_dir: &Path) -> PathBuf {
    match cfg.get("alarm.sound") {
        Some(raw) if !raw.trim().is_empty() => {
            let path = expand_tilde(Path::new(raw.trim()));
            if path.is_absolute() {
                path
            } else {
                data_dir.join(path)
            }
        }
        _ => data_dir.join(DEFAULT_SOUND_FILE),
    }
}

fn parse_sort_key(raw: &str) -> anyhow::Result<SortKey> {
    match raw.to_ascii_lowercase().as_str() {
        "name" => Ok(SortKey::Name),
        "datetime" | "date" | "time" => Ok(SortKey::Datetime),
        other => Err(anyhow!("unknown sort key {other:?}; expected name or datetime")),
    }
}

fn take_position(args: &[String]) -> anyhow::Result<(usize, &[String])> {
    let Some((first, rest)) = args.split_first() else {
        bail!("missing entry position");
    };
    let position = first
        .parse::<usize>()
        .with_context(|| format!("invalid entry position {first:?}"))?;
    Ok((position, rest))
}

fn take_position_and_switch(args: &[String]) -> anyhow::Result<(usize, bool)> {
    let (position, rest) = take_position(args)?;
    let Some(raw) = rest.first() else {
        bail!("expected on or off after the position");
    };
    let on = match raw.to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "1" => true,
        "off" | "no" | "false" | "0" => false,
        other => bail!("expected on or off, got {other:?}"),
    };
    Ok((position, on))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct AddArgs {
    name: String,
    at: Option<String>,
    episode: Option<String>,
}

/// `--at` and `--episode` take every following word up to the next flag.
fn parse_add_args(args: &[String]) -> anyhow::Result<AddArgs> {
    #[derive(Clone, Copy)]
    enum Slot {
        Name,
        At,
        Episode,
    }

    let mut name: Vec<&str> = Vec::new();
    let mut at: Option<Vec<&str>> = None;
    let mut episode: Option<Vec<&str>> = None;
    let mut slot = Slot::Name;

    for arg in args {
        match arg.as_str() {
            "--at" => {
                at = Some(Vec::new());
                slot = Slot::At;
            }
            "--episode" => {
                episode = Some(Vec::new());
                slot = Slot::Episode;
            }
            word => match slot {
                Slot::Name => name.push(word),
                Slot::At => at.get_or_insert_with(Vec::new).push(word),
                Slot::Episode => episode.get_or_insert_with(Vec::new).push(word),
            },
        }
    }

    let name = name.join(" ");
    if name.trim().is_empty() {
        bail!("add needs a name");
    }

    Ok(AddArgs {
        name,
        at: flag_value(at, "--at")?,
        episode: flag_value(episode, "--episode")?,
    })
}

fn flag_value(words: Option<Vec<&str>>, flag: &str) -> anyhow::Result<Option<String>> {
    match words {
        Some(words) if words.is_empty() => Err(anyhow!("{flag} needs a value")),
        Some(words) => Ok(Some(words.join(" "))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn abbreviations_must_be_unique() {
        let known = known_command_names();
        assert_eq!(expand_command_abbrev("tab", &known), Some("tab"));
        assert_eq!(expand_command_abbrev("tabs", &known), Some("tabs"));
        assert_eq!(expand_command_abbrev("sn", &known), Some("snooze"));
        assert_eq!(expand_command_abbrev("we", &known), Some("week"));
        assert_eq!(expand_command_abbrev("d", &known), None);
        assert_eq!(expand_command_abbrev("xyz", &known), None);
    }

    #[test]
    fn add_args_split_name_and_flags() {
        let parsed = parse_add_args(&strings(&[
            "Frieren",
            "S2",
            "--at",
            "tomorrow",
            "18:30",
            "--episode",
            "S02",
            "E-01",
        ]))
        .expect("parse");
        assert_eq!(
            parsed,
            AddArgs {
                name: "Frieren S2".to_string(),
                at: Some("tomorrow 18:30".to_string()),
                episode: Some("S02 E-01".to_string()),
            }
        );

        assert!(parse_add_args(&strings(&["--at", "now"])).is_err());
        assert!(parse_add_args(&strings(&["tea", "--at"])).is_err());
    }

    #[test]
    fn positions_and_switches_parse() {
        let args = strings(&["4", "ON"]);
        assert_eq!(take_position_and_switch(&args).expect("switch"), (4, true));
        assert!(take_position_and_switch(&strings(&["4"])).is_err());
        assert!(take_position_and_switch(&strings(&["x", "on"])).is_err());
        assert!(take_position(&[]).is_err());
    }

    #[test]
    fn sound_path_resolves_against_data_dir() {
        let data = Path::new("/srv/knell");
        let mut cfg = Config::defaults();
        assert_eq!(resolve_sound_path(&cfg, data), data.join("alarm.mp3"));
        cfg.apply_overrides([("alarm.sound".to_string(), "bells/ding.wav".to_string())]);
        assert_eq!(resolve_sound_path(&cfg, data), data.join("bells/ding.wav"));
        cfg.apply_overrides([("alarm.sound".to_string(), "/tmp/x.wav".to_string())]);
        assert_eq!(resolve_sound_path(&cfg, data), PathBuf::from("/tmp/x.wav"));
    }
}
