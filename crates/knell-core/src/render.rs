use std::io::{self, IsTerminal, Write};

use chrono::NaiveDateTime;
use unicode_width::UnicodeWidthStr;

use crate::alarm::{Countdown, RowStatus};
use crate::config::Config;
use crate::entry::TabKind;
use crate::registry::TabRegistry;
use crate::store::StoredEntry;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color = cfg.get_bool("color").unwrap_or(true);
        Ok(Self { color })
    }

    #[tracing::instrument(skip(self, rows, now))]
    pub fn print_entries(
        &mut self,
        title: &str,
        kind: TabKind,
        rows: &[&StoredEntry],
        now: NaiveDateTime,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{title}")?;
        if rows.is_empty() {
            writeln!(out, "No entries.")?;
            return Ok(());
        }

        let body = rows
            .iter()
            .map(|row| self.entry_cells(kind, row, &Countdown::of(&row.entry, now)))
            .collect();
        write_table(&mut out, entry_headers(kind), body)?;
        Ok(())
    }

    /// One frame of the watch screen for a single tab.
    pub fn print_board(
        &mut self,
        title: &str,
        kind: TabKind,
        rows: &[StoredEntry],
        statuses: &[RowStatus],
        clear: bool,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        if clear && self.is_terminal() {
            write!(out, "{CLEAR_SCREEN}")?;
        }
        writeln!(out, "{title}")?;

        let body = statuses
            .iter()
            .filter_map(|status| {
                rows.get(status.position)
                    .map(|row| self.entry_cells(kind, row, &status.countdown))
            })
            .collect();
        write_table(&mut out, entry_headers(kind), body)?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }

    pub fn print_tabs(&mut self, registry: &TabRegistry) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let headers = vec![
            "#".to_string(),
            "Name".to_string(),
            "File".to_string(),
            String::new(),
        ];
        let rows = registry
            .tabs()
            .iter()
            .enumerate()
            .map(|(idx, tab)| {
                let marker = if idx == registry.current_index() {
                    self.paint("current", "32")
                } else {
                    String::new()
                };
                vec![
                    self.paint(&idx.to_string(), "33"),
                    tab.name.clone(),
                    tab.filename.clone(),
                    marker,
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    pub fn print_entry_info(
        &mut self,
        kind: TabKind,
        row: &StoredEntry,
        now: NaiveDateTime,
    ) -> anyhow::Result<()> {
        let entry = &row.entry;
        let mut rows = vec![
            vec!["Position".to_string(), entry.entry_position.to_string()],
            vec!["Id".to_string(), row.id.clone()],
            vec!["Name".to_string(), entry.name.clone()],
        ];
        if kind == TabKind::Watch {
            rows.push(vec![
                "Episode".to_string(),
                entry.episode.clone().unwrap_or_default(),
            ]);
        }
        rows.extend([
            vec!["Date and Time".to_string(), entry.datetime.to_string()],
            vec![
                "Countdown".to_string(),
                Countdown::of(entry, now).to_string(),
            ],
            vec!["Status".to_string(), if entry.status { "done" } else { "open" }.to_string()],
            vec!["Alarm".to_string(), on_off(entry.alarm)],
            vec!["Snooze".to_string(), on_off(entry.snooze)],
        ]);
        for (key, value) in &entry.extra {
            rows.push(vec![key.clone(), value.to_string()]);
        }

        let mut out = io::stdout().lock();
        write_table(&mut out, vec!["Field".to_string(), "Value".to_string()], rows)?;
        Ok(())
    }

    pub fn print_config(&mut self, cfg: &Config) -> anyhow::Result<()> {
        let mut pairs: Vec<(&String, &String)> = cfg.iter().collect();
        pairs.sort();
        let rows = pairs
            .into_iter()
            .map(|(key, value)| vec![key.clone(), value.clone()])
            .collect();

        let mut out = io::stdout().lock();
        write_table(&mut out, vec!["Key".to_string(), "Value".to_string()], rows)?;
        for file in &cfg.loaded_files {
            writeln!(out, "loaded {}", file.display())?;
        }
        Ok(())
    }

    fn entry_cells(&self, kind: TabKind, row: &StoredEntry, countdown: &Countdown) -> Vec<String> {
        let entry = &row.entry;
        let countdown_text = countdown.to_string();
        let countdown_cell = match countdown {
            Countdown::Overtime => self.paint(&countdown_text, "31"),
            Countdown::Completed => self.paint(&countdown_text, "32"),
            Countdown::InvalidDate => self.paint(&countdown_text, "33"),
            _ => countdown_text,
        };
        let snooze = if !entry.alarm {
            "-".to_string()
        } else {
            on_off(entry.snooze)
        };

        let mut cells = vec![
            self.paint(&entry.entry_position.to_string(), "33"),
            entry.name.clone(),
        ];
        if kind == TabKind::Watch {
            cells.push(entry.episode.clone().unwrap_or_default());
        }
        cells.extend([
            entry.datetime.to_string(),
            countdown_cell,
            if entry.status { "done".to_string() } else { String::new() },
            on_off(entry.alarm),
            snooze,
        ]);
        cells
    }

    fn is_terminal(&self) -> bool {
        io::stdout().is_terminal()
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !self.is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn entry_headers(kind: TabKind) -> Vec<String> {
    let mut headers = vec!["#", "Name"];
    if kind == TabKind::Watch {
        headers.push("Episode");
    }
    headers.extend(["Date and Time", "Countdown", "Status", "Alarm", "Snooze"]);
    headers.into_iter().map(ToString::to_string).collect()
}

fn on_off(flag: bool) -> String {
    if flag { "on" } else { "off" }.to_string()
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
