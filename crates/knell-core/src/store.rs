use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::datetime::Schedule;
use crate::entry::{DEFAULT_EPISODE, Entry, TabKind};

/// One record together with the key it is stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub id: String,
    pub entry: Entry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Datetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// The entries of one tab, backed by a JSON object keyed by id.
///
/// Rows are held in display order; `entry_position` is rewritten from the
/// row index so positions stay a dense `0..n` range. Every mutation rewrites
/// the whole file; write failures are logged and otherwise ignored.
#[derive(Debug)]
pub struct EntryStore {
    path: PathBuf,
    kind: TabKind,
    rows: Vec<StoredEntry>,
    /// Checksum of the file as last loaded or saved; `None` when it did not exist.
    loaded_digest: Option<String>,
}

impl EntryStore {
    #[tracing::instrument(skip(path), fields(file = %path.display()))]
    pub fn open(path: &Path, kind: TabKind) -> anyhow::Result<Self> {
        let mut store = Self {
            path: path.to_path_buf(),
            kind,
            rows: Vec::new(),
            loaded_digest: None,
        };
        store.reload()?;
        info!(
            file = %store.path.display(),
            kind = ?store.kind,
            count = store.rows.len(),
            "opened entry store"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> TabKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn entries(&self) -> &[StoredEntry] {
        &self.rows
    }

    pub fn get(&self, position: usize) -> anyhow::Result<&StoredEntry> {
        self.rows.get(position).ok_or_else(|| {
            anyhow!(
                "no entry at position {position} (tab has {} entries)",
                self.rows.len()
            )
        })
    }

    pub fn find(&self, id: &str) -> Option<&StoredEntry> {
        self.rows.iter().find(|row| row.id == id)
    }

    /// Largest integer key plus one; `"0"` for an empty store.
    pub fn next_id(&self) -> String {
        self.rows
            .iter()
            .filter_map(|row| row.id.parse::<u64>().ok())
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
            .to_string()
    }

    #[tracing::instrument(skip(self, datetime, episode))]
    pub fn add(
        &mut self,
        name: &str,
        datetime: Schedule,
        episode: Option<String>,
    ) -> anyhow::Result<&StoredEntry> {
        let name = name.trim();
        if name.is_empty() {
            bail!("entry name cannot be empty");
        }
        let episode = match (self.kind, episode) {
            (TabKind::Watch, Some(ep)) => Some(ep),
            (TabKind::Watch, None) => Some(DEFAULT_EPISODE.to_string()),
            (TabKind::Plain, Some(_)) => bail!("episodes are only tracked on watch tabs"),
            (TabKind::Plain, None) => None,
        };

        let id = self.next_id();
        let entry = Entry::new(name.to_string(), datetime, episode, self.rows.len());
        debug!(id = %id, position = entry.entry_position, "adding entry");
        self.rows.push(StoredEntry { id, entry });
        self.persist();

        let last = self.rows.len() - 1;
        Ok(&self.rows[last])
    }

    #[tracing::instrument(skip(self))]
    pub fn remove(&mut self, position: usize) -> anyhow::Result<StoredEntry> {
        self.get(position)?;
        let removed = self.rows.remove(position);
        debug!(id = %removed.id, "removed entry");
        self.persist();
        Ok(removed)
    }

    /// Returns the new position.
    #[tracing::instrument(skip(self))]
    pub fn move_up(&mut self, position: usize) -> anyhow::Result<usize> {
        self.get(position)?;
        if position == 0 {
            return Ok(0);
        }
        self.rows.swap(position, position - 1);
        self.persist();
        Ok(position - 1)
    }

    /// Returns the new position.
    #[tracing::instrument(skip(self))]
    pub fn move_down(&mut self, position: usize) -> anyhow::Result<usize> {
        self.get(position)?;
        if position + 1 >= self.rows.len() {
            return Ok(position);
        }
        self.rows.swap(position, position + 1);
        self.persist();
        Ok(position + 1)
    }

    pub fn set_name(&mut self, position: usize, name: &str) -> anyhow::Result<()> {
        let name = name.trim();
        if name.is_empty() {
            bail!("entry name cannot be empty");
        }
        self.edit(position, |entry| entry.name = name.to_string())
    }

    pub fn set_episode(&mut self, position: usize, episode: &str) -> anyhow::Result<()> {
        if self.kind != TabKind::Watch {
            bail!("episodes are only tracked on watch tabs");
        }
        if !crate::entry::episode_is_well_formed(episode) {
            warn!(episode, "episode does not look like 'S01 E-01'");
        }
        self.edit(position, |entry| entry.episode = Some(episode.trim().to_string()))
    }

    /// Stores `raw` as typed; anything that is not `N/A` or a
    /// `DD Mon YYYY HH:MM` timestamp becomes `Invalid Date`.
    pub fn set_datetime_text(&mut self, position: usize, raw: &str) -> anyhow::Result<Schedule> {
        let schedule = Schedule::from_text(raw);
        if schedule == Schedule::Invalid {
            warn!(position, input = raw, "unparseable date and time stored as invalid");
        }
        self.set_datetime(position, schedule)?;
        Ok(schedule)
    }

    pub fn set_datetime(&mut self, position: usize, schedule: Schedule) -> anyhow::Result<()> {
        self.edit(position, |entry| entry.datetime = schedule)
    }

    pub fn set_status(&mut self, position: usize, done: bool) -> anyhow::Result<()> {
        self.edit(position, |entry| entry.status = done)
    }

    /// Turning the alarm off also clears snooze.
    pub fn set_alarm(&mut self, position: usize, on: bool) -> anyhow::Result<()> {
        self.edit(position, |entry| {
            entry.alarm = on;
            if !on {
                entry.snooze = false;
            }
        })
    }

    pub fn set_snooze(&mut self, position: usize, on: bool) -> anyhow::Result<()> {
        if on && !self.get(position)?.entry.alarm {
            bail!("snooze needs the alarm to be on for entry {position}");
        }
        self.edit(position, |entry| entry.snooze = on)
    }

    pub fn advance_week(&mut self, position: usize) -> anyhow::Result<()> {
        if self.kind != TabKind::Watch {
            bail!("only watch tabs can advance by a week");
        }
        let mut entry = self.get(position)?.entry.clone();
        entry
            .advance_week()
            .with_context(|| format!("cannot advance entry {position}"))?;
        self.rows[position].entry = entry;
        self.persist();
        Ok(())
    }

    /// A sorted view; stored positions are left alone.
    pub fn sorted(&self, key: SortKey, order: SortOrder) -> Vec<&StoredEntry> {
        let mut view: Vec<&StoredEntry> = self.rows.iter().collect();
        view.sort_by(|a, b| {
            let ord = compare_by(key, &a.entry, &b.entry);
            match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            }
        });
        view
    }

    /// Re-reads the file when its contents differ from the last load or save.
    pub fn reload_if_changed(&mut self) -> anyhow::Result<bool> {
        let raw = read_backing(&self.path)?;
        if raw.as_deref().map(checksum_sha256) == self.loaded_digest {
            return Ok(false);
        }
        debug!(file = %self.path.display(), "backing file changed; reloading");
        self.load_from(raw)?;
        Ok(true)
    }

    #[tracing::instrument(skip(self), fields(file = %self.path.display()))]
    pub fn reload(&mut self) -> anyhow::Result<()> {
        let raw = read_backing(&self.path)?;
        self.load_from(raw)
    }

    fn load_from(&mut self, raw: Option<Vec<u8>>) -> anyhow::Result<()> {
        let records = match raw.as_deref() {
            Some(bytes) => parse_records(&self.path, bytes)?,
            None => {
                debug!(file = %self.path.display(), "no backing file yet; starting empty");
                BTreeMap::new()
            }
        };

        let mut rows: Vec<StoredEntry> = records
            .into_iter()
            .map(|(id, entry)| StoredEntry { id, entry })
            .collect();
        rows.sort_by(|a, b| {
            a.entry
                .entry_position
                .cmp(&b.entry.entry_position)
                .then_with(|| compare_ids(&a.id, &b.id))
        });

        let mut gaps = 0usize;
        for (idx, row) in rows.iter_mut().enumerate() {
            if row.entry.entry_position != idx {
                gaps += 1;
                row.entry.entry_position = idx;
            }
        }
        if gaps > 0 {
            warn!(renumbered = gaps, "entry positions were not dense; renumbered");
        }

        self.rows = rows;
        self.loaded_digest = raw.as_deref().map(checksum_sha256);
        Ok(())
    }

    /// Writes the whole table, surfacing any I/O error.
    #[tracing::instrument(skip(self), fields(file = %self.path.display()))]
    pub fn save(&mut self) -> anyhow::Result<()> {
        self.renumber();
        let records: BTreeMap<&str, &Entry> = self
            .rows
            .iter()
            .map(|row| (row.id.as_str(), &row.entry))
            .collect();
        let bytes = save_json_atomic(&self.path, &records)
            .with_context(|| format!("failed to save {}", self.path.display()))?;
        self.loaded_digest = Some(checksum_sha256(&bytes));
        Ok(())
    }

    fn edit<F>(&mut self, position: usize, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Entry),
    {
        self.get(position)?;
        apply(&mut self.rows[position].entry);
        self.persist();
        Ok(())
    }

    fn renumber(&mut self) {
        for (idx, row) in self.rows.iter_mut().enumerate() {
            row.entry.entry_position = idx;
        }
    }

    fn persist(&mut self) {
        self.renumber();
        if let Err(err) = self.save() {
            warn!(
                file = %self.path.display(),
                error = %format!("{err:#}"),
                "failed to persist entries; change kept in memory only"
            );
        }
    }
}

fn compare_by(key: SortKey, a: &Entry, b: &Entry) -> Ordering {
    match key {
        SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        SortKey::Datetime => match (a.datetime.at(), b.datetime.at()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
    }
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn read_backing(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed reading {}", path.display())),
    }
}

pub(crate) fn checksum_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut output = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}

#[tracing::instrument(skip(path, raw), fields(file = %path.display()))]
fn parse_records(path: &Path, raw: &[u8]) -> anyhow::Result<BTreeMap<String, Entry>> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }

    let records: BTreeMap<String, Entry> = serde_json::from_slice(raw)
        .with_context(|| format!("failed parsing {}", path.display()))?;
    debug!(count = records.len(), "loaded entries");
    Ok(records)
}

#[tracing::instrument(skip(path, records))]
/// Returns the bytes written.
fn save_json_atomic(path: &Path, records: &BTreeMap<&str, &Entry>) -> anyhow::Result<Vec<u8>> {
    debug!(file = %path.display(), count = records.len(), "saving entries atomically");

    let bytes = serde_json::to_vec(records)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(&bytes)?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(bytes)
}
