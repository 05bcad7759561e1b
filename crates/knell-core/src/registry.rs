use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::store::checksum_sha256;

pub const REGISTRY_FILE: &str = "tabs_config.json";
pub const DEFAULT_TAB_NAME: &str = "Anime";
pub const DEFAULT_TAB_FILE: &str = "ScheduleApp_tab1.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabInfo {
    pub name: String,
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    tabs_info: Vec<TabInfo>,
    #[serde(default)]
    current_tab_index: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryOnDisk {
    Current(RegistryFile),
    Legacy(Vec<TabInfo>),
}

/// Ordered tabs plus the last active one, persisted as `tabs_config.json`.
#[derive(Debug, Clone)]
pub struct TabRegistry {
    path: PathBuf,
    data_dir: PathBuf,
    tabs: Vec<TabInfo>,
    current: usize,
    digest: Option<String>,
}

impl TabRegistry {
    /// Loads the registry; a missing file creates the default `Anime` tab.
    #[tracing::instrument(skip(data_dir), fields(data_dir = %data_dir.display()))]
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(REGISTRY_FILE);
        let mut registry = Self {
            path,
            data_dir: data_dir.to_path_buf(),
            tabs: Vec::new(),
            current: 0,
            digest: None,
        };

        let Some(raw) = read_registry(&registry.path)? else {
            info!(file = %registry.path.display(), "no tab registry; creating default tab");
            registry.tabs.push(TabInfo {
                name: DEFAULT_TAB_NAME.to_string(),
                filename: DEFAULT_TAB_FILE.to_string(),
            });
            registry.save()?;
            return Ok(registry);
        };

        registry.apply(&raw)?;
        debug!(tabs = registry.tabs.len(), current = registry.current, "loaded tab registry");
        Ok(registry)
    }

    /// Re-reads `tabs_config.json` when its contents changed since the last
    /// load or save. A deleted file leaves the tabs as they are.
    pub fn reload_if_changed(&mut self) -> anyhow::Result<bool> {
        let Some(raw) = read_registry(&self.path)? else {
            return Ok(false);
        };
        if Some(checksum_sha256(raw.as_bytes())) == self.digest {
            return Ok(false);
        }
        self.apply(&raw)?;
        info!(tabs = self.tabs.len(), current = self.current, "tab registry changed on disk");
        Ok(true)
    }

    fn apply(&mut self, raw: &str) -> anyhow::Result<()> {
        let parsed: RegistryOnDisk = serde_json::from_str(raw)
            .with_context(|| format!("failed parsing {}", self.path.display()))?;
        let (tabs, current) = match parsed {
            RegistryOnDisk::Current(file) => (
                file.tabs_info,
                usize::try_from(file.current_tab_index).unwrap_or(0),
            ),
            RegistryOnDisk::Legacy(tabs) => {
                debug!("read legacy list-shaped tab registry");
                (tabs, 0)
            }
        };

        self.tabs = tabs;
        self.current = current;
        self.digest = Some(checksum_sha256(raw.as_bytes()));
        if self.clamp_current() {
            warn!(index = current, "stored tab index out of range; clamped");
        }
        Ok(())
    }

    pub fn tabs(&self) -> &[TabInfo] {
        &self.tabs
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> anyhow::Result<&TabInfo> {
        self.tab(self.current)
    }

    pub fn tab(&self, index: usize) -> anyhow::Result<&TabInfo> {
        if self.tabs.is_empty() {
            bail!("there are no tabs; create one with `knell tab add NAME`");
        }
        self.tabs
            .get(index)
            .ok_or_else(|| anyhow!("no tab at index {index} ({} tabs)", self.tabs.len()))
    }

    /// Accepts an index or a tab name (case-insensitive).
    pub fn resolve(&self, selector: &str) -> anyhow::Result<usize> {
        let selector = selector.trim();
        if let Ok(index) = selector.parse::<usize>() {
            self.tab(index)?;
            return Ok(index);
        }
        self.tabs
            .iter()
            .position(|tab| tab.name.eq_ignore_ascii_case(selector))
            .ok_or_else(|| anyhow!("no tab named {selector:?}"))
    }

    /// Relative file names live in the data directory.
    pub fn backing_path(&self, index: usize) -> anyhow::Result<PathBuf> {
        let tab = self.tab(index)?;
        let file = Path::new(&tab.filename);
        Ok(if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir.join(file)
        })
    }

    #[tracing::instrument(skip(self, now))]
    pub fn add(&mut self, name: &str, now: NaiveDateTime) -> anyhow::Result<usize> {
        let name = name.trim();
        let Some(first_word) = name.split_whitespace().next() else {
            bail!("tab name cannot be empty");
        };

        let stem = format!("{first_word}_{}", now.format("%Y-%m-%d_%H%M%S"));
        let mut filename = format!("{stem}.json");
        let mut suffix = 2;
        while self.tabs.iter().any(|tab| tab.filename == filename)
            || self.data_dir.join(&filename).exists()
        {
            filename = format!("{stem}-{suffix}.json");
            suffix += 1;
        }

        self.tabs.push(TabInfo {
            name: name.to_string(),
            filename,
        });
        if self.tabs.len() == 1 {
            self.current = 0;
        }
        self.save()?;
        Ok(self.tabs.len() - 1)
    }

    /// Drops the tab and deletes its backing file.
    #[tracing::instrument(skip(self))]
    pub fn remove(&mut self, index: usize) -> anyhow::Result<TabInfo> {
        let backing = self.backing_path(index)?;
        let removed = self.tabs.remove(index);
        if index < self.current {
            self.current -= 1;
        }
        self.clamp_current();

        if backing.exists() {
            fs::remove_file(&backing)
                .with_context(|| format!("failed to delete {}", backing.display()))?;
            info!(file = %backing.display(), "deleted tab data");
        }
        self.save()?;
        Ok(removed)
    }

    pub fn rename(&mut self, index: usize, name: &str) -> anyhow::Result<()> {
        let name = name.trim();
        if name.is_empty() {
            bail!("tab name cannot be empty");
        }
        self.tab(index)?;
        self.tabs[index].name = name.to_string();
        self.save()
    }

    pub fn switch(&mut self, index: usize) -> anyhow::Result<()> {
        self.tab(index)?;
        self.current = index;
        self.save()
    }

    #[tracing::instrument(skip(self), fields(file = %self.path.display()))]
    pub fn save(&mut self) -> anyhow::Result<()> {
        let file = RegistryFile {
            tabs_info: self.tabs.clone(),
            current_tab_index: i64::try_from(self.current).unwrap_or(0),
        };
        let bytes = serde_json::to_vec(&file)?;
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        let mut temp = NamedTempFile::new_in(&self.data_dir)?;
        temp.write_all(&bytes)?;
        temp.flush()?;
        temp.persist(&self.path)
            .map_err(|err| anyhow!("failed to persist {}: {}", self.path.display(), err))?;
        self.digest = Some(checksum_sha256(&bytes));
        debug!(tabs = self.tabs.len(), current = self.current, "saved tab registry");
        Ok(())
    }

    fn clamp_current(&mut self) -> bool {
        let max = self.tabs.len().saturating_sub(1);
        if self.current > max {
            self.current = max;
            return true;
        }
        false
    }
}

fn read_registry(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use serde_json::Value;
    use tempfile::tempdir;

    use super::*;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 1)
            .expect("date")
            .and_hms_opt(12, 0, 5)
            .expect("time")
    }

    fn on_disk(dir: &Path) -> Value {
        let raw = fs::read_to_string(dir.join(REGISTRY_FILE)).expect("read registry");
        serde_json::from_str(&raw).expect("parse registry")
    }

    #[test]
    fn missing_registry_creates_default_tab() {
        let temp = tempdir().expect("tempdir");
        let registry = TabRegistry::load(temp.path()).expect("load");
        assert_eq!(registry.tabs().len(), 1);
        assert_eq!(registry.current().expect("current").name, "Anime");

        let value = on_disk(temp.path());
        assert_eq!(value["tabs_info"][0]["filename"], DEFAULT_TAB_FILE);
        assert_eq!(value["current_tab_index"], 0);
    }

    #[test]
    fn add_names_file_after_first_word_and_time() {
        let temp = tempdir().expect("tempdir");
        let mut registry = TabRegistry::load(temp.path()).expect("load");

        let idx = registry.add("Movies to see", noon()).expect("add");
        assert_eq!(idx, 1);
        assert_eq!(registry.tabs()[1].filename, "Movies_2026-03-01_120005.json");

        let again = registry.add("Movies again", noon()).expect("add twice");
        assert_eq!(registry.tabs()[again].filename, "Movies_2026-03-01_120005-2.json");
        assert_eq!(registry.current_index(), 0);
        assert!(registry.add("   ", noon()).is_err());
    }

    #[test]
    fn switch_rename_and_resolve_persist() {
        let temp = tempdir().expect("tempdir");
        let mut registry = TabRegistry::load(temp.path()).expect("load");
        registry.add("Chores", noon()).expect("add");

        registry.switch(1).expect("switch");
        registry.rename(1, "House chores").expect("rename");
        assert_eq!(registry.resolve("house CHORES").expect("by name"), 1);
        assert_eq!(registry.resolve("0").expect("by index"), 0);
        assert!(registry.resolve("7").is_err());
        assert!(registry.resolve("garden").is_err());

        let reloaded = TabRegistry::load(temp.path()).expect("reload");
        assert_eq!(reloaded.current_index(), 1);
        assert_eq!(reloaded.current().expect("current").name, "House chores");
    }

    #[test]
    fn remove_deletes_backing_file_and_keeps_index_valid() {
        let temp = tempdir().expect("tempdir");
        let mut registry = TabRegistry::load(temp.path()).expect("load");
        registry.add("Chores", noon()).expect("add");
        registry.switch(1).expect("switch");

        let backing = registry.backing_path(1).expect("path");
        fs::write(&backing, "{}").expect("seed");

        let removed = registry.remove(1).expect("remove");
        assert_eq!(removed.name, "Chores");
        assert!(!backing.exists());
        assert_eq!(registry.current_index(), 0);

        registry.remove(0).expect("remove last");
        assert!(registry.current().is_err());
        assert_eq!(on_disk(temp.path())["tabs_info"].as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn legacy_list_shape_is_accepted() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join(REGISTRY_FILE),
            r#"[{"name": "TV", "filename": "TV_2024.json"}, {"name": "Work", "filename": "/abs/work.json"}]"#,
        )
        .expect("seed");

        let registry = TabRegistry::load(temp.path()).expect("load");
        assert_eq!(registry.tabs().len(), 2);
        assert_eq!(registry.current_index(), 0);
        assert_eq!(
            registry.backing_path(0).expect("relative"),
            temp.path().join("TV_2024.json")
        );
        assert_eq!(
            registry.backing_path(1).expect("absolute"),
            PathBuf::from("/abs/work.json")
        );
    }

    #[test]
    fn reload_picks_up_tabs_added_elsewhere() {
        let temp = tempdir().expect("tempdir");
        let mut watching = TabRegistry::load(temp.path()).expect("load");
        assert!(!watching.reload_if_changed().expect("unchanged"));

        let mut other = TabRegistry::load(temp.path()).expect("load again");
        other.add("Chores", noon()).expect("add");

        assert!(watching.reload_if_changed().expect("changed"));
        assert_eq!(watching.tabs().len(), 2);
        assert_eq!(watching.tabs()[1].name, "Chores");
        assert!(!watching.reload_if_changed().expect("settled"));
    }

    #[test]
    fn out_of_range_current_index_is_clamped() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join(REGISTRY_FILE),
            r#"{"tabs_info": [{"name": "A", "filename": "a.json"}], "current_tab_index": 4}"#,
        )
        .expect("seed");
        let registry = TabRegistry::load(temp.path()).expect("load");
        assert_eq!(registry.current_index(), 0);
    }
}
