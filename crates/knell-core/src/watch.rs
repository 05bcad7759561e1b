use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::alarm::{AlarmEvaluator, AlarmTimings, Clock, Firing, TickReport};
use crate::entry::TabKind;
use crate::registry::TabRegistry;
use crate::render::Renderer;
use crate::sound::AlarmSink;
use crate::store::EntryStore;

/// A tab opened for watching. `key` is the backing file path and identifies
/// the tab's entries to the evaluator.
#[derive(Debug)]
pub struct WatchedTab {
    pub index: usize,
    pub name: String,
    pub key: String,
    pub store: EntryStore,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub all_tabs: bool,
    pub ticks: Option<u64>,
    pub interval: Duration,
}

pub struct Watcher<C: Clock, S: AlarmSink> {
    registry: TabRegistry,
    keywords: Vec<String>,
    tabs: Vec<WatchedTab>,
    evaluator: AlarmEvaluator,
    clock: C,
    sink: S,
}

impl<C: Clock, S: AlarmSink> Watcher<C, S> {
    /// Opens every tab in the registry. A tab whose file cannot be read is
    /// skipped with a warning so the other tabs keep ringing.
    #[tracing::instrument(skip_all, fields(tabs = registry.tabs().len()))]
    pub fn open(
        registry: &TabRegistry,
        keywords: &[String],
        timings: AlarmTimings,
        clock: C,
        sink: S,
    ) -> anyhow::Result<Self> {
        let mut watcher = Self {
            registry: registry.clone(),
            keywords: keywords.to_vec(),
            tabs: Vec::new(),
            evaluator: AlarmEvaluator::new(timings),
            clock,
            sink,
        };
        watcher.sync_tabs()?;
        info!(watched = watcher.tabs.len(), "opened tabs for watching");
        Ok(watcher)
    }

    /// Lines the watched tabs up with the registry. Tabs that stay keep
    /// their store and alarm state; new tabs are opened.
    fn sync_tabs(&mut self) -> anyhow::Result<()> {
        let mut previous: HashMap<String, WatchedTab> = self
            .tabs
            .drain(..)
            .map(|tab| (tab.key.clone(), tab))
            .collect();

        for (index, info) in self.registry.tabs().iter().enumerate() {
            let path = self.registry.backing_path(index)?;
            let key = path.display().to_string();
            if let Some(mut tab) = previous.remove(&key) {
                tab.index = index;
                tab.name = info.name.clone();
                self.tabs.push(tab);
                continue;
            }

            let kind = TabKind::detect(&path, &self.keywords);
            match EntryStore::open(&path, kind) {
                Ok(store) => {
                    debug!(tab = %info.name, "watching tab");
                    self.tabs.push(WatchedTab {
                        index,
                        name: info.name.clone(),
                        key,
                        store,
                    });
                }
                Err(err) => {
                    warn!(tab = %info.name, error = %format!("{err:#}"), "skipping unreadable tab");
                }
            }
        }

        for (key, tab) in previous {
            debug!(tab = %tab.name, "tab no longer registered");
            self.evaluator.forget_tab(&key);
        }
        Ok(())
    }

    pub fn tabs(&self) -> &[WatchedTab] {
        &self.tabs
    }

    pub fn evaluator(&self) -> &AlarmEvaluator {
        &self.evaluator
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Rings the first already-overdue alarm of each tab.
    #[tracing::instrument(skip(self))]
    pub fn startup(&mut self) -> Vec<Firing> {
        let now = self.clock.now();
        let mut fired = Vec::new();
        for tab in &self.tabs {
            if let Some(firing) = self
                .evaluator
                .startup_scan(&tab.key, tab.store.entries(), now)
            {
                fired.push(firing);
            }
        }
        for firing in &fired {
            ring(&mut self.sink, firing);
        }
        fired
    }

    /// One pass over every tab; reports line up with `tabs()`.
    pub fn tick(&mut self) -> Vec<TickReport> {
        match self.registry.reload_if_changed() {
            Ok(true) => {
                if let Err(err) = self.sync_tabs() {
                    warn!(error = %format!("{err:#}"), "failed to follow tab changes");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(error = %format!("{err:#}"), "tab registry reload failed; keeping current tabs");
            }
        }

        let now = self.clock.now();
        let mut reports = Vec::with_capacity(self.tabs.len());
        for tab in &mut self.tabs {
            match tab.store.reload_if_changed() {
                Ok(true) => debug!(tab = %tab.name, "picked up external changes"),
                Ok(false) => {}
                Err(err) => {
                    warn!(tab = %tab.name, error = %format!("{err:#}"), "reload failed; using last good rows");
                }
            }
            let report = self.evaluator.tick(&tab.key, tab.store.entries(), now);
            for firing in &report.fired {
                ring(&mut self.sink, firing);
            }
            reports.push(report);
        }
        self.sink.poll();
        reports
    }
}

fn ring<S: AlarmSink>(sink: &mut S, firing: &Firing) {
    if let Err(err) = sink.ring(firing) {
        warn!(name = %firing.name, error = %format!("{err:#}"), "failed to ring alarm");
    }
}

/// Drives the watcher until `options.ticks` passes have run, or forever.
#[tracing::instrument(skip(watcher, renderer))]
pub fn run<C: Clock, S: AlarmSink>(
    watcher: &mut Watcher<C, S>,
    renderer: &mut Renderer,
    current: usize,
    options: &WatchOptions,
) -> anyhow::Result<()> {
    watcher.startup();

    let mut ticks_done = 0_u64;
    loop {
        let reports = watcher.tick();
        let mut first = true;
        for (tab, report) in watcher.tabs().iter().zip(&reports) {
            if !options.all_tabs && tab.index != current {
                continue;
            }
            let title = format!("[{}] {}", tab.index, tab.name);
            renderer.print_board(
                &title,
                tab.store.kind(),
                tab.store.entries(),
                &report.rows,
                first,
            )?;
            first = false;
        }

        ticks_done += 1;
        if options.ticks.is_some_and(|max| ticks_done >= max) {
            debug!(ticks = ticks_done, "tick limit reached");
            return Ok(());
        }
        thread::sleep(options.interval);
    }
}
