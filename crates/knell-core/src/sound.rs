use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::alarm::Firing;

const FALLBACK_PLAYERS: &[&str] = &[
    "mpg123 -q",
    "ffplay -nodisp -autoexit -loglevel quiet",
    "paplay",
    "aplay -q",
    "afplay",
];

/// Where fired alarms go.
pub trait AlarmSink {
    fn ring(&mut self, firing: &Firing) -> anyhow::Result<()>;

    /// Called once per tick so playback can be cut off on time.
    fn poll(&mut self) {}
}

struct Playback {
    child: Child,
    program: String,
    stop_at: Instant,
}

/// Plays the alarm clip through an external player for a fixed duration.
pub struct SoundPlayer {
    sound: PathBuf,
    players: Vec<String>,
    duration: Duration,
    playing: Option<Playback>,
}

impl SoundPlayer {
    /// `player` is a command line; the sound file is appended as the last argument.
    pub fn new(sound: &Path, player: Option<&str>, duration: Duration) -> Self {
        let players = match player {
            Some(cmd) if !cmd.trim().is_empty() => vec![cmd.trim().to_string()],
            _ => FALLBACK_PLAYERS.iter().map(ToString::to_string).collect(),
        };
        debug!(
            sound = %sound.display(),
            ?players,
            duration_ms = duration.as_millis() as u64,
            "initialized sound player"
        );
        Self {
            sound: sound.to_path_buf(),
            players,
            duration,
            playing: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    #[instrument(skip(self))]
    pub fn stop(&mut self) {
        let Some(mut playback) = self.playing.take() else {
            return;
        };
        if let Ok(Some(status)) = playback.child.try_wait() {
            debug!(program = %playback.program, %status, "player already exited");
            return;
        }
        if let Err(err) = playback.child.kill() {
            warn!(program = %playback.program, error = %err, "failed to stop player");
        }
        let _ = playback.child.wait();
        debug!(program = %playback.program, "stopped player");
    }

    fn spawn(&self) -> Option<Playback> {
        for cmdline in &self.players {
            let mut parts = cmdline.split_whitespace();
            let Some(program) = parts.next() else {
                continue;
            };
            let spawned = Command::new(program)
                .args(parts)
                .arg(&self.sound)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            match spawned {
                Ok(child) => {
                    info!(program, sound = %self.sound.display(), "playing alarm");
                    return Some(Playback {
                        child,
                        program: program.to_string(),
                        stop_at: Instant::now() + self.duration,
                    });
                }
                Err(err) => {
                    debug!(program, error = %err, "player unavailable");
                }
            }
        }
        None
    }
}

impl AlarmSink for SoundPlayer {
    fn ring(&mut self, firing: &Firing) -> anyhow::Result<()> {
        self.stop();
        if self.sound.is_file() {
            self.playing = self.spawn();
        } else {
            warn!(sound = %self.sound.display(), "alarm sound missing");
        }
        if self.playing.is_none() {
            debug!(name = %firing.name, "falling back to terminal bell");
            let mut err = io::stderr().lock();
            write!(err, "\x07")?;
            err.flush()?;
        }
        Ok(())
    }

    fn poll(&mut self) {
        let Some(playback) = self.playing.as_mut() else {
            return;
        };
        let finished = matches!(playback.child.try_wait(), Ok(Some(_)));
        let overdue = Instant::now() >= playback.stop_at;
        if finished {
            self.playing = None;
        } else if overdue {
            self.stop();
        }
    }
}

impl Drop for SoundPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps every firing; used where no audio is wanted.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub rings: Vec<Firing>,
}

impl AlarmSink for RecordingSink {
    fn ring(&mut self, firing: &Firing) -> anyhow::Result<()> {
        self.rings.push(firing.clone());
        Ok(())
    }
}
