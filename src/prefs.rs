use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::PathBuf;

use crate::types::{DEFAULT_MAX_CONTINUES, MAX_CONTINUES_RANGE};

pub const PREFS_FILE: &str = "prefs.json";

/// The persisted preference keys: the arming flag, the running continue
/// counter, and the attempt cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Prefs {
    pub enabled: bool,
    pub continues: u32,
    pub max_continues: u32,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            enabled: false,
            continues: 0,
            max_continues: DEFAULT_MAX_CONTINUES,
        }
    }
}

/// Preference store bound to its file. Mutations are explicit; callers
/// decide when to flush with `save` (toggle changes and attempts, per the
/// write points the panel and controller own).
pub struct Store {
    prefs: Prefs,
    path: PathBuf,
}

impl Store {
    /// Open the store in the platform data directory.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::data_dir()
            .context("no data directory on this platform")?
            .join("auto-continuer");
        std::fs::create_dir_all(&dir)?;
        Ok(Self::open(dir.join(PREFS_FILE)))
    }

    /// Open a store at an explicit path. A missing or unreadable file
    /// yields defaults. Monitoring always starts disarmed, whatever the
    /// previous session stored, and the cap is clamped into range.
    pub fn open(path: PathBuf) -> Self {
        let mut prefs: Prefs = std::fs::File::open(&path)
            .ok()
            .and_then(|file| serde_json::from_reader(BufReader::new(file)).ok())
            .unwrap_or_default();
        prefs.enabled = false;
        prefs.max_continues = clamp_max(prefs.max_continues);
        Self { prefs, path }
    }

    pub fn save(&self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        serde_json::to_writer_pretty(file, &self.prefs)?;
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.prefs.enabled
    }

    pub fn continues(&self) -> u32 {
        self.prefs.continues
    }

    pub fn max_continues(&self) -> u32 {
        self.prefs.max_continues
    }

    /// Set the arming flag. A false-to-true transition starts a new session
    /// and zeroes the counter. Returns whether that reset happened.
    pub fn set_enabled(&mut self, on: bool) -> bool {
        let fresh_session = on && !self.prefs.enabled;
        if fresh_session {
            self.prefs.continues = 0;
        }
        self.prefs.enabled = on;
        fresh_session
    }

    /// Set the attempt cap, clamped into range. Returns the stored value.
    pub fn set_max(&mut self, value: u32) -> u32 {
        self.prefs.max_continues = clamp_max(value);
        self.prefs.max_continues
    }

    pub fn record_attempt(&mut self, made: u32) {
        self.prefs.continues = made;
    }
}

pub fn clamp_max(value: u32) -> u32 {
    value.clamp(*MAX_CONTINUES_RANGE.start(), *MAX_CONTINUES_RANGE.end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "auto-continuer-test-{}-{}.json",
            tag,
            std::process::id()
        ))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let store = Store::open(scratch_path("missing"));
        assert!(!store.enabled());
        assert_eq!(store.continues(), 0);
        assert_eq!(store.max_continues(), DEFAULT_MAX_CONTINUES);
    }

    #[test]
    fn test_enabled_is_forced_off_on_open() {
        let path = scratch_path("forced-off");
        std::fs::write(
            &path,
            r#"{"enabled":true,"continues":4,"max_continues":9}"#,
        )
        .unwrap();
        let store = Store::open(path.clone());
        assert!(!store.enabled());
        assert_eq!(store.continues(), 4);
        assert_eq!(store.max_continues(), 9);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_cap_clamped_on_open_and_set() {
        let path = scratch_path("clamp");
        std::fs::write(&path, r#"{"max_continues":500}"#).unwrap();
        let mut store = Store::open(path.clone());
        assert_eq!(store.max_continues(), 100);
        assert_eq!(store.set_max(0), 1);
        assert_eq!(store.set_max(42), 42);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_rising_edge_resets_counter() {
        let mut store = Store::open(scratch_path("edge"));
        store.record_attempt(5);
        assert!(store.set_enabled(true));
        assert_eq!(store.continues(), 0);
        // Already on: no reset.
        store.record_attempt(2);
        assert!(!store.set_enabled(true));
        assert_eq!(store.continues(), 2);
        assert!(!store.set_enabled(false));
    }

    #[test]
    fn test_round_trip() {
        let path = scratch_path("round-trip");
        let mut store = Store::open(path.clone());
        store.set_enabled(true);
        store.set_max(12);
        store.record_attempt(3);
        store.save().unwrap();

        let reopened = Store::open(path.clone());
        assert!(!reopened.enabled()); // forced off regardless of stored value
        assert_eq!(reopened.max_continues(), 12);
        assert_eq!(reopened.continues(), 3);
        let _ = std::fs::remove_file(path);
    }
}
