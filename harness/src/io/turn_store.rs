//! Append-only turn persistence.
//!
//! Layout under the storage directory:
//!
//! ```text
//! <episode-id>/turns/000001.json
//! <episode-id>/turns/000002.json
//! <episode-id>/episode.json        (written when the episode stops)
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::types::{EpisodeSummary, Turn};
use crate::io::config::write_atomic;

static EPISODE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("valid episode id regex")
});

/// Where recorded turns go. Records are immutable once appended.
pub trait TurnRepository {
    fn append_turn(&mut self, turn: &Turn) -> Result<()>;

    fn latest_turn(&self, episode_id: &str) -> Result<Option<Turn>>;

    /// Record the final summary of a stopped episode.
    fn close_episode(&mut self, summary: &EpisodeSummary) -> Result<()> {
        let _ = summary;
        Ok(())
    }
}

/// JSON-file repository, one file per turn.
#[derive(Debug, Clone)]
pub struct FileTurnStore {
    dir: PathBuf,
    /// Newest sequence per episode; the directory is scanned once per episode.
    latest: BTreeMap<String, u64>,
}

impl FileTurnStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            latest: BTreeMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn episode_dir(&self, episode_id: &str) -> Result<PathBuf> {
        if !EPISODE_ID.is_match(episode_id) || episode_id.contains("..") {
            return Err(anyhow!("invalid episode id {episode_id:?}"));
        }
        Ok(self.dir.join(episode_id))
    }

    fn turns_dir(&self, episode_id: &str) -> Result<PathBuf> {
        Ok(self.episode_dir(episode_id)?.join("turns"))
    }

    /// Recorded sequence numbers, ascending.
    fn sequences(&self, episode_id: &str) -> Result<Vec<u64>> {
        let dir = self.turns_dir(episode_id)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut sequences = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let name = entry.file_name();
            let Some(sequence) = name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            sequences.push(sequence);
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    fn turn_path(&self, episode_id: &str, sequence: u64) -> Result<PathBuf> {
        Ok(self.turns_dir(episode_id)?.join(format!("{sequence:06}.json")))
    }

    /// Every recorded turn of an episode in sequence order.
    pub fn list_turns(&self, episode_id: &str) -> Result<Vec<Turn>> {
        self.sequences(episode_id)?
            .into_iter()
            .map(|sequence| read_json(&self.turn_path(episode_id, sequence)?))
            .collect()
    }

    pub fn load_summary(&self, episode_id: &str) -> Result<Option<EpisodeSummary>> {
        let path = self.episode_dir(episode_id)?.join("episode.json");
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }
}

impl TurnRepository for FileTurnStore {
    fn append_turn(&mut self, turn: &Turn) -> Result<()> {
        let latest = match self.latest.get(&turn.episode_id) {
            Some(&sequence) => Some(sequence),
            None => self.sequences(&turn.episode_id)?.last().copied(),
        };
        if latest.is_some_and(|latest| turn.sequence <= latest) {
            return Err(anyhow!(
                "turn {} of episode {} is not after recorded turn {}",
                turn.sequence,
                turn.episode_id,
                latest.unwrap_or_default()
            ));
        }
        let path = self.turn_path(&turn.episode_id, turn.sequence)?;
        write_json(&path, turn)?;
        self.latest.insert(turn.episode_id.clone(), turn.sequence);
        debug!(path = %path.display(), "turn recorded");
        Ok(())
    }

    fn latest_turn(&self, episode_id: &str) -> Result<Option<Turn>> {
        match self.sequences(episode_id)?.last() {
            Some(&sequence) => read_json(&self.turn_path(episode_id, sequence)?).map(Some),
            None => Ok(None),
        }
    }

    fn close_episode(&mut self, summary: &EpisodeSummary) -> Result<()> {
        let path = self.episode_dir(&summary.episode_id)?.join("episode.json");
        if path.exists() {
            return Err(anyhow!("episode {} is already closed", summary.episode_id));
        }
        write_json(&path, summary)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EnvironmentSnapshot;
    use crate::core::types::{OutcomeStatus, StopReason, TurnOutcome};

    fn turn(sequence: u64) -> Turn {
        Turn {
            episode_id: "ep-1".to_string(),
            sequence,
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            snapshot: EnvironmentSnapshot::default(),
            request: Vec::new(),
            response: None,
            outcome: TurnOutcome::failure(OutcomeStatus::PlannerFailure, "none", "offline"),
            stop: None,
        }
    }

    /// Verifies turns are appended in order and read back.
    #[test]
    fn appends_and_reads_turns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = FileTurnStore::new(temp.path());
        assert_eq!(store.latest_turn("ep-1").expect("latest"), None);

        store.append_turn(&turn(1)).expect("append 1");
        store.append_turn(&turn(2)).expect("append 2");

        assert!(temp.path().join("ep-1/turns/000002.json").exists());
        assert_eq!(
            store.latest_turn("ep-1").expect("latest"),
            Some(turn(2))
        );
        let sequences: Vec<u64> = store
            .list_turns("ep-1")
            .expect("list")
            .iter()
            .map(|t| t.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    /// Verifies recorded turns cannot be rewritten or reordered.
    #[test]
    fn rejects_rewrites() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = FileTurnStore::new(temp.path());
        store.append_turn(&turn(2)).expect("append");
        assert!(store.append_turn(&turn(2)).is_err());
        assert!(store.append_turn(&turn(1)).is_err());
    }

    /// Verifies the order check scans the directory once, then uses the last append.
    #[test]
    fn appends_track_latest_without_rescanning() {
        let temp = tempfile::tempdir().expect("tempdir");
        FileTurnStore::new(temp.path())
            .append_turn(&turn(1))
            .expect("seed");

        let mut store = FileTurnStore::new(temp.path());
        assert!(store.append_turn(&turn(1)).is_err());
        store.append_turn(&turn(2)).expect("append 2");

        fs::remove_dir_all(temp.path().join("ep-1/turns")).expect("remove turns");
        assert!(store.append_turn(&turn(2)).is_err());
        store.append_turn(&turn(3)).expect("append 3");
        assert_eq!(store.list_turns("ep-1").expect("list"), vec![turn(3)]);
    }

    /// Verifies unsafe episode ids never reach the filesystem.
    #[test]
    fn rejects_unsafe_episode_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileTurnStore::new(temp.path());
        assert!(store.episode_dir("../escape").is_err());
        assert!(store.episode_dir("a/b").is_err());
        assert!(store.episode_dir("").is_err());
        assert!(store.episode_dir("run-2026.01_a").is_ok());
    }

    /// Verifies closing writes the summary exactly once.
    #[test]
    fn close_writes_summary_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = FileTurnStore::new(temp.path());
        let summary = EpisodeSummary {
            episode_id: "ep-1".to_string(),
            started_at: "2026-01-01T00:00:00.000Z".to_string(),
            ended_at: "2026-01-01T00:01:00.000Z".to_string(),
            total_turns: 3,
            stop: StopReason::TurnLimit { max_turns: 3 },
            aborted: false,
        };
        store.close_episode(&summary).expect("close");
        assert_eq!(store.load_summary("ep-1").expect("load"), Some(summary.clone()));
        assert!(store.close_episode(&summary).is_err());
    }
}
