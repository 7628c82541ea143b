//! 音轨持久化模块
//!
//! 定义持久化服务交换的纯数据结构、把数据还原为音轨的 [`TrackLoader`]，
//! 以及把每条音轨保存为 `<目录>/<id>.json` 的本地实现。

use crate::error::{Error, Result};
use crate::structure::{Note, Track, MAX_PITCH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Key under which the persistence service stores a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub u64);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteData {
    pub start_time: u64,
    pub duration: u64,
    pub pitch: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackData {
    #[serde(default)]
    pub id: Option<RemoteId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub notes: Vec<NoteData>,
}

impl TrackData {
    pub fn from_track(track: &Track) -> Self {
        Self {
            id: track.remote_id,
            name: track.name.clone(),
            notes: track
                .notes()
                .iter()
                .map(|note| NoteData {
                    start_time: note.start_time,
                    duration: note.duration,
                    pitch: note.pitch,
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackSummary {
    pub id: RemoteId,
    pub name: String,
}

pub struct TrackLoader;

impl TrackLoader {
    /// Rebuilds a live track. Ids are re-assigned in stored order; only
    /// time, duration and pitch carry over. Stored notes that could not sit
    /// on the grid are skipped.
    pub fn to_track(data: &TrackData) -> Track {
        let mut track = Track::new(data.id, data.name.clone());
        for note in &data.notes {
            if note.pitch > MAX_PITCH || note.duration == 0 {
                log::warn!(
                    "Skipping stored note at {} (pitch {}, duration {})",
                    note.start_time,
                    note.pitch,
                    note.duration
                );
                continue;
            }
            track.add_note(Note::new(note.start_time, note.duration, note.pitch));
        }
        track
    }
}

pub trait PersistenceService {
    fn load(&self, id: RemoteId) -> Result<TrackData>;
    /// Stores the payload and returns its key; a payload without an id gets
    /// a fresh one.
    fn save(&mut self, payload: &TrackData) -> Result<RemoteId>;
    fn list(&self) -> Result<Vec<TrackSummary>>;
}

/// Stores every track as a pretty-printed JSON file in one directory.
#[derive(Clone, Debug)]
pub struct JsonTrackStore {
    dir: PathBuf,
}

impl JsonTrackStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: RemoteId) -> PathBuf {
        self.dir.join(format!("{}.json", id.0))
    }

    fn stored_ids(&self) -> Result<Vec<RemoteId>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
            {
                ids.push(RemoteId(id));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl PersistenceService for JsonTrackStore {
    fn load(&self, id: RemoteId) -> Result<TrackData> {
        let content = match fs::read_to_string(self.path_for(id)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::TrackNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        let mut data: TrackData = serde_json::from_str(&content)?;
        data.id = Some(id);
        log::info!("Track loaded: {} ({} notes)", id, data.notes.len());
        Ok(data)
    }

    fn save(&mut self, payload: &TrackData) -> Result<RemoteId> {
        fs::create_dir_all(&self.dir)?;
        let id = match payload.id {
            Some(id) => id,
            None => {
                let last = self.stored_ids()?.last().map_or(0, |id| id.0);
                RemoteId(last + 1)
            }
        };
        let stored = TrackData {
            id: Some(id),
            ..payload.clone()
        };
        let json_content = serde_json::to_string_pretty(&stored)?;
        fs::write(self.path_for(id), json_content)?;
        log::info!("Track saved: {} to {:?}", id, self.dir);
        Ok(id)
    }

    fn list(&self) -> Result<Vec<TrackSummary>> {
        self.stored_ids()?
            .into_iter()
            .map(|id| {
                let data = self.load(id)?;
                Ok(TrackSummary { id, name: data.name })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::NoteId;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(label: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "polyphona-store-{}-{}",
                label,
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&dir);
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn payload_uses_camel_case() {
        let mut track = Track::new(Some(RemoteId(3)), "riff");
        track.add_note(Note::new(2, 1, 7));
        let json = serde_json::to_value(TrackData::from_track(&track)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 3,
                "name": "riff",
                "notes": [{ "startTime": 2, "duration": 1, "pitch": 7 }]
            })
        );
    }

    #[test]
    fn loader_reassigns_ids_and_drops_velocity() {
        let data: TrackData = serde_json::from_str(
            r#"{"id": 9, "name": "old", "notes": [
                {"id": 40, "startTime": 0, "duration": 2, "pitch": 1},
                {"id": 17, "startTime": 2, "duration": 2, "pitch": 3, "velocity": 0.1}
            ]}"#,
        )
        .unwrap();
        let track = TrackLoader::to_track(&data);

        assert_eq!(track.remote_id, Some(RemoteId(9)));
        assert_eq!(track.name, "old");
        let ids: Vec<_> = track.notes().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![Some(NoteId(0)), Some(NoteId(1))]);
        assert_eq!(track.notes()[1].velocity, crate::structure::DEFAULT_VELOCITY);
        assert_eq!(track.last_id(), 2);
    }

    #[test]
    fn loader_skips_notes_off_the_grid() {
        let data: TrackData = serde_json::from_str(
            r#"{"name": "damaged", "notes": [
                {"startTime": 0, "duration": 2, "pitch": 14},
                {"startTime": 2, "duration": 0, "pitch": 3},
                {"startTime": 4, "duration": 2, "pitch": 12}
            ]}"#,
        )
        .unwrap();
        let track = TrackLoader::to_track(&data);

        assert_eq!(track.len(), 1);
        let note = &track.notes()[0];
        assert_eq!((note.start_time, note.pitch, note.id), (4, 12, Some(NoteId(0))));
    }

    #[test]
    fn store_allocates_ids_and_round_trips() {
        let dir = TempDir::new("roundtrip");
        let mut store = JsonTrackStore::new(&dir.0);

        let mut track = Track::new(None, "first");
        track.add_note(Note::new(0, 4, 0));
        let first = store.save(&TrackData::from_track(&track)).unwrap();
        let second = store
            .save(&TrackData::from_track(&Track::new(None, "second")))
            .unwrap();
        assert_eq!((first, second), (RemoteId(1), RemoteId(2)));

        let loaded = store.load(first).unwrap();
        assert_eq!(loaded.id, Some(first));
        assert_eq!(loaded.notes.len(), 1);

        let names: Vec<String> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn saving_with_an_id_overwrites() {
        let dir = TempDir::new("overwrite");
        let mut store = JsonTrackStore::new(&dir.0);
        let id = store
            .save(&TrackData::from_track(&Track::new(None, "draft")))
            .unwrap();
        let renamed = Track::new(Some(id), "final");
        assert_eq!(store.save(&TrackData::from_track(&renamed)).unwrap(), id);
        assert_eq!(store.load(id).unwrap().name, "final");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn missing_track_is_reported() {
        let dir = TempDir::new("missing");
        let store = JsonTrackStore::new(&dir.0);
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(
            store.load(RemoteId(5)),
            Err(Error::TrackNotFound(RemoteId(5)))
        ));
    }
}
