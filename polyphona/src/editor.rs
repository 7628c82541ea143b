//! 编辑会话模块
//!
//! 把界面层的命令串联到数据流上：画布方框 → 音符 → 音轨 → 播放调度 / MIDI 导入导出。
//! 每次编辑后立即重启播放，使改动马上可以听到。

use crate::audio::AudioEngine;
use crate::canvas::{NoteBox, NoteCanvasAdapter};
use crate::error::{Error, Result};
use crate::interchange::{ExportOutcome, NoteInterchangeCodec};
use crate::music::{MusicContext, RenderContext};
use crate::playback::PlaybackScheduler;
use crate::project::{PersistenceService, RemoteId, TrackData, TrackLoader};
use crate::structure::{Note, NoteId, Track, MAX_PITCH};
use std::path::Path;

/// 初始化时的音乐参数
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub division: u32,
    pub octave: i32,
    pub bars: u32,
    pub bpm: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            division: 4,
            octave: 2,
            bars: 1,
            bpm: 120.0,
        }
    }
}

impl SessionOptions {
    pub fn with_bars(bars: u32) -> Self {
        Self {
            bars,
            ..Self::default()
        }
    }

    fn music_context(&self) -> MusicContext {
        MusicContext {
            division: self.division.max(1),
            octave: self.octave,
            bars: self.bars.max(1),
            bpm: self.bpm.max(1.0),
            ..MusicContext::default()
        }
    }
}

/// 宿主可推送到会话的命令
#[derive(Clone, Debug)]
pub enum EditorCommand {
    AddNote(NoteBox),
    DeleteNote(NoteId),
    SetOctave(i32),
    TogglePlay,
    Stop,
    NewTrack { name: String },
    RenameTrack { name: String },
}

/// 外部宿主可监听的编辑事件
#[derive(Clone, Debug)]
pub enum EditorEvent {
    NoteAdded(Note),
    NoteDeleted(Note),
    OctaveChanged(i32),
    PlaybackStateChanged { is_playing: bool },
    TrackReplaced { name: String, note_count: usize },
    TrackRenamed { name: String },
    TrackSaved(RemoteId),
    TrackExported(ExportOutcome),
}

pub struct Session<E: AudioEngine> {
    music: MusicContext,
    track: Track,
    scheduler: PlaybackScheduler<E>,
    codec: NoteInterchangeCodec,
    pending_events: Vec<EditorEvent>,
    event_listener: Option<Box<dyn FnMut(&EditorEvent)>>,
}

impl<E: AudioEngine> Session<E> {
    pub fn new(engine: E, options: SessionOptions) -> Self {
        Self {
            music: options.music_context(),
            track: Track::default(),
            scheduler: PlaybackScheduler::new(engine),
            codec: NoteInterchangeCodec::default(),
            pending_events: Vec::new(),
            event_listener: None,
        }
    }

    pub fn set_event_listener(&mut self, listener: Box<dyn FnMut(&EditorEvent)>) {
        self.event_listener = Some(listener);
    }

    pub fn take_events(&mut self) -> Vec<EditorEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn execute_command(&mut self, command: EditorCommand) -> Result<()> {
        match command {
            EditorCommand::AddNote(bbox) => self.add_note_from_box(&bbox).map(|_| ()),
            EditorCommand::DeleteNote(id) => {
                self.delete_note(id)?;
                Ok(())
            }
            EditorCommand::SetOctave(octave) => self.set_octave(octave),
            EditorCommand::TogglePlay => self.toggle_play(),
            EditorCommand::Stop => {
                self.stop();
                Ok(())
            }
            EditorCommand::NewTrack { name } => {
                self.replace_track(Track::new(None, name));
                Ok(())
            }
            EditorCommand::RenameTrack { name } => {
                self.track.set_name(name.clone());
                self.emit_event(EditorEvent::TrackRenamed { name });
                Ok(())
            }
        }
    }

    /// Snaps the box to the grid and adds the resulting note unless it
    /// overlaps an existing one.
    pub fn add_note_from_box(&mut self, bbox: &NoteBox) -> Result<NoteId> {
        let adapter = self.adapter();
        let note = adapter.to_note(&adapter.clip(bbox))?;
        self.add_note(note)
    }

    pub fn add_note(&mut self, note: Note) -> Result<NoteId> {
        if note.duration == 0 {
            return Err(Error::NoteTooSmall);
        }
        if note.pitch > MAX_PITCH {
            return Err(Error::PitchOutOfRange(note.pitch as i64));
        }
        if let Some(existing) = self.track.find_disturbing(&note) {
            let existing = existing.id.unwrap_or(NoteId(u64::MAX));
            log::debug!("Rejected note overlapping {}", existing);
            return Err(Error::NoteOverlap(existing));
        }
        let id = self.track.add_note(note);
        if let Some(added) = self.track.note(id).copied() {
            self.emit_event(EditorEvent::NoteAdded(added));
        }
        self.restart();
        Ok(id)
    }

    /// Returns `None` when the note is already gone.
    pub fn delete_note(&mut self, id: NoteId) -> Result<Option<Note>> {
        let Some(note) = self.track.delete_note_by_id(id) else {
            log::debug!("Note {} not found, nothing to delete", id);
            return Ok(None);
        };
        self.scheduler.cancel(id);
        self.emit_event(EditorEvent::NoteDeleted(note));
        self.restart();
        Ok(Some(note))
    }

    pub fn set_octave(&mut self, octave: i32) -> Result<()> {
        self.music.octave = octave;
        self.emit_event(EditorEvent::OctaveChanged(octave));
        self.restart();
        Ok(())
    }

    pub fn toggle_play(&mut self) -> Result<()> {
        let result = self.scheduler.toggle(&self.track, &mut self.music);
        let is_playing = self.music.playing;
        self.emit_event(EditorEvent::PlaybackStateChanged { is_playing });
        result
    }

    pub fn stop(&mut self) {
        let was_playing = self.music.playing;
        self.scheduler.stop(&mut self.music);
        if was_playing {
            self.emit_event(EditorEvent::PlaybackStateChanged { is_playing: false });
        }
    }

    /// Replays after an edit. The edit stands even when playback cannot
    /// resume; the session then reports itself stopped.
    fn restart(&mut self) {
        if let Err(e) = self.scheduler.restart(&self.track, &mut self.music) {
            log::warn!("Playback stopped after edit: {}", e);
            self.emit_event(EditorEvent::PlaybackStateChanged { is_playing: false });
        }
    }

    /// Swaps in a new track, dropping every event scheduled for the old one.
    pub fn replace_track(&mut self, track: Track) {
        let was_playing = self.music.playing;
        for id in self.track.notes().iter().filter_map(|n| n.id) {
            self.scheduler.cancel(id);
        }
        self.track = track;
        self.emit_event(EditorEvent::TrackReplaced {
            name: self.track.name.clone(),
            note_count: self.track.len(),
        });
        if was_playing {
            let offset = self.scheduler.engine().position_seconds();
            self.scheduler.stop(&mut self.music);
            if let Err(e) = self.scheduler.play(&self.track, &mut self.music, offset) {
                log::warn!("Could not resume playback: {}", e);
                self.emit_event(EditorEvent::PlaybackStateChanged { is_playing: false });
            }
        }
    }

    pub fn load_track(&mut self, store: &impl PersistenceService, id: RemoteId) -> Result<()> {
        let data = store.load(id)?;
        self.replace_track(TrackLoader::to_track(&data));
        Ok(())
    }

    pub fn save_track(&mut self, store: &mut impl PersistenceService) -> Result<RemoteId> {
        let id = store.save(&TrackData::from_track(&self.track))?;
        self.track.remote_id = Some(id);
        self.emit_event(EditorEvent::TrackSaved(id));
        Ok(id)
    }

    pub fn export(&mut self, destination: Option<&Path>) -> Result<ExportOutcome> {
        let outcome = self.codec.write_track(&self.track, &self.music, destination)?;
        self.emit_event(EditorEvent::TrackExported(outcome.clone()));
        Ok(outcome)
    }

    /// Replaces the current track with the notes of a MIDI file. The current
    /// track is untouched when the file cannot be imported.
    pub fn import(&mut self, path: &Path) -> Result<()> {
        let notes = self.codec.read_track(path, &self.music)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let mut track = Track::new(None, name);
        for note in notes {
            track.add_note(note);
        }
        self.replace_track(track);
        Ok(())
    }

    pub fn adapter(&self) -> NoteCanvasAdapter {
        NoteCanvasAdapter::new(self.render_context())
    }

    pub fn render_context(&self) -> RenderContext {
        self.music.render_context()
    }

    fn emit_event(&mut self, event: EditorEvent) {
        if let Some(ref mut listener) = self.event_listener {
            listener(&event);
        }
        self.pending_events.push(event);
    }

    // Public getters
    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn music(&self) -> &MusicContext {
        &self.music
    }

    pub fn is_playing(&self) -> bool {
        self.music.playing
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<E> {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recording::{EngineCall, RecordingEngine};
    use crate::project::JsonTrackStore;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn session() -> Session<RecordingEngine> {
        Session::new(RecordingEngine::default(), SessionOptions::default())
    }

    fn note_box(session: &Session<RecordingEngine>, start: u64, duration: u64, pitch: u8) -> NoteBox {
        session.adapter().to_box(&Note::new(start, duration, pitch))
    }

    #[test]
    fn adding_snaps_and_assigns_ids() {
        let mut session = session();
        let mut bbox = note_box(&session, 2, 2, 5);
        bbox.x += 1.0;
        bbox.width += 1.0;
        let id = session.add_note_from_box(&bbox).unwrap();

        assert_eq!(id, NoteId(0));
        let note = session.track().note(id).unwrap();
        assert_eq!((note.start_time, note.duration, note.pitch), (2, 2, 5));
    }

    #[test]
    fn overlapping_note_is_rejected_without_mutation() {
        let mut session = session();
        session.add_note(Note::new(0, 4, 3)).unwrap();
        let result = session.add_note(Note::new(2, 4, 3));
        assert!(matches!(result, Err(Error::NoteOverlap(NoteId(0)))));
        assert_eq!(session.track().len(), 1);

        // touching is fine
        session.add_note(Note::new(4, 4, 3)).unwrap();
        assert_eq!(session.track().len(), 2);
    }

    #[test]
    fn too_small_box_is_reported() {
        let mut session = session();
        let bbox = NoteBox::new(0.0, 50.0, 3.0, 100.0 / 13.0);
        let result = session.execute_command(EditorCommand::AddNote(bbox));
        assert!(matches!(result, Err(Error::NoteTooSmall)));
        assert!(session.track().is_empty());
    }

    #[test]
    fn deleting_a_scheduled_note_clears_it_once() {
        let mut session = session();
        session.add_note(Note::new(0, 2, 0)).unwrap();
        let id = session.add_note(Note::new(4, 2, 7)).unwrap();
        session.toggle_play().unwrap();
        let handle = session.scheduler().handle(id).unwrap();

        let deleted = session.delete_note(id).unwrap();
        assert_eq!(deleted.map(|n| n.pitch), Some(7));
        assert_eq!(session.scheduler().handle(id), None);
        let engine = session.scheduler().engine();
        assert_eq!(engine.count(&EngineCall::Clear(handle)), 1);
        assert!(session.is_playing());
        // only the remaining note is rescheduled
        assert_eq!(session.scheduler().scheduled_count(), 1);
    }

    #[test]
    fn deleting_twice_is_a_no_op() {
        let mut session = session();
        let id = session.add_note(Note::new(0, 2, 0)).unwrap();
        assert!(session.delete_note(id).unwrap().is_some());
        assert!(session.delete_note(id).unwrap().is_none());
    }

    #[test]
    fn edits_restart_playback_from_the_current_position() {
        let mut session = session();
        session.add_note(Note::new(0, 2, 0)).unwrap();
        session.toggle_play().unwrap();
        session.scheduler.engine_mut().position = 0.5;
        session.scheduler.engine_mut().calls.clear();

        session.set_octave(4).unwrap();
        let engine = session.scheduler().engine();
        assert_eq!(engine.calls.last(), Some(&EngineCall::Start(0.5)));
        assert_eq!(engine.scheduled()[0].1, "C4");
    }

    #[test]
    fn edits_while_stopped_do_not_touch_the_engine() {
        let mut session = session();
        session.add_note(Note::new(0, 2, 0)).unwrap();
        session.set_octave(3).unwrap();
        assert!(session.scheduler().engine().calls.is_empty());
    }

    #[test]
    fn unavailable_engine_reports_and_stays_stopped() {
        let engine = RecordingEngine {
            available: false,
            ..RecordingEngine::default()
        };
        let mut session = Session::new(engine, SessionOptions::default());
        let result = session.execute_command(EditorCommand::TogglePlay);
        assert!(matches!(result, Err(Error::PlaybackUnavailable(_))));
        assert!(!session.is_playing());
        assert!(matches!(
            session.take_events().last(),
            Some(EditorEvent::PlaybackStateChanged { is_playing: false })
        ));
    }

    #[test]
    fn listener_sees_every_event() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut session = session();
        let sink = Rc::clone(&seen);
        session.set_event_listener(Box::new(move |event: &EditorEvent| {
            sink.borrow_mut().push(format!("{event:?}"));
        }));

        session.add_note(Note::new(0, 1, 0)).unwrap();
        session
            .execute_command(EditorCommand::RenameTrack { name: "hook".to_string() })
            .unwrap();
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(session.take_events().len(), 2);
        assert!(session.take_events().is_empty());
        assert_eq!(session.track().name, "hook");
    }

    #[test]
    fn failed_import_keeps_the_current_track() {
        let mut session = session();
        session.add_note(Note::new(0, 1, 0)).unwrap();
        let missing = std::env::temp_dir().join("polyphona-missing-file.mid");
        assert!(session.import(&missing).is_err());
        assert_eq!(session.track().len(), 1);
    }

    #[test]
    fn replacing_the_track_cancels_old_events() {
        let mut session = session();
        let id = session.add_note(Note::new(0, 2, 0)).unwrap();
        session.toggle_play().unwrap();
        let handle = session.scheduler().handle(id).unwrap();

        session
            .execute_command(EditorCommand::NewTrack { name: "blank".to_string() })
            .unwrap();
        assert_eq!(session.scheduler().engine().count(&EngineCall::Clear(handle)), 1);
        assert_eq!(session.scheduler().scheduled_count(), 0);
        assert!(session.track().is_empty());
        assert!(session.is_playing());
    }

    #[test]
    fn save_load_and_export_round_trip() {
        let dir = std::env::temp_dir().join(format!("polyphona-session-{}", std::process::id()));
        let mut store = JsonTrackStore::new(dir.join("tracks"));
        let mut session = session();
        session.add_note(Note::new(0, 4, 2)).unwrap();
        session.add_note(Note::new(4, 4, 12)).unwrap();

        let id = session.save_track(&mut store).unwrap();
        assert_eq!(session.track().remote_id, Some(id));

        let midi = dir.join("out.mid");
        let outcome = session.export(Some(&midi)).unwrap();
        assert_eq!(outcome, ExportOutcome::Written(midi.clone()));
        assert_eq!(session.export(None).unwrap(), ExportOutcome::Cancelled);

        let mut fresh = self::session();
        fresh.load_track(&store, id).unwrap();
        assert_eq!(fresh.track().len(), 2);
        assert_eq!(fresh.track().remote_id, Some(id));

        fresh.import(&midi).unwrap();
        let pitches: Vec<u8> = fresh.track().notes().iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, vec![2, 12]);
        assert_eq!(fresh.track().name, "out");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn notes_off_the_grid_are_rejected() {
        let mut session = session();
        session.add_note(Note::new(0, 2, 0)).unwrap();

        let above = NoteBox::new(12.5, -10.0, 12.5, 100.0 / 13.0);
        assert!(matches!(
            session.add_note_from_box(&above),
            Err(Error::PitchOutOfRange(_))
        ));
        assert!(matches!(
            session.add_note(Note::new(4, 2, 13)),
            Err(Error::PitchOutOfRange(13))
        ));
        assert!(matches!(
            session.add_note(Note::new(4, 0, 3)),
            Err(Error::NoteTooSmall)
        ));
        let nan_width = NoteBox::new(12.5, 50.0, f64::NAN, 100.0 / 13.0);
        assert!(matches!(
            session.add_note_from_box(&nan_width),
            Err(Error::NoteTooSmall)
        ));
        assert_eq!(session.track().len(), 1);

        let midi = std::env::temp_dir().join(format!("polyphona-grid-{}.mid", std::process::id()));
        assert!(session.export(Some(&midi)).is_ok());
        std::fs::remove_file(&midi).unwrap();
    }

    #[test]
    fn edits_stand_when_the_engine_goes_away() {
        let mut session = session();
        session.toggle_play().unwrap();
        session.scheduler.engine_mut().available = false;
        session.take_events();

        let id = session.add_note(Note::new(0, 2, 0)).unwrap();
        assert_eq!(session.track().len(), 1);
        assert!(!session.is_playing());
        assert!(matches!(
            session.take_events().as_slice(),
            [
                EditorEvent::NoteAdded(_),
                EditorEvent::PlaybackStateChanged { is_playing: false }
            ]
        ));

        // stopped now, so later edits leave the engine alone
        session.set_octave(3).unwrap();
        assert_eq!(session.delete_note(id).unwrap().map(|n| n.pitch), Some(0));
        assert!(session.track().is_empty());
    }
}
