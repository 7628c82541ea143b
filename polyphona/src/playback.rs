//! 播放调度模块
//!
//! 把音轨中的音符换算为走带时间并登记到音频引擎；维护音符 id 到事件句柄的映射，
//! 以便删除音符或停止播放时撤销已调度的事件。

use crate::audio::{AudioEngine, EventHandle, Trigger};
use crate::error::{Error, Result};
use crate::music::MusicContext;
use crate::structure::{Note, NoteId, Track};
use std::collections::HashMap;

pub struct PlaybackScheduler<E: AudioEngine> {
    engine: E,
    schedule: HashMap<NoteId, EventHandle>,
}

impl<E: AudioEngine> PlaybackScheduler<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            schedule: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Handle currently registered for a note, if any.
    pub fn handle(&self, id: NoteId) -> Option<EventHandle> {
        self.schedule.get(&id).copied()
    }

    pub fn scheduled_count(&self) -> usize {
        self.schedule.len()
    }

    /// Registers one trigger per note. Notes that cannot be sounded are
    /// skipped with a warning.
    pub fn schedule_all(&mut self, track: &Track, music: &MusicContext) {
        for note in track.notes() {
            if let Err(e) = self.schedule_note(note, music) {
                log::warn!("Skipping note {:?}: {}", note.id, e);
            }
        }
        log::debug!(
            "Scheduled {} of {} notes",
            self.schedule.len(),
            track.len()
        );
    }

    fn schedule_note(&mut self, note: &Note, music: &MusicContext) -> Result<()> {
        let Some(id) = note.id else {
            // Only notes owned by a track can be cancelled later.
            return Ok(());
        };
        let pitch = music.absolute_pitch(note.pitch)?;
        let key = pitch.midi_key()?;
        let at = music.to_transport_time(tick_value(note.start_time)?)?;
        let duration = music.to_transport_time(tick_value(note.duration)?)?;

        // Re-scheduling a note replaces its previous event.
        self.cancel(id);
        let trigger = Trigger {
            pitch,
            key,
            duration,
            velocity: note.velocity,
        };
        log::debug!("Scheduling {} ({}) at {} for {}", trigger.pitch, id, at, duration);
        let handle = self.engine.schedule(trigger, at);
        self.schedule.insert(id, handle);
        Ok(())
    }

    /// Clears the event registered for `id`. Safe to call when none exists.
    pub fn cancel(&mut self, id: NoteId) {
        if let Some(handle) = self.schedule.remove(&id) {
            self.engine.clear(handle);
        }
    }

    /// Loops `bars` bars and starts the transport `offset_seconds` in.
    pub fn play(&mut self, track: &Track, music: &mut MusicContext, offset_seconds: f64) -> Result<()> {
        if !self.engine.is_available() {
            music.playing = false;
            return Err(Error::PlaybackUnavailable(
                "no audio output is available".to_string(),
            ));
        }
        if !offset_seconds.is_finite() || offset_seconds < 0.0 {
            return Err(Error::InvalidTime(offset_seconds));
        }

        self.engine.set_bpm(music.bpm);
        self.engine.set_loop(music.loop_end(), true);
        self.schedule_all(track, music);
        self.engine.start(offset_seconds);
        music.playing = true;
        log::info!("Playback started at {:.3}s", offset_seconds);
        Ok(())
    }

    /// Stops the transport and drops every pending event.
    pub fn stop(&mut self, music: &mut MusicContext) {
        self.engine.stop();
        self.engine.cancel_all();
        self.schedule.clear();
        music.playing = false;
        log::info!("Playback stopped");
    }

    /// Replays from the current transport position so edits take effect at
    /// once. Does nothing while stopped.
    pub fn restart(&mut self, track: &Track, music: &mut MusicContext) -> Result<()> {
        if !music.playing {
            return Ok(());
        }
        let offset = self.engine.position_seconds();
        self.stop(music);
        self.play(track, music, offset)
    }

    pub fn toggle(&mut self, track: &Track, music: &mut MusicContext) -> Result<()> {
        if music.playing {
            self.stop(music);
            Ok(())
        } else {
            self.play(track, music, 0.0)
        }
    }
}

fn tick_value(ticks: u64) -> Result<i64> {
    i64::try_from(ticks).map_err(|_| Error::InvalidTime(ticks as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recording::{EngineCall, RecordingEngine};

    fn track() -> Track {
        let mut track = Track::new(None, "test");
        track.add_note(Note::new(0, 2, 0));
        track.add_note(Note::new(4, 4, 4));
        track.add_note(Note::new(20, 1, 12));
        track
    }

    #[test]
    fn schedules_every_note_with_transport_times() {
        let track = track();
        let music = MusicContext::default();
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.schedule_all(&track, &music);

        let scheduled = scheduler.engine().scheduled();
        let summary: Vec<(&str, &str)> = scheduled
            .iter()
            .map(|(_, pitch, at)| (pitch.as_str(), at.as_str()))
            .collect();
        assert_eq!(summary, vec![("C2", "0:0:0"), ("E2", "0:1:0"), ("C3", "1:1:0")]);
        assert_eq!(scheduler.scheduled_count(), 3);
        assert_eq!(scheduler.handle(NoteId(1)), Some(scheduled[1].0));
    }

    #[test]
    fn durations_are_transport_times() {
        let mut track = Track::default();
        track.add_note(Note::new(0, 6, 0));
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.schedule_all(&track, &MusicContext::default());
        match &scheduler.engine().calls[0] {
            EngineCall::Schedule { duration, .. } => assert_eq!(duration, "0:1:2"),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn cancel_clears_exactly_once() {
        let track = track();
        let music = MusicContext::default();
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.schedule_all(&track, &music);

        let handle = scheduler.handle(NoteId(1)).unwrap();
        scheduler.cancel(NoteId(1));
        scheduler.cancel(NoteId(1));
        assert_eq!(scheduler.handle(NoteId(1)), None);
        assert_eq!(scheduler.engine().count(&EngineCall::Clear(handle)), 1);
        assert_eq!(scheduler.scheduled_count(), 2);
    }

    #[test]
    fn cancel_unknown_note_is_a_no_op() {
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.cancel(NoteId(42));
        assert!(scheduler.engine().calls.is_empty());
    }

    #[test]
    fn rescheduling_replaces_previous_events() {
        let track = track();
        let music = MusicContext::default();
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.schedule_all(&track, &music);
        let first = scheduler.handle(NoteId(0)).unwrap();
        scheduler.schedule_all(&track, &music);
        assert_eq!(scheduler.engine().count(&EngineCall::Clear(first)), 1);
        assert_eq!(scheduler.scheduled_count(), 3);
    }

    #[test]
    fn play_loops_and_starts_at_offset() {
        let track = track();
        let mut music = MusicContext {
            bars: 2,
            ..MusicContext::default()
        };
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.play(&track, &mut music, 0.75).unwrap();

        assert!(music.playing);
        let calls = &scheduler.engine().calls;
        assert_eq!(calls[0], EngineCall::SetBpm(120.0));
        assert_eq!(calls[1], EngineCall::SetLoop("2:0:0".to_string(), true));
        assert_eq!(calls.last(), Some(&EngineCall::Start(0.75)));
        assert_eq!(scheduler.engine().scheduled().len(), 3);
    }

    #[test]
    fn unavailable_engine_leaves_playback_stopped() {
        let track = track();
        let mut music = MusicContext::default();
        let engine = RecordingEngine {
            available: false,
            ..RecordingEngine::default()
        };
        let mut scheduler = PlaybackScheduler::new(engine);
        let result = scheduler.play(&track, &mut music, 0.0);
        assert!(matches!(result, Err(Error::PlaybackUnavailable(_))));
        assert!(!music.playing);
        assert!(scheduler.engine().calls.is_empty());
    }

    #[test]
    fn stop_cancels_everything() {
        let track = track();
        let mut music = MusicContext::default();
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.play(&track, &mut music, 0.0).unwrap();
        scheduler.stop(&mut music);

        assert!(!music.playing);
        assert_eq!(scheduler.scheduled_count(), 0);
        let calls = &scheduler.engine().calls;
        let tail = &calls[calls.len() - 2..];
        assert_eq!(tail, &[EngineCall::Stop, EngineCall::CancelAll]);
    }

    #[test]
    fn restart_resumes_from_transport_position() {
        let track = track();
        let mut music = MusicContext::default();
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.play(&track, &mut music, 0.0).unwrap();
        scheduler.engine_mut().position = 1.25;
        scheduler.engine_mut().calls.clear();

        scheduler.restart(&track, &mut music).unwrap();
        assert!(music.playing);
        let calls = &scheduler.engine().calls;
        assert_eq!(calls[0], EngineCall::Stop);
        assert_eq!(calls[1], EngineCall::CancelAll);
        assert_eq!(calls.last(), Some(&EngineCall::Start(1.25)));
        // Stopping dropped the old handles, so nothing is cleared twice.
        assert!(!calls.iter().any(|c| matches!(c, EngineCall::Clear(_))));
        assert_eq!(scheduler.engine().scheduled().len(), 3);
    }

    #[test]
    fn restart_while_stopped_does_nothing() {
        let track = track();
        let mut music = MusicContext::default();
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.restart(&track, &mut music).unwrap();
        assert!(scheduler.engine().calls.is_empty());
        assert!(!music.playing);
    }

    #[test]
    fn toggle_switches_state() {
        let track = track();
        let mut music = MusicContext::default();
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.toggle(&track, &mut music).unwrap();
        assert!(music.playing);
        scheduler.toggle(&track, &mut music).unwrap();
        assert!(!music.playing);
    }

    #[test]
    fn notes_outside_the_scale_are_skipped() {
        let mut track = track();
        track.add_note(Note::new(1, 1, 13));
        let mut scheduler = PlaybackScheduler::new(RecordingEngine::default());
        scheduler.schedule_all(&track, &MusicContext::default());
        assert_eq!(scheduler.scheduled_count(), 3);
        assert_eq!(scheduler.handle(NoteId(3)), None);
    }
}
