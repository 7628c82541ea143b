//! MIDI 导入导出模块
//!
//! 把音轨导出为单轨标准 MIDI 文件，或从 MIDI 文件读回音符。
//! 中间层是以音名与秒为单位的 [`NoteEvent`]。

use crate::error::{Error, Result};
use crate::music::{MusicContext, PitchName};
use crate::structure::{Note, Track, DEFAULT_VELOCITY};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One sounded note, independent of the grid.
#[derive(Clone, Debug, PartialEq)]
pub struct NoteEvent {
    pub pitch: String, // e.g. "C#4"
    pub start: f64,    // Seconds
    pub duration: f64, // Seconds
    pub velocity: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct ExportOptions {
    pub ticks_per_beat: u16,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { ticks_per_beat: 480 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportOutcome {
    Written(PathBuf),
    Cancelled,
}

#[derive(Clone, Debug, Default)]
pub struct NoteInterchangeCodec {
    pub options: ExportOptions,
}

impl NoteInterchangeCodec {
    pub fn new(options: ExportOptions) -> Self {
        Self { options }
    }

    pub fn export_events(&self, track: &Track, music: &MusicContext) -> Result<Vec<NoteEvent>> {
        track
            .notes()
            .iter()
            .map(|note| {
                Ok(NoteEvent {
                    pitch: music.absolute_pitch(note.pitch)?.to_string(),
                    start: music.ticks_to_seconds(note.start_time),
                    duration: music.ticks_to_seconds(note.duration),
                    velocity: note.velocity,
                })
            })
            .collect()
    }

    /// Turns events back into notes. Any malformed pitch aborts the whole
    /// import.
    pub fn import_events(&self, events: &[NoteEvent], music: &MusicContext) -> Result<Vec<Note>> {
        events
            .iter()
            .map(|event| {
                let pitch = PitchName::parse(&event.pitch)?;
                let degree = music.degree_for(&pitch)?;
                let start = music.seconds_to_ticks(event.start)?;
                let duration = music.seconds_to_ticks(event.duration)?.max(1);
                Ok(Note::with_velocity(start, duration, degree, event.velocity))
            })
            .collect()
    }

    pub fn export_track(&self, track: &Track, music: &MusicContext) -> Result<Vec<u8>> {
        let events = self.export_events(track, music)?;
        let smf = self.to_smf(&events, music.bpm, &track.name)?;
        let mut out = Vec::new();
        smf.write_std(&mut out)?;
        log::debug!("Encoded {} notes into {} bytes", events.len(), out.len());
        Ok(out)
    }

    pub fn import_track(&self, bytes: &[u8], music: &MusicContext) -> Result<Vec<Note>> {
        let smf = Smf::parse(bytes)?;
        let events = from_smf(&smf);
        let mut notes = self.import_events(&events, music)?;
        notes.sort_by_key(|n| n.start_time);
        Ok(notes)
    }

    /// Encodes and writes the track. `None` or an empty path means the host
    /// dialog was cancelled; nothing is written.
    pub fn write_track(
        &self,
        track: &Track,
        music: &MusicContext,
        destination: Option<&Path>,
    ) -> Result<ExportOutcome> {
        let Some(path) = destination.filter(|p| !p.as_os_str().is_empty()) else {
            log::info!("Export cancelled");
            return Ok(ExportOutcome::Cancelled);
        };
        let bytes = self.export_track(track, music)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        log::info!("Track exported to: {:?}", path);
        Ok(ExportOutcome::Written(path.to_path_buf()))
    }

    pub fn read_track(&self, path: &Path, music: &MusicContext) -> Result<Vec<Note>> {
        let bytes = fs::read(path)?;
        self.import_track(&bytes, music)
    }

    fn to_smf<'a>(&self, events: &[NoteEvent], bpm: f64, name: &'a str) -> Result<Smf<'a>> {
        let ticks_per_beat = self.options.ticks_per_beat.max(1);
        let to_ticks = |seconds: f64| (seconds * bpm / 60.0 * ticks_per_beat as f64).round() as u64;

        let mut track: Vec<TrackEvent<'a>> = Vec::new();
        track.push(TrackEvent {
            delta: 0.into(),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(midly::num::u24::from(
                (60_000_000.0 / bpm.max(1.0)) as u32,
            ))),
        });
        if !name.is_empty() {
            track.push(TrackEvent {
                delta: 0.into(),
                kind: TrackEventKind::Meta(MetaMessage::TrackName(name.as_bytes())),
            });
        }

        // (tick, is_note_on, kind)
        let mut timed: Vec<(u64, bool, TrackEventKind<'a>)> = Vec::new();
        for event in events {
            let key = PitchName::parse(&event.pitch)?.midi_key()?;
            let start = to_ticks(event.start);
            let end = to_ticks(event.start + event.duration).max(start + 1);
            timed.push((
                start,
                true,
                TrackEventKind::Midi {
                    channel: 0.into(),
                    message: MidiMessage::NoteOn {
                        key: key.into(),
                        vel: velocity_to_midi(event.velocity).into(),
                    },
                },
            ));
            timed.push((
                end,
                false,
                TrackEventKind::Midi {
                    channel: 0.into(),
                    message: MidiMessage::NoteOff {
                        key: key.into(),
                        vel: 0.into(),
                    },
                },
            ));
        }
        // Note-offs first so touching notes on one key stay separate.
        timed.sort_by_key(|(tick, is_on, _)| (*tick, *is_on));

        let mut last_tick = 0;
        for (tick, _, kind) in timed {
            let delta = tick.saturating_sub(last_tick);
            last_tick = tick;
            let delta_ticks = u32::try_from(delta).unwrap_or(u32::MAX);
            track.push(TrackEvent {
                delta: delta_ticks.into(),
                kind,
            });
        }
        track.push(TrackEvent {
            delta: 0.into(),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });

        Ok(Smf {
            header: Header {
                format: Format::SingleTrack,
                timing: Timing::Metrical(ticks_per_beat.into()),
            },
            tracks: vec![track],
        })
    }
}

fn velocity_to_midi(velocity: f32) -> u8 {
    let velocity = if velocity.is_finite() {
        velocity
    } else {
        DEFAULT_VELOCITY
    };
    (velocity * 127.0).round().clamp(1.0, 127.0) as u8
}

fn velocity_from_midi(velocity: u8) -> f32 {
    velocity as f32 / 127.0
}

/// Tempo changes of a file, resolved to absolute seconds.
struct TempoMap {
    // (tick, seconds at tick, seconds per tick from here on)
    segments: Vec<(u64, f64, f64)>,
}

impl TempoMap {
    fn from_smf(smf: &Smf, ticks_per_beat: u16) -> Self {
        let seconds_per_tick =
            |micros_per_quarter: f64| micros_per_quarter / 1_000_000.0 / ticks_per_beat as f64;

        // Tempo events apply to every track, wherever they are stored.
        let mut changes: Vec<(u64, f64)> = Vec::new();
        for track in &smf.tracks {
            let mut ticks: u64 = 0;
            for event in track {
                ticks += event.delta.as_int() as u64;
                if let TrackEventKind::Meta(MetaMessage::Tempo(value)) = event.kind {
                    if value.as_int() > 0 {
                        changes.push((ticks, value.as_int() as f64));
                    }
                }
            }
        }
        changes.sort_by_key(|(tick, _)| *tick);

        let mut segments = vec![(0, 0.0, seconds_per_tick(500_000.0))];
        for (tick, micros) in changes {
            let Some(&(last_tick, last_seconds, last_rate)) = segments.last() else {
                continue;
            };
            let seconds = last_seconds + (tick - last_tick) as f64 * last_rate;
            if tick == last_tick {
                segments.pop();
            }
            segments.push((tick, seconds, seconds_per_tick(micros)));
        }
        Self { segments }
    }

    fn seconds_at(&self, tick: u64) -> f64 {
        let index = self.segments.partition_point(|(start, _, _)| *start <= tick);
        match index.checked_sub(1).and_then(|i| self.segments.get(i)) {
            Some(&(start, seconds, rate)) => seconds + (tick - start) as f64 * rate,
            None => 0.0,
        }
    }
}

/// Pairs note-on/off messages of every track into events.
fn from_smf(smf: &Smf) -> Vec<NoteEvent> {
    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(t) => t.as_int().max(1),
        _ => 480,
    };
    let tempo = TempoMap::from_smf(smf, ticks_per_beat);
    let mut events = Vec::new();

    for track in &smf.tracks {
        let mut current_ticks: u64 = 0;
        let mut active_notes: HashMap<u8, (u64, u8)> = HashMap::new();
        let mut finished: Vec<(u8, u64, u64, u8)> = Vec::new();

        for event in track {
            current_ticks += event.delta.as_int() as u64;
            if let TrackEventKind::Midi { message, .. } = event.kind {
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        active_notes.insert(key.as_int(), (current_ticks, vel.as_int()));
                    }
                    // NoteOn with velocity 0 is NoteOff
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        if let Some((start, velocity)) = active_notes.remove(&key.as_int()) {
                            finished.push((key.as_int(), start, current_ticks, velocity));
                        }
                    }
                    _ => {}
                }
            }
        }

        // Notes still held at the end of the track end there.
        if !active_notes.is_empty() {
            log::warn!(
                "Closing {} unterminated notes at end of track",
                active_notes.len()
            );
        }
        let mut held: Vec<_> = active_notes.into_iter().collect();
        held.sort_by_key(|(key, (start, _))| (*start, *key));
        for (key, (start, velocity)) in held {
            finished.push((key, start, current_ticks, velocity));
        }

        for (key, start, end, velocity) in finished {
            let start_seconds = tempo.seconds_at(start);
            events.push(NoteEvent {
                pitch: PitchName::from_midi_key(key).to_string(),
                start: start_seconds,
                duration: tempo.seconds_at(end) - start_seconds,
                velocity: velocity_from_midi(velocity),
            });
        }
    }
    events
}
