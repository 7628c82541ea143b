use crate::project::RemoteId;
use std::fmt;

pub const DEFAULT_VELOCITY: f32 = 0.8;
/// Highest scale degree a note may hold; 12 is degree 0 one octave up.
pub const MAX_PITCH: u8 = 12;

/// Identifier handed out by the owning [`Track`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoteId(pub u64);

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, Copy, PartialEq)]
pub struct Note {
    pub id: Option<NoteId>, // Set by Track::add_note
    pub start_time: u64,    // Ticks
    pub duration: u64,      // Ticks
    pub pitch: u8,          // Scale degree, 0..=12
    pub velocity: f32,      // (0, 1]
}

impl Note {
    pub fn new(start_time: u64, duration: u64, pitch: u8) -> Self {
        Self::with_velocity(start_time, duration, pitch, DEFAULT_VELOCITY)
    }

    pub fn with_velocity(start_time: u64, duration: u64, pitch: u8, velocity: f32) -> Self {
        Self {
            id: None,
            start_time,
            duration,
            pitch,
            velocity,
        }
    }

    pub fn end_time(&self) -> u64 {
        self.start_time.saturating_add(self.duration)
    }

    /// Whether this note overlaps `other` on the same pitch.
    ///
    /// Notes that only touch at an endpoint do not disturb each other.
    pub fn disturbs(&self, other: &Note) -> bool {
        let same_pitch = other.pitch == self.pitch;
        let overlaps_right = self.start_time < other.end_time();
        let overlaps_left = self.end_time() > other.start_time;
        same_pitch && overlaps_right && overlaps_left
    }
}

#[derive(Clone, Debug, Default)]
pub struct Track {
    notes: Vec<Note>,
    last_id: u64,
    pub remote_id: Option<RemoteId>,
    pub name: String,
}

impl Track {
    pub fn new(remote_id: Option<RemoteId>, name: impl Into<String>) -> Self {
        Self {
            notes: Vec::new(),
            last_id: 0,
            remote_id,
            name: name.into(),
        }
    }

    /// Assigns the next id to `note` and appends it. Overlap checking is left
    /// to the caller.
    pub fn add_note(&mut self, mut note: Note) -> NoteId {
        let id = NoteId(self.last_id);
        self.last_id += 1;
        note.id = Some(id);
        self.notes.push(note);
        id
    }

    /// Removes the first note equal to `note`. Returns `None` when it is not
    /// part of the track.
    pub fn delete_note(&mut self, note: &Note) -> Option<Note> {
        let index = self.notes.iter().position(|n| n == note)?;
        Some(self.notes.remove(index))
    }

    pub fn delete_note_by_id(&mut self, id: NoteId) -> Option<Note> {
        let index = self.notes.iter().position(|n| n.id == Some(id))?;
        Some(self.notes.remove(index))
    }

    pub fn note(&self, id: NoteId) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == Some(id))
    }

    /// First stored note that `note` would overlap.
    pub fn find_disturbing(&self, note: &Note) -> Option<&Note> {
        self.notes.iter().find(|existing| existing.disturbs(note))
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}
