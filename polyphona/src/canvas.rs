use crate::error::{Error, Result};
use crate::music::RenderContext;
use crate::structure::{Note, NoteId, MAX_PITCH};

// Tolerance for quotients that land a hair below a whole grid step.
const GRID_EPSILON: f64 = 1e-9;

/// Rectangle on the normalized drawing surface, in percent (0 to 100).
/// `y` grows downward.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct NoteBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub id: Option<NoteId>,
}

impl NoteBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            id: None,
        }
    }
}

/// Number of whole `step`s in `value`, rounded down.
fn grid_floor(value: f64, step: f64) -> f64 {
    let quotient = value / step;
    let nearest = quotient.round();
    if (quotient - nearest).abs() < GRID_EPSILON {
        nearest
    } else {
        quotient.floor()
    }
}

/// Snaps `value` down to a multiple of `step`.
///
/// `clip(10.3, 1.0) == 10.0`, `clip(12.0, 5.0) == 10.0`, `clip(15.01, 2.5) == 15.0`
pub fn clip(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    grid_floor(value, step) * step
}

/// Maps notes to boxes on the drawing surface and back.
#[derive(Clone, Copy, Debug)]
pub struct NoteCanvasAdapter {
    render: RenderContext,
}

impl NoteCanvasAdapter {
    pub fn new(render: RenderContext) -> Self {
        Self { render }
    }

    pub fn render_context(&self) -> &RenderContext {
        &self.render
    }

    /// Degree 0 sits on the bottom row of the surface.
    pub fn to_box(&self, note: &Note) -> NoteBox {
        let height = self.render.percent_per_interval;
        NoteBox {
            id: note.id,
            x: self.render.percent_per_tick * note.start_time as f64,
            y: 100.0 - (height + self.render.percent_per_interval * note.pitch as f64),
            width: self.render.percent_per_tick * note.duration as f64,
            height,
        }
    }

    /// Inverse of [`to_box`](Self::to_box). The returned note has no id.
    pub fn to_note(&self, bbox: &NoteBox) -> Result<Note> {
        let duration = grid_floor(bbox.width, self.render.percent_per_tick);
        if !duration.is_finite() || duration < 1.0 {
            return Err(Error::NoteTooSmall);
        }
        for value in [bbox.x, bbox.y, bbox.height] {
            if !value.is_finite() {
                return Err(Error::InvalidTime(value));
            }
        }

        let start_time = grid_floor(bbox.x, self.render.percent_per_tick);
        if start_time < 0.0 {
            return Err(Error::InvalidTime(start_time));
        }

        let pitch = grid_floor(
            100.0 - (bbox.y + bbox.height),
            self.render.percent_per_interval,
        );
        if !(0.0..=MAX_PITCH as f64).contains(&pitch) {
            return Err(Error::PitchOutOfRange(pitch as i64));
        }

        Ok(Note::new(start_time as u64, duration as u64, pitch as u8))
    }

    /// Snaps a free-form box onto the note grid.
    pub fn clip(&self, bbox: &NoteBox) -> NoteBox {
        NoteBox {
            x: clip(bbox.x, self.render.percent_per_tick),
            y: clip(bbox.y, self.render.percent_per_interval),
            width: clip(bbox.width, self.render.percent_per_tick),
            height: clip(bbox.height, self.render.percent_per_interval),
            id: bbox.id,
        }
    }
}
