//! 音乐上下文模块
//!
//! 音阶、音名、全局音乐参数，以及 tick 与走带时间（"bar:quarter:sixteenth"）之间的换算。

use crate::error::{Error, Result};
use std::fmt;

const CHROMATIC: [&str; 13] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B", "C",
];

/// Degree that names the same pitch class as degree 0, one octave up.
pub const OCTAVE_ALIAS_DEGREE: u8 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scale {
    names: &'static [&'static str],
}

impl Scale {
    pub fn chromatic() -> Self {
        Self { names: &CHROMATIC }
    }

    /// Number of degrees, including the octave alias.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, degree: u8) -> Option<&'static str> {
        self.names.get(degree as usize).copied()
    }

    /// Inverse mapping. The alias degree is never returned.
    pub fn degree_of(&self, name: &str) -> Option<u8> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|index| index as u8)
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::chromatic()
    }
}

/// A pitch class name with an octave, e.g. `C#4`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PitchName {
    pub class: &'static str,
    pub octave: i32,
}

impl PitchName {
    /// Parses `letter[#]octave`, e.g. `"C#4"` or `"A-1"`.
    pub fn parse(token: &str) -> Result<Self> {
        let malformed = || Error::MalformedPitch(token.to_string());

        let split = token
            .find(|c: char| c.is_ascii_digit() || c == '-')
            .ok_or_else(malformed)?;
        let (class, octave) = token.split_at(split);

        let degree = Scale::chromatic().degree_of(class).ok_or_else(malformed)?;
        let digits = octave.strip_prefix('-').unwrap_or(octave);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed());
        }
        let octave: i32 = octave.parse().map_err(|_| malformed())?;

        Ok(Self {
            class: CHROMATIC[degree as usize],
            octave,
        })
    }

    pub fn from_midi_key(key: u8) -> Self {
        Self {
            class: CHROMATIC[(key % 12) as usize],
            octave: (key / 12) as i32 - 1,
        }
    }

    /// MIDI key number, with C4 = 60.
    pub fn midi_key(&self) -> Result<u8> {
        let index = Scale::chromatic()
            .degree_of(self.class)
            .ok_or_else(|| Error::MalformedPitch(self.class.to_string()))?;
        let key = (self.octave as i64 + 1) * 12 + index as i64;
        u8::try_from(key)
            .ok()
            .filter(|k| *k <= 127)
            .ok_or(Error::PitchOutOfRange(key))
    }
}

impl fmt::Display for PitchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class, self.octave)
    }
}

/// Position on a loop-based musical clock, `bar:quarter:sixteenth`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransportTime {
    pub bar: u64,
    pub quarter: u64,
    pub sixteenth: f64,
}

impl TransportTime {
    pub const ZERO: TransportTime = TransportTime {
        bar: 0,
        quarter: 0,
        sixteenth: 0.0,
    };

    pub fn bars(bar: u64) -> Self {
        Self {
            bar,
            ..Self::ZERO
        }
    }

    /// Length in quarter notes, assuming four quarters per bar.
    pub fn to_quarters(&self) -> f64 {
        (self.bar * 4 + self.quarter) as f64 + self.sixteenth / 4.0
    }

    pub fn to_seconds(&self, bpm: f64) -> f64 {
        self.to_quarters() * 60.0 / bpm.max(1.0)
    }
}

impl fmt::Display for TransportTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.bar, self.quarter, self.sixteenth)
    }
}

#[derive(Clone, Debug)]
pub struct MusicContext {
    pub division: u32, // Ticks per quarter note
    pub scale: Scale,
    pub octave: i32,
    pub bars: u32,
    pub bpm: f64,
    pub playing: bool,
}

impl Default for MusicContext {
    fn default() -> Self {
        Self {
            division: 4,
            scale: Scale::chromatic(),
            octave: 2,
            bars: 1,
            bpm: 120.0,
            playing: false,
        }
    }
}

impl MusicContext {
    pub fn to_transport_time(&self, tick: i64) -> Result<TransportTime> {
        if tick < 0 {
            return Err(Error::InvalidTime(tick as f64));
        }
        let tick = tick as u64;
        let division = self.division.max(1) as u64;

        let quarter_total = tick / division;
        let bar = quarter_total / 4;
        let quarter = quarter_total - 4 * bar;
        let sixteenth = 4.0 / division as f64 * (tick % division) as f64;

        Ok(TransportTime {
            bar,
            quarter,
            sixteenth,
        })
    }

    /// End of the loop, `bars:0:0`.
    pub fn loop_end(&self) -> TransportTime {
        TransportTime::bars(self.bars as u64)
    }

    pub fn ticks_per_bar(&self) -> u64 {
        4 * self.division as u64
    }

    pub fn ticks_to_seconds(&self, ticks: u64) -> f64 {
        ticks as f64 / self.division.max(1) as f64 / (self.bpm / 60.0)
    }

    /// Nearest tick for a duration in seconds.
    pub fn seconds_to_ticks(&self, seconds: f64) -> Result<u64> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(Error::InvalidTime(seconds));
        }
        Ok((seconds * self.division as f64 * (self.bpm / 60.0)).round() as u64)
    }

    /// Name and octave sounded by a scale degree in this context.
    pub fn absolute_pitch(&self, degree: u8) -> Result<PitchName> {
        let class = self
            .scale
            .name(degree)
            .ok_or(Error::PitchOutOfRange(degree as i64))?;
        let octave = if degree == OCTAVE_ALIAS_DEGREE {
            self.octave + 1
        } else {
            self.octave
        };
        Ok(PitchName { class, octave })
    }

    /// Scale degree for a sounded pitch; undoes the alias of
    /// [`absolute_pitch`](Self::absolute_pitch).
    pub fn degree_for(&self, pitch: &PitchName) -> Result<u8> {
        let degree = self
            .scale
            .degree_of(pitch.class)
            .ok_or_else(|| Error::MalformedPitch(pitch.to_string()))?;
        if degree == 0 && pitch.octave == self.octave + 1 {
            return Ok(OCTAVE_ALIAS_DEGREE);
        }
        Ok(degree)
    }

    pub fn render_context(&self) -> RenderContext {
        RenderContext::from_music(self)
    }
}

/// Normalized drawing units derived from a [`MusicContext`]; always
/// recomputed, never cached alongside it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderContext {
    pub percent_per_tick: f64,
    pub percent_per_interval: f64,
}

impl RenderContext {
    pub fn from_music(music: &MusicContext) -> Self {
        let bars = music.bars.max(1) as f64;
        let division = music.division.max(1) as f64;
        Self {
            percent_per_tick: 100.0 / bars / (4.0 * division),
            percent_per_interval: 100.0 / music.scale.len().max(1) as f64,
        }
    }
}
