//! 错误类型模块
//!
//! 音符编辑、播放调度、MIDI 导入导出与持久化共用的错误枚举。

use crate::project::RemoteId;
use crate::structure::NoteId;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Grid snapping produced a note shorter than one tick.
    #[error("box is narrower than one tick")]
    NoteTooSmall,
    #[error("invalid time value {0}")]
    InvalidTime(f64),
    #[error("malformed pitch name {0:?}")]
    MalformedPitch(String),
    #[error("audio engine unavailable: {0}")]
    PlaybackUnavailable(String),
    #[error("pitch {0} is outside the playable range")]
    PitchOutOfRange(i64),
    #[error("note overlaps existing note {0}")]
    NoteOverlap(NoteId),
    #[error("track {0} not found")]
    TrackNotFound(RemoteId),
    #[error("invalid MIDI data: {0}")]
    Midi(#[from] midly::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
