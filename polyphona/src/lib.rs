//! # polyphona
//!
//! 钢琴卷帘音序器的核心库：在时间/音高网格上建模音符，
//! 在网格与归一化画布坐标之间换算，把音符调度到音频引擎上循环播放，
//! 并以标准 MIDI 文件导入导出音轨。
//!
//! ## 基本使用
//!
//! ```no_run
//! use polyphona::{EditorCommand, NullEngine, Session, SessionOptions};
//!
//! let mut session = Session::new(NullEngine::default(), SessionOptions::default());
//! let bbox = session.adapter().to_box(&polyphona::Note::new(0, 4, 0));
//! session.execute_command(EditorCommand::AddNote(bbox)).unwrap();
//! ```

pub mod audio;
pub mod canvas;
pub mod editor;
pub mod error;
pub mod interchange;
pub mod music;
pub mod playback;
pub mod project;
pub mod structure;

pub use audio::{AudioEngine, EventHandle, NullEngine, SynthConfig, SynthEngine, Trigger};
pub use canvas::{clip, NoteBox, NoteCanvasAdapter};
pub use editor::{EditorCommand, EditorEvent, Session, SessionOptions};
pub use error::{Error, Result};
pub use interchange::{ExportOptions, ExportOutcome, NoteEvent, NoteInterchangeCodec};
pub use music::{MusicContext, PitchName, RenderContext, Scale, TransportTime};
pub use playback::PlaybackScheduler;
pub use project::{JsonTrackStore, PersistenceService, RemoteId, TrackData, TrackLoader};
pub use structure::{Note, NoteId, Track};
