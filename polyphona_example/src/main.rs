use polyphona::{
    AudioEngine, EditorCommand, EditorEvent, ExportOutcome, JsonTrackStore, Note, NullEngine,
    PersistenceService, RemoteId, Session, SessionOptions, SynthEngine,
};
use rfd::FileDialog;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

struct Args {
    store_dir: PathBuf,
    track_id: Option<RemoteId>,
    export_path: Option<PathBuf>,
}

impl Args {
    // polyphona_example [store_dir] [track_id] [export.mid]
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let store_dir = args
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("polyphona_tracks"));
        let track_id = args.next().and_then(|s| s.parse().ok()).map(RemoteId);
        let export_path = args.next().map(PathBuf::from);
        Self {
            store_dir,
            track_id,
            export_path,
        }
    }
}

fn main() {
    // 配置日志：设置默认级别为 info
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let engine: Box<dyn AudioEngine> = match SynthEngine::new() {
        Ok(engine) => Box::new(engine),
        Err(e) => {
            log::warn!("{}; continuing without sound", e);
            Box::new(NullEngine::default())
        }
    };

    if let Err(e) = run(engine, args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(engine: Box<dyn AudioEngine>, args: Args) -> polyphona::Result<()> {
    let mut store = JsonTrackStore::new(&args.store_dir);
    for summary in store.list()? {
        log::info!("Stored track {}: {}", summary.id, summary.name);
    }

    let mut session = Session::new(engine, SessionOptions::with_bars(2));
    session.set_event_listener(Box::new(|event: &EditorEvent| log::info!("{:?}", event)));

    match args.track_id {
        Some(id) => session.load_track(&store, id)?,
        None => {
            session.execute_command(EditorCommand::NewTrack {
                name: "demo".to_string(),
            })?;
            for (start, duration, pitch) in [(0, 4, 0), (4, 4, 4), (8, 4, 7), (12, 4, 12)] {
                session.add_note(Note::new(start, duration, pitch))?;
            }
        }
    }

    match session.toggle_play() {
        Ok(()) => {
            thread::sleep(Duration::from_secs(4));
            // Edits are heard right away.
            let bbox = session.adapter().to_box(&Note::new(16, 8, 9));
            if let Err(e) = session.execute_command(EditorCommand::AddNote(bbox)) {
                log::warn!("Note not added: {}", e);
            }
            session.execute_command(EditorCommand::SetOctave(3))?;
            thread::sleep(Duration::from_secs(4));
            session.stop();
        }
        Err(e) => log::warn!("Playback skipped: {}", e),
    }

    let id = session.save_track(&mut store)?;
    log::info!("Saved as track {}", id);

    let destination = args.export_path.or_else(|| {
        FileDialog::new()
            .add_filter("MIDI", &["mid", "midi"])
            .set_title("Export as MIDI")
            .set_file_name("track.mid")
            .save_file()
    });
    if let ExportOutcome::Cancelled = session.export(destination.as_deref())? {
        log::info!("Nothing exported");
    }

    let added = session
        .take_events()
        .iter()
        .filter(|e| matches!(e, EditorEvent::NoteAdded(_)))
        .count();
    log::info!("{} notes added this session", added);
    Ok(())
}
