use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bookmate_core::{
    Command, DocumentId, DocumentSource, FileKeyValueStore, PaginationController, PositionStore,
    ReaderConfig, ReaderError, ReaderEvent, RendererAdapter,
};
use bookmate_render::{HttpSourceResolver, PdfiumRenderFactory};
use bookmate_tty::{
    EventMapper, InputMode, SharedChapterSelector, SharedView, TerminalView, UiEvent, Viewport,
};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::terminal;
use directories::ProjectDirs;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "bookmate",
    version,
    about = "Terminal PDF reader that remembers where you stopped"
)]
struct Args {
    /// Identifier progress is saved under; derived from the source if omitted
    #[arg(long = "book-id")]
    book_id: Option<String>,

    /// Endpoint answering with the `pdf_url` of the book to open
    #[arg(long = "api")]
    api: Option<String>,

    /// Path to config.toml
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Path to the pdfium shared library
    #[arg(long = "pdfium")]
    pdfium: Option<PathBuf>,

    /// Local path or URL of the PDF; the API endpoint is queried if omitted
    source: Option<String>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

enum LoopAction {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "bookmate", "bookmate")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let mut config = ReaderConfig::load(&config_path)?;
    if let Some(api) = &args.api {
        config.api_endpoint = api.clone();
    }
    let _log_guard = init_logging(&project_dirs, &config)?;

    let source = match &args.source {
        Some(raw) => DocumentSource::parse(raw),
        None => HttpSourceResolver::new(&config.api_endpoint)?
            .resolve()
            .await
            .context("failed to look up the book to open")?,
    };
    let id = match &args.book_id {
        Some(book_id) => DocumentId::new(book_id.clone()),
        None => DocumentId::for_source(&source),
    };
    info!(%id, %source, "opening book");

    let state_dir = config
        .state_dir
        .clone()
        .unwrap_or_else(|| project_dirs.data_local_dir().join("state"));
    let store = PositionStore::new(Arc::new(FileKeyValueStore::new(state_dir)?));
    let provider = Arc::new(PdfiumRenderFactory::new(args.pdfium.as_deref())?);

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let (columns, rows) = terminal::size()?;
    let view = SharedView::new(TerminalView::new(stdout, Viewport::new(columns, rows)));
    view.lock().clear()?;
    let selector = SharedChapterSelector::new();

    let adapter = RendererAdapter::new(provider, Box::new(view.clone())).with_config(&config);
    let mut controller = PaginationController::new(adapter, store, Box::new(selector.clone()));
    controller
        .load(id, source)
        .await
        .context("failed to open book")?;

    let mut mapper = EventMapper::new();
    let events = controller.events();
    let mut seen_events = 0;

    loop {
        let rendered = surface_events(&events, &mut seen_events, &view)?;
        if rendered && mapper.mode() == InputMode::Chapters {
            draw_chapters(&view, &selector)?;
        }

        if event::poll(Duration::from_millis(100))? {
            let ui_event = mapper.map_event(event::read()?);
            let action = handle_event(ui_event, &mut controller, &mut mapper, &view, &selector)?;
            if let Some(pending) = mapper.pending_input() {
                view.lock().set_notice(Some(pending))?;
            }
            if matches!(action, LoopAction::Quit) {
                break;
            }
        }
    }

    if let Err(err) = controller.settled().await {
        warn!(error = %err, "last render did not settle");
    }
    view.lock().clear()?;
    Ok(())
}

fn handle_event(
    event: UiEvent,
    controller: &mut PaginationController,
    mapper: &mut EventMapper,
    view: &SharedView<io::Stdout>,
    selector: &SharedChapterSelector,
) -> Result<LoopAction> {
    match event {
        UiEvent::Command(command) => apply_command(controller, view, command)?,
        UiEvent::OpenChapters => {
            selector.lock().open();
            mapper.set_mode(InputMode::Chapters);
            draw_chapters(view, selector)?;
        }
        UiEvent::ChapterMoveSelection { delta } => {
            if selector.lock().move_cursor(delta) {
                draw_chapters(view, selector)?;
            }
        }
        UiEvent::ChapterActivateSelection => {
            let chosen = selector.lock().activate();
            mapper.set_mode(InputMode::Normal);
            match chosen {
                Some(id) => apply_command(controller, view, Command::GotoChapter { id })?,
                None => controller.refresh()?,
            }
        }
        UiEvent::CloseOverlay => {
            mapper.set_mode(InputMode::Normal);
            controller.refresh()?;
        }
        UiEvent::Resize { columns, rows } => {
            view.lock().resize(Viewport::new(columns, rows));
            controller.refresh()?;
        }
        UiEvent::Quit => return Ok(LoopAction::Quit),
        UiEvent::None => {}
    }
    Ok(LoopAction::Continue)
}

/// Rejected navigation is shown in the status line instead of ending the session.
fn apply_command(
    controller: &mut PaginationController,
    view: &SharedView<io::Stdout>,
    command: Command,
) -> Result<()> {
    match controller.apply(command) {
        Ok(()) => Ok(()),
        Err(err @ ReaderError::OutOfRange { .. }) | Err(err @ ReaderError::UnknownChapter { .. }) => {
            view.lock().set_notice(Some(err.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Shows failures the render worker reported since the last call. Returns
/// whether a page was drawn in the meantime.
fn surface_events(
    events: &parking_lot::Mutex<Vec<ReaderEvent>>,
    seen: &mut usize,
    view: &SharedView<io::Stdout>,
) -> Result<bool> {
    let fresh: Vec<ReaderEvent> = {
        let log = events.lock();
        let fresh = log[*seen..].to_vec();
        *seen = log.len();
        fresh
    };
    let mut rendered = false;
    for event in fresh {
        match event {
            ReaderEvent::PageRendered { .. } => rendered = true,
            ReaderEvent::RenderFailed { page, message } => {
                view.lock()
                    .set_notice(Some(format!("page {} failed: {}", page, message)))?;
            }
            ReaderEvent::StorageFailed { page, .. } => {
                view.lock()
                    .set_notice(Some(format!("progress for page {} not saved", page)))?;
            }
            ReaderEvent::Loaded { .. } | ReaderEvent::ProgressSaved { .. } => {}
        }
    }
    Ok(rendered)
}

fn draw_chapters(view: &SharedView<io::Stdout>, selector: &SharedChapterSelector) -> Result<()> {
    let mut view = view.lock();
    let viewport = view.viewport();
    let lines = selector.lock().overlay_lines(
        usize::from(viewport.columns).saturating_sub(4),
        usize::from(viewport.image_rows()).saturating_sub(2),
    );
    view.draw_overlay(&lines)
}

fn init_logging(project_dirs: &ProjectDirs, config: &ReaderConfig) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "bookmate.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .with_context(|| format!("invalid log_filter {:?}", config.log_filter))?,
    };

    // The terminal belongs to the page image, so logs only go to the file.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
