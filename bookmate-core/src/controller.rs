use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{ReaderError, Result};
use crate::navigation::{current_marker, reflect_in_control, ChapterControl};
use crate::renderer::{LoadedDocument, RendererAdapter};
use crate::{ChapterMarker, DocumentId, DocumentSource, MarkerId, PositionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: usize },
    GotoLastPage,
    GotoChapter { id: MarkerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Loading,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Loaded {
        id: DocumentId,
        page_count: usize,
        chapters: usize,
    },
    PageRendered {
        page: usize,
        total: usize,
    },
    RenderFailed {
        page: usize,
        message: String,
    },
    ProgressSaved {
        page: usize,
    },
    StorageFailed {
        page: usize,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderStatus {
    Rendered,
    /// A newer request arrived while this page was rendering; it was not
    /// drawn, persisted or synced.
    Superseded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    pub generation: u64,
    pub page: usize,
    pub status: RenderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageRequest {
    generation: u64,
    page: usize,
}

#[derive(Debug)]
struct Position {
    current: usize,
    displayed: Option<usize>,
}

type EventLog = Arc<Mutex<Vec<ReaderEvent>>>;

struct Collaborators {
    adapter: RendererAdapter,
    control: Box<dyn ChapterControl>,
}

struct ReadySession {
    document: Arc<LoadedDocument>,
    position: Arc<Mutex<Position>>,
    requests: watch::Sender<PageRequest>,
    outcomes: watch::Receiver<RenderOutcome>,
    generation: u64,
}

enum Phase {
    Idle(Collaborators),
    Loading,
    Ready(ReadySession),
}

/// Owns the reading position of one viewing session.
///
/// Navigation commands update the position synchronously and publish it; a
/// single render worker picks up the latest published page, renders it,
/// persists it and syncs the chapter control. Requests published while a
/// render is in flight collapse into the newest one.
pub struct PaginationController {
    phase: Phase,
    store: PositionStore,
    events: EventLog,
}

impl PaginationController {
    pub fn new(
        adapter: RendererAdapter,
        store: PositionStore,
        control: Box<dyn ChapterControl>,
    ) -> Self {
        Self {
            phase: Phase::Idle(Collaborators { adapter, control }),
            store,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ReaderEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn state(&self) -> ControllerState {
        match self.phase {
            Phase::Idle(_) => ControllerState::Idle,
            Phase::Loading => ControllerState::Loading,
            Phase::Ready(_) => ControllerState::Ready,
        }
    }

    pub fn document(&self) -> Option<&LoadedDocument> {
        match &self.phase {
            Phase::Ready(session) => Some(&session.document),
            _ => None,
        }
    }

    pub fn position(&self) -> Option<usize> {
        match &self.phase {
            Phase::Ready(session) => Some(session.position.lock().current),
            _ => None,
        }
    }

    pub fn total_pages(&self) -> Option<usize> {
        self.document().map(|doc| doc.page_count)
    }

    pub fn markers(&self) -> &[ChapterMarker] {
        self.document()
            .map(|doc| doc.markers.as_slice())
            .unwrap_or(&[])
    }

    /// Opens `source`, restores the saved position and renders it.
    ///
    /// On failure the controller goes back to `Idle` and may be loaded again.
    #[instrument(skip(self, source), fields(source = %source))]
    pub async fn load(&mut self, id: DocumentId, source: DocumentSource) -> Result<()> {
        if !matches!(self.phase, Phase::Idle(_)) {
            return Err(ReaderError::NotReady(self.state()));
        }
        let mut collaborators = match std::mem::replace(&mut self.phase, Phase::Loading) {
            Phase::Idle(collaborators) => collaborators,
            other => {
                self.phase = other;
                return Err(ReaderError::NotReady(self.state()));
            }
        };

        let document = match collaborators.adapter.load(id, source).await {
            Ok(document) => Arc::new(document),
            Err(err) => {
                warn!(error = %err, "document load failed");
                self.phase = Phase::Idle(collaborators);
                return Err(err);
            }
        };

        let stored = self.store.load(&document.id);
        let page = stored.clamp(1, document.page_count);
        if page != stored {
            debug!(stored, page, "clamped restored position");
        }
        collaborators.control.populate(&document.markers);

        let position = Arc::new(Mutex::new(Position {
            current: page,
            displayed: None,
        }));
        let initial = PageRequest {
            generation: 0,
            page,
        };
        let (requests, request_rx) = watch::channel(initial);
        let (outcome_tx, outcomes) = watch::channel(RenderOutcome {
            generation: 0,
            page,
            status: RenderStatus::Superseded,
        });

        let worker = RenderWorker {
            adapter: collaborators.adapter,
            control: collaborators.control,
            store: self.store.clone(),
            document: Arc::clone(&document),
            position: Arc::clone(&position),
            requests: request_rx,
            outcomes: outcome_tx,
            events: Arc::clone(&self.events),
        };
        tokio::spawn(worker.run());

        self.events.lock().push(ReaderEvent::Loaded {
            id: document.id.clone(),
            page_count: document.page_count,
            chapters: document.markers.len(),
        });
        info!(id = %document.id, page, "restored reading position");

        let mut session = ReadySession {
            document,
            position,
            requests,
            outcomes,
            generation: 0,
        };
        session.publish(page);
        self.phase = Phase::Ready(session);
        Ok(())
    }

    /// Moves one page forward. Returns `false` on the last page.
    pub fn next(&mut self) -> Result<bool> {
        self.step_forward(1)
    }

    /// Moves one page back. Returns `false` on the first page.
    pub fn prev(&mut self) -> Result<bool> {
        self.step_backward(1)
    }

    pub fn jump_to(&mut self, page: usize) -> Result<()> {
        let session = self.ready_mut()?;
        let total = session.document.page_count;
        if !session.document.contains(page) {
            return Err(ReaderError::OutOfRange { page, total });
        }
        session.commit(page);
        Ok(())
    }

    pub fn jump_to_chapter(&mut self, id: MarkerId) -> Result<()> {
        let page = self
            .markers()
            .iter()
            .find(|marker| marker.id == id)
            .map(|marker| marker.start_page)
            .ok_or(ReaderError::UnknownChapter { id: id.0 })?;
        self.jump_to(page)
    }

    pub fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::NextPage { count } => {
                self.step_forward(count)?;
            }
            Command::PrevPage { count } => {
                self.step_backward(count)?;
            }
            Command::GotoPage { page } => self.jump_to(page)?,
            Command::GotoLastPage => {
                let total = self.ready_mut()?.document.page_count;
                self.jump_to(total)?;
            }
            Command::GotoChapter { id } => self.jump_to_chapter(id)?,
        }
        Ok(())
    }

    /// Re-renders the current page, e.g. after the display was overdrawn.
    pub fn refresh(&mut self) -> Result<()> {
        let session = self.ready_mut()?;
        let position = Arc::clone(&session.position);
        let guard = position.lock();
        session.publish(guard.current);
        Ok(())
    }

    fn step_forward(&mut self, count: usize) -> Result<bool> {
        let session = self.ready_mut()?;
        let current = session.position.lock().current;
        let target = current
            .saturating_add(count)
            .min(session.document.page_count);
        if target == current {
            return Ok(false);
        }
        session.commit(target);
        Ok(true)
    }

    fn step_backward(&mut self, count: usize) -> Result<bool> {
        let session = self.ready_mut()?;
        let current = session.position.lock().current;
        let target = current.saturating_sub(count).max(1);
        if target == current {
            return Ok(false);
        }
        session.commit(target);
        Ok(true)
    }

    /// Waits until the render worker has handled every published request.
    pub async fn settled(&self) -> Result<RenderOutcome> {
        let session = match &self.phase {
            Phase::Ready(session) => session,
            _ => return Err(ReaderError::NotReady(self.state())),
        };
        let target = session.generation;
        let mut outcomes = session.outcomes.clone();
        let outcome = outcomes
            .wait_for(|outcome| outcome.generation >= target)
            .await
            .map_err(|_| ReaderError::Render {
                page: session.position.lock().current,
                cause: anyhow!("render worker stopped"),
            })?;
        Ok(outcome.clone())
    }

    fn ready_mut(&mut self) -> Result<&mut ReadySession> {
        let state = self.state();
        match &mut self.phase {
            Phase::Ready(session) => Ok(session),
            _ => Err(ReaderError::NotReady(state)),
        }
    }
}

impl ReadySession {
    fn commit(&mut self, page: usize) {
        let position = Arc::clone(&self.position);
        let mut guard = position.lock();
        guard.current = page;
        self.publish(page);
    }

    fn publish(&mut self, page: usize) {
        self.generation += 1;
        self.requests.send_replace(PageRequest {
            generation: self.generation,
            page,
        });
        debug!(page, generation = self.generation, "position change published");
    }
}

struct RenderWorker {
    adapter: RendererAdapter,
    control: Box<dyn ChapterControl>,
    store: PositionStore,
    document: Arc<LoadedDocument>,
    position: Arc<Mutex<Position>>,
    requests: watch::Receiver<PageRequest>,
    outcomes: watch::Sender<RenderOutcome>,
    events: EventLog,
}

impl RenderWorker {
    async fn run(mut self) {
        while self.requests.changed().await.is_ok() {
            let request = *self.requests.borrow_and_update();
            let outcome = self.handle(request).await;
            self.outcomes.send_replace(outcome);
        }
        debug!(id = %self.document.id, "render worker stopped");
    }

    async fn handle(&mut self, request: PageRequest) -> RenderOutcome {
        let page = request.page;
        let total = self.document.page_count;
        let rendered = match self.adapter.rasterize(&self.document, page).await {
            Ok(_) if self.is_superseded() => {
                debug!(page, "dropping render superseded by a newer request");
                return RenderOutcome {
                    generation: request.generation,
                    page,
                    status: RenderStatus::Superseded,
                };
            }
            Ok(image) => self.adapter.present(&self.document, page, &image),
            Err(err) => Err(err),
        };

        let status = match rendered {
            Ok(()) => {
                self.position.lock().displayed = Some(page);
                self.persist(page);
                let marker = current_marker(&self.document.markers, page);
                reflect_in_control(self.control.as_mut(), marker);
                self.events
                    .lock()
                    .push(ReaderEvent::PageRendered { page, total });
                RenderStatus::Rendered
            }
            Err(err) => {
                let message = format!("{:#}", anyhow::Error::from(err));
                warn!(page, error = %message, "page render failed");
                {
                    // Commands publish while holding this lock, so a pending
                    // request cannot slip in between the check and the rollback.
                    let mut position = self.position.lock();
                    if !self.is_superseded() {
                        if let Some(displayed) = position.displayed {
                            position.current = displayed;
                        }
                    }
                }
                self.events.lock().push(ReaderEvent::RenderFailed {
                    page,
                    message: message.clone(),
                });
                RenderStatus::Failed(message)
            }
        };

        RenderOutcome {
            generation: request.generation,
            page,
            status,
        }
    }

    fn is_superseded(&self) -> bool {
        self.requests.has_changed().unwrap_or(false)
    }

    fn persist(&self, page: usize) {
        match self.store.save(&self.document.id, page) {
            Ok(()) => self.events.lock().push(ReaderEvent::ProgressSaved { page }),
            Err(err) => {
                let message = format!("{:#}", anyhow::Error::from(err));
                warn!(page, error = %message, "failed to save reading progress");
                self.events
                    .lock()
                    .push(ReaderEvent::StorageFailed { page, message });
            }
        }
    }
}
