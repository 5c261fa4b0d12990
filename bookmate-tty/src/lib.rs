use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bookmate_core::{page_indicator, RenderImage, Surface};
use crossterm::{
    cursor,
    style::{Attribute, Print, SetAttribute},
    terminal::{Clear, ClearType},
};
use parking_lot::Mutex;
use png::{BitDepth, ColorType, Encoder};
use tracing::debug;

mod chapters;
mod input;

pub use chapters::{ChapterSelector, SelectorOption, SharedChapterSelector};
pub use input::{EventMapper, InputMode, UiEvent};

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    if more { 1 } else { 0 }
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", if more { 1 } else { 0 })?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Clears the entire screen.
    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub columns: u16,
    pub rows: u16,
}

impl Viewport {
    pub fn new(columns: u16, rows: u16) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }

    /// Rows left for the page image once the status line is reserved.
    pub fn image_rows(&self) -> u16 {
        self.rows.saturating_sub(1).max(1)
    }
}

/// The page image with a one-line status bar underneath.
pub struct TerminalView<W: Write> {
    renderer: KittyRenderer<W>,
    viewport: Viewport,
    indicator: String,
    notice: Option<String>,
}

impl<W: Write> TerminalView<W> {
    pub fn new(writer: W, viewport: Viewport) -> Self {
        Self {
            renderer: KittyRenderer::new(writer),
            viewport,
            indicator: String::new(),
            notice: None,
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn resize(&mut self, viewport: Viewport) {
        debug!(columns = viewport.columns, rows = viewport.rows, "viewport resized");
        self.viewport = viewport;
    }

    pub fn indicator(&self) -> &str {
        &self.indicator
    }

    /// Shows `notice` next to the page indicator until the next page is drawn.
    pub fn set_notice(&mut self, notice: Option<String>) -> Result<()> {
        self.notice = notice;
        self.write_status()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.renderer.clear_all()
    }

    pub fn draw_image(&mut self, image: &RenderImage) -> Result<()> {
        let columns = u32::from(self.viewport.columns);
        let rows = u32::from(self.viewport.image_rows());
        self.renderer.clear_all()?;
        self.renderer.draw(image, DrawParams::clamped(columns, rows))?;
        self.notice = None;
        Ok(())
    }

    pub fn status_line(&self) -> String {
        match &self.notice {
            Some(notice) if !self.indicator.is_empty() => {
                format!("{} | {}", self.indicator, notice)
            }
            Some(notice) => notice.clone(),
            None => self.indicator.clone(),
        }
    }

    pub fn write_status(&mut self) -> Result<()> {
        let row = self.viewport.rows.saturating_sub(1);
        let line = truncate_to_width(&self.status_line(), usize::from(self.viewport.columns));
        let writer = self.renderer.writer();
        crossterm::execute!(writer, cursor::MoveTo(0, row), Clear(ClearType::CurrentLine))?;
        write_status_line(writer, &line)?;
        Ok(())
    }

    /// Draws `lines` as a reverse-video box centred over the page.
    pub fn draw_overlay(&mut self, lines: &[String]) -> Result<()> {
        let width = lines.iter().map(|line| line.chars().count()).max().unwrap_or(0);
        let start_col = usize::from(self.viewport.columns).saturating_sub(width) / 2;
        let start_row =
            usize::from(self.viewport.image_rows()).saturating_sub(lines.len()) / 2;
        let writer = self.renderer.writer();
        for (offset, line) in lines.iter().enumerate() {
            crossterm::execute!(
                writer,
                cursor::MoveTo(start_col as u16, (start_row + offset) as u16),
                SetAttribute(Attribute::Reverse),
                Print(line),
                SetAttribute(Attribute::Reset)
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.renderer.writer
    }
}

/// Cloneable handle so the render worker and the event loop share one view.
pub struct SharedView<W: Write>(Arc<Mutex<TerminalView<W>>>);

impl<W: Write> SharedView<W> {
    pub fn new(view: TerminalView<W>) -> Self {
        Self(Arc::new(Mutex::new(view)))
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, TerminalView<W>> {
        self.0.lock()
    }
}

impl<W: Write> Clone for SharedView<W> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<W: Write + Send> Surface for SharedView<W> {
    fn draw_page(&mut self, image: &RenderImage) -> Result<()> {
        self.0.lock().draw_image(image)
    }

    fn show_page_indicator(&mut self, page: usize, total: usize) -> Result<()> {
        let mut view = self.0.lock();
        view.indicator = page_indicator(page, total);
        view.write_status()
    }
}

fn truncate_to_width(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_owned();
    }
    if width <= 3 {
        return text.chars().take(width).collect();
    }
    let mut truncated: String = text.chars().take(width - 3).collect();
    truncated.push_str("...");
    truncated
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
