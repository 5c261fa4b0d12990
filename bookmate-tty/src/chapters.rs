use std::sync::Arc;

use bookmate_core::{ChapterControl, ChapterMarker, MarkerId};
use parking_lot::Mutex;

const PLACEHOLDER: &str = "Go to Chapter";
const EMPTY_MESSAGE: &str = "No chapters detected";
const TITLE: &str = "Chapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorOption {
    pub value: Option<MarkerId>,
    pub label: String,
    pub disabled: bool,
}

/// Drop-down style chapter list: a placeholder entry followed by one entry
/// per chapter marker.
#[derive(Debug, Clone)]
pub struct ChapterSelector {
    options: Vec<SelectorOption>,
    selected: Option<MarkerId>,
    cursor: usize,
    scroll_offset: usize,
}

impl Default for ChapterSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChapterSelector {
    pub fn new() -> Self {
        let mut selector = Self {
            options: Vec::new(),
            selected: None,
            cursor: 0,
            scroll_offset: 0,
        };
        selector.populate(&[]);
        selector
    }

    pub fn options(&self) -> &[SelectorOption] {
        &self.options
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Puts the cursor on the selected chapter, or the placeholder.
    pub fn open(&mut self) {
        self.cursor = self
            .options
            .iter()
            .position(|option| option.value.is_some() && option.value == self.selected)
            .unwrap_or(0);
        self.scroll_offset = 0;
    }

    /// Moves the cursor, skipping disabled entries. Returns whether it moved.
    pub fn move_cursor(&mut self, delta: isize) -> bool {
        let last = self.options.len() as isize - 1;
        let mut position = self.cursor as isize;
        let mut remaining = delta.unsigned_abs();
        let mut landed = None;
        while remaining > 0 {
            let candidate = position + delta.signum();
            if candidate < 0 || candidate > last {
                break;
            }
            position = candidate;
            if !self.options[position as usize].disabled {
                landed = Some(position as usize);
                remaining -= 1;
            }
        }
        match landed {
            Some(target) if target != self.cursor => {
                self.cursor = target;
                true
            }
            _ => false,
        }
    }

    /// The chapter under the cursor, if it is a real chapter.
    pub fn activate(&self) -> Option<MarkerId> {
        self.options
            .get(self.cursor)
            .filter(|option| !option.disabled)
            .and_then(|option| option.value)
    }

    /// Box-drawn lines for the overlay, at most `max_rows` tall and
    /// `max_width` wide.
    pub fn overlay_lines(&mut self, max_width: usize, max_rows: usize) -> Vec<String> {
        if max_width < 12 || max_rows < 5 {
            return Vec::new();
        }
        let inner_width = self
            .options
            .iter()
            .map(|option| option.label.chars().count() + 2)
            .max()
            .unwrap_or(0)
            .max(TITLE.len())
            .min(max_width - 2);
        let content_rows = self.options.len().min(max_rows - 4).max(1);
        self.ensure_visible(content_rows);

        let border = format!("+{}+", "-".repeat(inner_width));
        let mut lines = Vec::with_capacity(content_rows + 4);
        lines.push(border.clone());
        lines.push(format!("|{: ^inner_width$}|", TITLE, inner_width = inner_width));
        lines.push(format!("|{}|", "-".repeat(inner_width)));
        let end = (self.scroll_offset + content_rows).min(self.options.len());
        for idx in self.scroll_offset..end {
            let option = &self.options[idx];
            let marker = if idx == self.cursor { '>' } else { ' ' };
            let text = fit(&format!("{} {}", marker, option.label), inner_width);
            lines.push(format!("|{}|", text));
        }
        lines.push(border);
        lines
    }

    fn ensure_visible(&mut self, rows: usize) {
        let max_offset = self.options.len().saturating_sub(rows);
        if self.cursor < self.scroll_offset {
            self.scroll_offset = self.cursor;
        } else if self.cursor >= self.scroll_offset + rows {
            self.scroll_offset = self.cursor + 1 - rows;
        }
        self.scroll_offset = self.scroll_offset.min(max_offset);
    }
}

impl ChapterControl for ChapterSelector {
    fn populate(&mut self, markers: &[ChapterMarker]) {
        self.options.clear();
        self.options.push(SelectorOption {
            value: None,
            label: PLACEHOLDER.to_owned(),
            disabled: false,
        });
        if markers.is_empty() {
            self.options.push(SelectorOption {
                value: None,
                label: EMPTY_MESSAGE.to_owned(),
                disabled: true,
            });
        }
        for marker in markers {
            self.options.push(SelectorOption {
                value: Some(marker.id),
                label: format!("{} (p{})", marker.label, marker.start_page),
                disabled: false,
            });
        }
        self.selected = None;
        self.cursor = 0;
        self.scroll_offset = 0;
    }

    fn selected(&self) -> Option<MarkerId> {
        self.selected
    }

    fn select(&mut self, value: Option<MarkerId>) {
        self.selected = value;
    }
}

fn fit(text: &str, width: usize) -> String {
    let count = text.chars().count();
    if count > width {
        if width <= 3 {
            return text.chars().take(width).collect();
        }
        let mut truncated: String = text.chars().take(width - 3).collect();
        truncated.push_str("...");
        return truncated;
    }
    format!("{}{}", text, " ".repeat(width - count))
}

/// Cloneable handle to one selector, shared between the render worker that
/// syncs it and the event loop that displays it.
#[derive(Clone, Default)]
pub struct SharedChapterSelector(Arc<Mutex<ChapterSelector>>);

impl SharedChapterSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, ChapterSelector> {
        self.0.lock()
    }
}

impl ChapterControl for SharedChapterSelector {
    fn populate(&mut self, markers: &[ChapterMarker]) {
        self.0.lock().populate(markers);
    }

    fn selected(&self) -> Option<MarkerId> {
        self.0.lock().selected()
    }

    fn select(&mut self, value: Option<MarkerId>) {
        self.0.lock().select(value);
    }
}
