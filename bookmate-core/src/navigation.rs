use crate::{ChapterMarker, MarkerId};

/// A selector listing the chapters of the open document.
pub trait ChapterControl: Send {
    /// Replaces the listed chapters. The selection is reset to none.
    fn populate(&mut self, markers: &[ChapterMarker]);
    fn selected(&self) -> Option<MarkerId>;
    fn select(&mut self, value: Option<MarkerId>);
}

/// Sorts resolved `(start_page, label)` pairs and assigns marker ids.
///
/// The sort is stable, so entries sharing a start page keep their outline order.
pub fn build_markers(mut entries: Vec<(usize, String)>) -> Vec<ChapterMarker> {
    entries.sort_by_key(|(start_page, _)| *start_page);
    entries
        .into_iter()
        .enumerate()
        .map(|(idx, (start_page, label))| ChapterMarker {
            id: MarkerId(idx),
            start_page,
            label,
        })
        .collect()
}

/// The marker with the greatest start page not after `page`.
///
/// `markers` must be sorted by start page. On ties the later marker wins.
pub fn current_marker(markers: &[ChapterMarker], page: usize) -> Option<&ChapterMarker> {
    let mut active = None;
    for marker in markers {
        if marker.start_page <= page {
            active = Some(marker);
        } else {
            break;
        }
    }
    active
}

pub fn reflect_in_control(control: &mut dyn ChapterControl, marker: Option<&ChapterMarker>) {
    let value = marker.map(|m| m.id);
    if control.selected() != value {
        control.select(value);
    }
}
