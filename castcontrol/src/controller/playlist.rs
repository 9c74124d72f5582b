//! The server-side playlist and its cursor.
//!
//! The renderer only ever knows one URI (plus one queued next); this list
//! is the real playlist. The cursor is -1 exactly when the list is empty
//! or playback was stopped; otherwise it indexes the playing item.

use crate::model::MediaKind;

/// One playable entry, fully prepared for the renderer.
#[derive(Clone, Debug)]
pub struct PlaylistItem {
    pub item_id: String,
    pub name: String,
    /// Absent when the stream builder could not route the item.
    pub stream_url: Option<String>,
    /// DIDL-Lite metadata document.
    pub metadata: String,
    pub content_features: String,
    pub media_type: MediaKind,
    pub start_position_ticks: i64,
    pub is_direct_stream: bool,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub run_time_ticks: Option<i64>,
}

#[derive(Default)]
pub struct Playlist {
    items: Vec<PlaylistItem>,
    cursor: isize,
}

impl Playlist {
    pub fn new() -> Self {
        Playlist {
            items: Vec::new(),
            cursor: -1,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cursor(&self) -> isize {
        self.cursor
    }

    pub fn current(&self) -> Option<&PlaylistItem> {
        if self.cursor < 0 {
            return None;
        }
        self.items.get(self.cursor as usize)
    }

    pub fn item(&self, index: usize) -> Option<&PlaylistItem> {
        self.items.get(index)
    }

    /// Move the cursor; false when `index` is outside [0, len).
    pub fn set_cursor(&mut self, index: isize) -> bool {
        if index >= 0 && (index as usize) < self.items.len() {
            self.cursor = index;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = -1;
    }

    pub fn replace(&mut self, items: Vec<PlaylistItem>) {
        self.items = items;
        self.cursor = -1;
    }

    pub fn append(&mut self, items: Vec<PlaylistItem>) {
        self.items.extend(items);
    }

    /// Insert so the new items play right after the current one; with no
    /// current item they go to the end.
    pub fn insert_next(&mut self, items: Vec<PlaylistItem>) {
        let insert_pos = if self.cursor < 0 {
            self.items.len()
        } else {
            ((self.cursor + 1) as usize).min(self.items.len())
        };
        for (offset, item) in items.into_iter().enumerate() {
            self.items.insert(insert_pos + offset, item);
        }
    }

    pub fn replace_at(&mut self, index: usize, item: PlaylistItem) {
        if index < self.items.len() {
            self.items[index] = item;
        }
    }

    pub fn shuffle(&mut self) {
        crate::controller::shuffle::shuffle(&mut self.items);
    }

    /// The cursor invariant: -1, or a valid index.
    pub fn cursor_in_bounds(&self) -> bool {
        self.cursor == -1 || (self.cursor >= 0 && (self.cursor as usize) < self.items.len())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn item(id: &str, url: &str, media_type: MediaKind) -> PlaylistItem {
        PlaylistItem {
            item_id: id.to_string(),
            name: format!("Item {id}"),
            stream_url: Some(url.to_string()),
            metadata: String::new(),
            content_features: String::new(),
            media_type,
            start_position_ticks: 0,
            is_direct_stream: true,
            audio_stream_index: None,
            subtitle_stream_index: None,
            run_time_ticks: None,
        }
    }
}
