use crate::storage::{
    KeyValueStore, StoreStatus, decode_stored_bool, decode_stored_f32, decode_stored_string,
    decode_stored_u64,
};
use crate::types::{CategoryFilter, Tab};
use crate::utils::{decode_png_data_url, png_data_url};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const SELECTED_ID_KEY: &str = "depot:ui:selectedId";
pub const LAST_TAB_KEY: &str = "depot:ui:lastTab";
pub const FILTER_KEY: &str = "depot:ui:filter";
pub const DRAFT_CATEGORY_KEY: &str = "depot:ui:draftCategory";
pub const DRAFT_CATEGORY_OPEN_KEY: &str = "depot:ui:draftCategoryOpen";
pub const PREVIEW_KEY: &str = "depot:ui:preview";
const SCROLL_KEY_PREFIX: &str = "depot:ui:scroll:";

pub const SCROLL_QUIET_WINDOW: Duration = Duration::from_millis(250);

pub fn scroll_key(tab: Tab) -> String {
    format!("{SCROLL_KEY_PREFIX}{}", tab.as_str())
}

/// Unsaved "new category" input and whether its row is showing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftCategory {
    pub name: String,
    pub open: bool,
}

/// Everything the popup restores on reopen. Each field falls back on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiSnapshot {
    pub selected_id: Option<u64>,
    pub active_tab: Tab,
    pub scroll_offsets: HashMap<Tab, f32>,
    pub filter: CategoryFilter,
    pub draft_category: DraftCategory,
    pub preview_png: Option<Vec<u8>>,
}

impl UiSnapshot {
    pub fn scroll_offset(&self, tab: Tab) -> f32 {
        self.scroll_offsets.get(&tab).copied().unwrap_or(0.0)
    }
}

/// Mirrors transient interface state into fixed keys. Writes are best-effort:
/// a failing backend yields a degraded status instead of an error.
pub struct UiStateMirror<B: KeyValueStore> {
    backend: B,
}

impl<B: KeyValueStore> UiStateMirror<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    fn write(&self, key: &str, value: &[u8]) -> StoreStatus {
        let result = self
            .backend
            .insert(key, value)
            .and_then(|_| self.backend.flush());
        if let Err(err) = result.as_ref() {
            crate::debug_log!("[ui] save {} failed: {:#}", key, err);
        }
        StoreStatus::from_result(&result)
    }

    fn clear(&self, key: &str) -> StoreStatus {
        let result = self.backend.remove(key).and_then(|_| self.backend.flush());
        if let Err(err) = result.as_ref() {
            crate::debug_log!("[ui] clear {} failed: {:#}", key, err);
        }
        StoreStatus::from_result(&result)
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(err) => {
                crate::debug_log!("[ui] load {} failed: {:#}", key, err);
                None
            }
        }
    }

    pub fn save_selected(&self, id: Option<u64>) -> StoreStatus {
        match id {
            Some(id) => self.write(SELECTED_ID_KEY, &id.to_be_bytes()),
            None => self.clear(SELECTED_ID_KEY),
        }
    }

    pub fn selected(&self) -> Option<u64> {
        decode_stored_u64(self.read(SELECTED_ID_KEY))
    }

    pub fn save_active_tab(&self, tab: Tab) -> StoreStatus {
        self.write(LAST_TAB_KEY, tab.as_str().as_bytes())
    }

    /// Unknown or missing values fall back to the upload tab.
    pub fn active_tab(&self) -> Tab {
        decode_stored_string(self.read(LAST_TAB_KEY))
            .and_then(|raw| Tab::parse(&raw))
            .unwrap_or_default()
    }

    pub fn save_scroll_offset(&self, tab: Tab, offset: f32) -> StoreStatus {
        self.write(&scroll_key(tab), &offset.to_be_bytes())
    }

    pub fn scroll_offset(&self, tab: Tab) -> Option<f32> {
        decode_stored_f32(self.read(&scroll_key(tab)))
    }

    pub fn save_filter(&self, filter: &CategoryFilter) -> StoreStatus {
        self.write(FILTER_KEY, filter.as_str().as_bytes())
    }

    pub fn filter(&self) -> CategoryFilter {
        decode_stored_string(self.read(FILTER_KEY))
            .map(|raw| CategoryFilter::parse(&raw))
            .unwrap_or_default()
    }

    pub fn save_draft_category(&self, draft: &DraftCategory) -> StoreStatus {
        let name_status = if draft.name.is_empty() {
            self.clear(DRAFT_CATEGORY_KEY)
        } else {
            self.write(DRAFT_CATEGORY_KEY, draft.name.as_bytes())
        };
        name_status.merge(self.write(DRAFT_CATEGORY_OPEN_KEY, &[u8::from(draft.open)]))
    }

    pub fn draft_category(&self) -> DraftCategory {
        DraftCategory {
            name: decode_stored_string(self.read(DRAFT_CATEGORY_KEY)).unwrap_or_default(),
            open: decode_stored_bool(self.read(DRAFT_CATEGORY_OPEN_KEY), false),
        }
    }

    /// Stores the last rendered preview as a self-contained PNG data URL.
    pub fn save_preview(&self, png: &[u8]) -> StoreStatus {
        self.write(PREVIEW_KEY, png_data_url(png).as_bytes())
    }

    pub fn clear_preview(&self) -> StoreStatus {
        self.clear(PREVIEW_KEY)
    }

    pub fn preview(&self) -> Option<Vec<u8>> {
        decode_stored_string(self.read(PREVIEW_KEY)).and_then(|raw| decode_png_data_url(&raw))
    }

    pub fn restore(&self) -> UiSnapshot {
        let scroll_offsets = Tab::ALL
            .into_iter()
            .filter_map(|tab| self.scroll_offset(tab).map(|offset| (tab, offset)))
            .collect();

        UiSnapshot {
            selected_id: self.selected(),
            active_tab: self.active_tab(),
            scroll_offsets,
            filter: self.filter(),
            draft_category: self.draft_category(),
            preview_png: self.preview(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingScroll {
    offset: f32,
    due: Instant,
}

/// Trailing debounce for scroll offsets, one pending write per tab key.
/// Recording again for the same tab replaces the pending write and restarts
/// its quiet window; a pending write only ever targets its own tab's key.
#[derive(Debug)]
pub struct ScrollDebouncer {
    quiet: Duration,
    pending: HashMap<Tab, PendingScroll>,
}

impl Default for ScrollDebouncer {
    fn default() -> Self {
        Self::new(SCROLL_QUIET_WINDOW)
    }
}

impl ScrollDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    pub fn record(&mut self, tab: Tab, offset: f32, now: Instant) {
        self.pending.insert(
            tab,
            PendingScroll {
                offset,
                due: now + self.quiet,
            },
        );
    }

    pub fn cancel(&mut self, tab: Tab) -> bool {
        self.pending.remove(&tab).is_some()
    }

    pub fn pending_offset(&self, tab: Tab) -> Option<f32> {
        self.pending.get(&tab).map(|pending| pending.offset)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Earliest instant at which [`ScrollDebouncer::tick`] has work to do.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.due).min()
    }

    /// Writes every pending offset whose quiet window has elapsed.
    pub fn tick<B: KeyValueStore>(&mut self, now: Instant, mirror: &UiStateMirror<B>) -> StoreStatus {
        let due_tabs = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.due <= now)
            .map(|(tab, _)| *tab)
            .collect::<Vec<_>>();

        let mut status = StoreStatus::Clean;
        for tab in due_tabs {
            if let Some(pending) = self.pending.remove(&tab) {
                status = status.merge(mirror.save_scroll_offset(tab, pending.offset));
            }
        }
        status
    }

    /// Writes everything still pending, e.g. when the popup closes.
    pub fn flush<B: KeyValueStore>(&mut self, mirror: &UiStateMirror<B>) -> StoreStatus {
        let mut status = StoreStatus::Clean;
        for (tab, pending) in self.pending.drain() {
            status = status.merge(mirror.save_scroll_offset(tab, pending.offset));
        }
        status
    }
}
