use crate::forum;
use crate::records::RecordStore;
use crate::settings::{Settings, SettingsPatch, SettingsStore};
use crate::storage::{KeyValueStore, Outcome, PersistentStores, StoreStatus};
use crate::types::{AvatarRecord, CategoryFilter, RecordDraft, RecordPatch, Tab};
use crate::ui_state::{DraftCategory, ScrollDebouncer, UiSnapshot, UiStateMirror};
use crate::uploader::ImageHost;
use crate::utils::{encode_png, now_unix_millis};
use anyhow::{Result, bail};
use std::time::Instant;

const NO_IMAGE_MESSAGE: &str = "No image.";
const MISSING_KEY_MESSAGE: &str = "Set API key first.";
const NO_SELECTION_MESSAGE: &str = "Select an avatar first.";

/// The popup's user flows over the three stores and the image host.
///
/// Uploads are not guarded against re-entry and cannot be cancelled once
/// started; a second upload simply runs after the first returns.
pub struct Depot<B: KeyValueStore, H: ImageHost> {
    settings: SettingsStore<B, B>,
    records: RecordStore<B>,
    ui: UiStateMirror<B>,
    scroll: ScrollDebouncer,
    host: H,
    selected: Option<u64>,
    active_tab: Tab,
}

impl<B: KeyValueStore, H: ImageHost> Depot<B, H> {
    /// Loads records and restores the last tab and selection. A remembered
    /// selection whose record is gone is dropped.
    pub fn open(stores: PersistentStores<B>, host: H) -> Self {
        let settings = SettingsStore::new(stores.settings_sync, stores.settings_local);
        let records = RecordStore::open(stores.records);
        let ui = UiStateMirror::new(stores.ui_state);

        let active_tab = ui.active_tab();
        let remembered = ui.selected();
        let selected = remembered.filter(|id| records.get(*id).is_some());
        if remembered.is_some() && selected.is_none() {
            ui.save_selected(None);
            ui.clear_preview();
        }
        crate::debug_log!(
            "[depot] open records={} tab={} selected={:?}",
            records.len(),
            active_tab.as_str(),
            selected
        );

        Self {
            settings,
            records,
            ui,
            scroll: ScrollDebouncer::default(),
            host,
            selected,
            active_tab,
        }
    }

    pub fn records(&self) -> &RecordStore<B> {
        &self.records
    }

    pub fn ui(&self) -> &UiStateMirror<B> {
        &self.ui
    }

    pub fn restore_ui(&self) -> UiSnapshot {
        self.ui.restore()
    }

    pub fn settings(&self) -> Outcome<Settings> {
        self.settings.get()
    }

    pub fn update_settings(&self, patch: SettingsPatch) -> Outcome<Settings> {
        self.settings.set(patch)
    }

    pub fn categories(&self) -> Outcome<Vec<String>> {
        self.settings.ensure_categories()
    }

    pub fn add_category(&self, name: &str) -> Outcome<Vec<String>> {
        self.settings.add_category(name)
    }

    fn require_api_key(&self) -> Result<String> {
        match self.settings.api_key() {
            Some(key) => Ok(key),
            None => bail!(MISSING_KEY_MESSAGE),
        }
    }

    fn prepare_png(image_bytes: &[u8]) -> Result<Vec<u8>> {
        if image_bytes.is_empty() {
            bail!(NO_IMAGE_MESSAGE);
        }
        encode_png(image_bytes)
    }

    /// Uploads a new avatar and selects it. Host failures propagate with the
    /// host's message and leave the store untouched.
    pub fn upload(&mut self, image_bytes: &[u8], category: Option<&str>) -> Result<AvatarRecord> {
        let png = Self::prepare_png(image_bytes)?;
        let api_key = self.require_api_key()?;

        let uploaded = self.host.upload(&api_key, &png).inspect_err(|err| {
            crate::debug_log!("[upload] failed: {:#}", err);
        })?;

        let record = self.records.add(RecordDraft {
            category: category.map(str::to_string),
            forum: Some(forum::image_embed(&uploaded.display_url)),
            url: uploaded.display_url,
            thumb: Some(uploaded.thumb_url),
            delete_url: uploaded.delete_url,
            time: now_unix_millis(),
        });
        crate::debug_log!("[upload] stored id={} category={}", record.id, record.category);

        self.set_selected(Some(record.id));
        self.ui.save_preview(&png);
        Ok(record)
    }

    /// Re-uploads the image behind an existing record. Id, category and
    /// deletion token are kept.
    pub fn replace(&mut self, id: u64, image_bytes: &[u8]) -> Result<AvatarRecord> {
        if self.records.get(id).is_none() {
            bail!(NO_SELECTION_MESSAGE);
        }
        let png = Self::prepare_png(image_bytes)?;
        let api_key = self.require_api_key()?;

        let uploaded = self.host.upload(&api_key, &png).inspect_err(|err| {
            crate::debug_log!("[upload] replace id={} failed: {:#}", id, err);
        })?;

        let patch = RecordPatch {
            forum: Some(forum::image_embed(&uploaded.display_url)),
            url: Some(uploaded.display_url),
            thumb: Some(uploaded.thumb_url),
            time: Some(now_unix_millis()),
            ..Default::default()
        };
        let Some(record) = self.records.update(id, patch) else {
            bail!(NO_SELECTION_MESSAGE);
        };

        self.ui.save_preview(&png);
        Ok(record)
    }

    fn set_selected(&mut self, id: Option<u64>) -> StoreStatus {
        self.selected = id;
        self.ui.save_selected(id)
    }

    pub fn select(&mut self, id: u64) -> Option<AvatarRecord> {
        let record = self.records.get(id)?;
        self.set_selected(Some(id));
        Some(record)
    }

    pub fn selected(&self) -> Option<AvatarRecord> {
        self.selected.and_then(|id| self.records.get(id))
    }

    /// Removes the record; returns whether it existed. Clears the selection
    /// and preview when they belonged to it.
    pub fn delete(&mut self, id: u64) -> bool {
        let existed = self.records.get(id).is_some();
        self.records.remove(id);
        if self.selected == Some(id) {
            self.set_selected(None);
            self.ui.clear_preview();
        }
        existed
    }

    pub fn copy_link(&self, id: u64) -> Option<String> {
        self.records.get(id).map(|record| record.forum)
    }

    /// Records matching the filter, newest first.
    pub fn library(&self, filter: &CategoryFilter) -> Vec<AvatarRecord> {
        let mut records = self
            .records
            .all()
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect::<Vec<_>>();
        records.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.id.cmp(&a.id)));
        records
    }

    pub fn filter_options(&self) -> Vec<String> {
        self.records.categories()
    }

    pub fn set_filter(&self, filter: &CategoryFilter) -> StoreStatus {
        self.ui.save_filter(filter)
    }

    pub fn active_tab(&self) -> Tab {
        self.active_tab
    }

    pub fn switch_tab(&mut self, tab: Tab) -> StoreStatus {
        self.active_tab = tab;
        self.ui.save_active_tab(tab)
    }

    pub fn record_scroll(&mut self, tab: Tab, offset: f32, now: Instant) {
        self.scroll.record(tab, offset, now);
    }

    pub fn tick(&mut self, now: Instant) -> StoreStatus {
        self.scroll.tick(now, &self.ui)
    }

    pub fn save_draft_category(&self, draft: &DraftCategory) -> StoreStatus {
        self.ui.save_draft_category(draft)
    }

    /// Writes whatever is still pending before the process goes away.
    pub fn close(&mut self) -> StoreStatus {
        self.scroll.flush(&self.ui)
    }

    pub fn export_json(&self) -> Result<String> {
        self.records.export_json()
    }

    /// Imports an export file. A selection pointing at a record that did not
    /// survive the import is cleared.
    pub fn import_json(&mut self, raw: &str) -> bool {
        if !self.records.import_json(raw) {
            return false;
        }
        if let Some(id) = self.selected
            && self.records.get(id).is_none()
        {
            self.set_selected(None);
            self.ui.clear_preview();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::uploader::UploadedImage;
    use crate::utils::sample_png;
    use anyhow::anyhow;
    use std::cell::{Cell, RefCell};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeHost {
        uploads: Cell<u32>,
        keys: RefCell<Vec<String>>,
        fail_with: Option<&'static str>,
    }

    impl ImageHost for FakeHost {
        fn upload(&self, api_key: &str, png: &[u8]) -> Result<UploadedImage> {
            assert_eq!(image::guess_format(png).unwrap(), image::ImageFormat::Png);
            self.keys.borrow_mut().push(api_key.to_string());
            if let Some(message) = self.fail_with {
                return Err(anyhow!(message));
            }
            let n = self.uploads.get() + 1;
            self.uploads.set(n);
            Ok(UploadedImage {
                display_url: format!("https://i.ibb.co/{n}/avatar.png"),
                thumb_url: format!("https://i.ibb.co/{n}/avatar_t.png"),
                delete_url: format!("https://ibb.co/{n}/delete"),
            })
        }
    }

    type TestDepot = Depot<Arc<MemoryStore>, FakeHost>;

    fn depot_with_key(host: FakeHost) -> (PersistentStores<Arc<MemoryStore>>, TestDepot) {
        let stores = PersistentStores::in_memory();
        let depot = Depot::open(stores.clone(), host);
        depot.update_settings(SettingsPatch::secret("secret"));
        (stores, depot)
    }

    #[test]
    fn upload_requires_api_key() {
        let mut depot = Depot::open(PersistentStores::in_memory(), FakeHost::default());
        let err = depot.upload(&sample_png(2, 2), Some("Pets")).unwrap_err();
        assert_eq!(err.to_string(), MISSING_KEY_MESSAGE);
        assert!(depot.records().is_empty());
    }

    #[test]
    fn upload_rejects_empty_and_corrupt_images() {
        let (_, mut depot) = depot_with_key(FakeHost::default());
        assert_eq!(
            depot.upload(&[], None).unwrap_err().to_string(),
            NO_IMAGE_MESSAGE
        );
        assert!(depot.upload(b"GIF89a garbage", None).is_err());
        assert!(depot.records().is_empty());
    }

    #[test]
    fn upload_stores_and_selects_record() {
        let (stores, mut depot) = depot_with_key(FakeHost::default());
        let png = sample_png(4, 4);

        let record = depot.upload(&png, Some("Pets")).unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.category, "Pets");
        assert_eq!(record.url, "https://i.ibb.co/1/avatar.png");
        assert_eq!(record.thumb, "https://i.ibb.co/1/avatar_t.png");
        assert_eq!(record.forum, "[img]https://i.ibb.co/1/avatar.png[/img]");
        assert!(record.time > 0);

        assert_eq!(depot.selected(), Some(record.clone()));
        assert_eq!(depot.copy_link(1), Some(record.forum.clone()));
        assert_eq!(*depot.host.keys.borrow(), vec!["secret".to_string()]);

        let ui = UiStateMirror::new(stores.ui_state);
        assert_eq!(ui.selected(), Some(1));
        assert!(ui.preview().is_some());
    }

    #[test]
    fn upload_without_category_uses_default() {
        let (_, mut depot) = depot_with_key(FakeHost::default());
        let record = depot.upload(&sample_png(1, 1), None).unwrap();
        assert_eq!(record.category, "Default");
    }

    #[test]
    fn host_failure_surfaces_message_and_stores_nothing() {
        let host = FakeHost {
            fail_with: Some("Invalid API v1 key."),
            ..Default::default()
        };
        let (_, mut depot) = depot_with_key(host);

        let err = depot.upload(&sample_png(2, 2), Some("Pets")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid API v1 key.");
        assert!(depot.records().is_empty());
        assert_eq!(depot.selected(), None);
    }

    #[test]
    fn replace_keeps_identity_fields() {
        let (_, mut depot) = depot_with_key(FakeHost::default());
        let original = depot.upload(&sample_png(2, 2), Some("Pets")).unwrap();

        let replaced = depot.replace(original.id, &sample_png(3, 3)).unwrap();
        assert_eq!(replaced.id, original.id);
        assert_eq!(replaced.category, "Pets");
        assert_eq!(replaced.delete_url, original.delete_url);
        assert_eq!(replaced.url, "https://i.ibb.co/2/avatar.png");
        assert_eq!(replaced.forum, "[img]https://i.ibb.co/2/avatar.png[/img]");
        assert_eq!(depot.records().len(), 1);
    }

    #[test]
    fn replace_unknown_record_fails_before_upload() {
        let (_, mut depot) = depot_with_key(FakeHost::default());
        let err = depot.replace(9, &sample_png(2, 2)).unwrap_err();
        assert_eq!(err.to_string(), NO_SELECTION_MESSAGE);
        assert!(depot.host.keys.borrow().is_empty());
    }

    #[test]
    fn delete_clears_matching_selection() {
        let (stores, mut depot) = depot_with_key(FakeHost::default());
        let first = depot.upload(&sample_png(2, 2), Some("Pets")).unwrap();
        let second = depot.upload(&sample_png(2, 2), Some("Games")).unwrap();

        assert!(depot.select(first.id).is_some());
        assert!(depot.delete(second.id));
        assert_eq!(depot.selected().map(|r| r.id), Some(first.id));

        assert!(depot.delete(first.id));
        assert_eq!(depot.selected(), None);
        assert!(!depot.delete(first.id));

        let ui = UiStateMirror::new(stores.ui_state);
        assert_eq!(ui.selected(), None);
        assert_eq!(ui.preview(), None);
    }

    #[test]
    fn library_filters_and_sorts_newest_first() {
        let (_, mut depot) = depot_with_key(FakeHost::default());
        for category in ["Pets", "Games", "Pets"] {
            depot.upload(&sample_png(1, 1), Some(category)).unwrap();
        }

        let all = depot.library(&CategoryFilter::All);
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|pair| pair[0].time >= pair[1].time));
        assert_eq!(all[0].id, 3);

        let pets = depot.library(&CategoryFilter::Category("Pets".into()));
        assert_eq!(pets.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(depot.filter_options(), vec!["Pets", "Games"]);
    }

    #[test]
    fn reopen_restores_tab_selection_and_scroll() {
        let (stores, mut depot) = depot_with_key(FakeHost::default());
        let record = depot.upload(&sample_png(2, 2), Some("Pets")).unwrap();
        depot.switch_tab(Tab::Library);
        depot.set_filter(&CategoryFilter::Category("Pets".into()));
        depot.record_scroll(Tab::Library, 140.0, Instant::now());
        depot.close();
        drop(depot);

        let reopened = Depot::open(stores, FakeHost::default());
        assert_eq!(reopened.active_tab(), Tab::Library);
        assert_eq!(reopened.selected(), Some(record));
        let snapshot = reopened.restore_ui();
        assert_eq!(snapshot.scroll_offset(Tab::Library), 140.0);
        assert_eq!(snapshot.filter, CategoryFilter::Category("Pets".into()));
    }

    #[test]
    fn tick_persists_only_after_quiet_window() {
        let (_, mut depot) = depot_with_key(FakeHost::default());
        let start = Instant::now();
        depot.record_scroll(Tab::Library, 10.0, start);
        depot.record_scroll(Tab::Library, 60.0, start + Duration::from_millis(50));

        depot.tick(start + Duration::from_millis(100));
        assert_eq!(depot.ui().scroll_offset(Tab::Library), None);

        depot.tick(start + Duration::from_millis(400));
        assert_eq!(depot.ui().scroll_offset(Tab::Library), Some(60.0));
    }

    #[test]
    fn stale_selection_is_dropped_on_open_and_import() {
        let (stores, mut depot) = depot_with_key(FakeHost::default());
        let record = depot.upload(&sample_png(2, 2), None).unwrap();

        assert!(depot.import_json(r#"{ "records": [], "counter": 4 }"#));
        assert_eq!(depot.selected(), None);
        assert!(!depot.import_json(r#"{ "records": 1 }"#));

        let ui = UiStateMirror::new(stores.ui_state.clone());
        ui.save_selected(Some(record.id));
        let reopened = Depot::open(stores, FakeHost::default());
        assert_eq!(reopened.selected(), None);
        assert_eq!(reopened.restore_ui().selected_id, None);
        assert_eq!(ui.selected(), None);
        assert_eq!(reopened.records().counter(), 4);
    }

    #[test]
    fn export_from_one_depot_imports_into_another() {
        let (_, mut source) = depot_with_key(FakeHost::default());
        source.upload(&sample_png(2, 2), Some("Pets")).unwrap();
        source.upload(&sample_png(2, 2), Some("Games")).unwrap();
        let exported = source.export_json().unwrap();

        let mut target = Depot::open(PersistentStores::in_memory(), FakeHost::default());
        assert!(target.import_json(&exported));
        assert_eq!(target.records().export(), source.records().export());
    }

    #[test]
    fn category_management_goes_through_settings() {
        let (_, depot) = depot_with_key(FakeHost::default());
        assert_eq!(depot.categories().value, vec!["Default"]);
        assert_eq!(depot.add_category("Pets").value, vec!["Default", "Pets"]);
        assert_eq!(depot.settings().value.imgbb_key.as_deref(), Some("secret"));
        assert_eq!(
            depot.save_draft_category(&DraftCategory {
                name: "Ga".into(),
                open: true
            }),
            StoreStatus::Clean
        );
    }
}
