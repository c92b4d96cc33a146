pub mod depot;
pub mod forum;
pub mod logger;
pub mod records;
pub mod settings;
pub mod storage;
pub mod types;
pub mod ui_state;
pub mod uploader;
pub mod utils;

pub use depot::Depot;
pub use records::RecordStore;
pub use settings::{Settings, SettingsPatch, SettingsStore};
pub use storage::{KeyValueStore, MemoryStore, Outcome, PersistentStores, StoreStatus};
pub use types::{AvatarRecord, CategoryFilter, RecordDraft, RecordPatch, Snapshot, Tab};
pub use ui_state::{DraftCategory, ScrollDebouncer, UiSnapshot, UiStateMirror};
pub use uploader::{ImageHost, ImgbbClient, UploadedImage};
