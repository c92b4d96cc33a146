use serde::{Deserialize, Serialize};

pub const DEFAULT_CATEGORY: &str = "Default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarRecord {
    pub id: u64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub thumb: String,
    #[serde(default)]
    pub delete_url: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub forum: String,
}

impl AvatarRecord {
    /// Thumbnail to show in the library grid; older records may lack one.
    pub fn display_thumb(&self) -> &str {
        if self.thumb.is_empty() {
            &self.url
        } else {
            &self.thumb
        }
    }
}

/// Fields of a record before the store assigns its id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDraft {
    pub category: Option<String>,
    pub url: String,
    pub thumb: Option<String>,
    pub delete_url: String,
    pub time: i64,
    pub forum: Option<String>,
}

/// Shallow patch; `None` leaves the field untouched. The id is never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub category: Option<String>,
    pub url: Option<String>,
    pub thumb: Option<String>,
    pub delete_url: Option<String>,
    pub time: Option<i64>,
    pub forum: Option<String>,
}

impl RecordPatch {
    pub(crate) fn apply(self, record: &mut AvatarRecord) {
        if let Some(category) = self.category {
            record.category = category;
        }
        if let Some(url) = self.url {
            record.url = url;
        }
        if let Some(thumb) = self.thumb {
            record.thumb = thumb;
        }
        if let Some(delete_url) = self.delete_url {
            record.delete_url = delete_url;
        }
        if let Some(time) = self.time {
            record.time = time;
        }
        if let Some(forum) = self.forum {
            record.forum = forum;
        }
    }
}

/// Export/backup document: `{ "records": [...], "counter": n }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<AvatarRecord>,
    #[serde(default)]
    pub counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryFilter {
    All,
    Category(String),
}

impl CategoryFilter {
    pub const ALL_VALUE: &'static str = "ALL";

    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == Self::ALL_VALUE {
            Self::All
        } else {
            Self::Category(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::All => Self::ALL_VALUE,
            Self::Category(name) => name,
        }
    }

    pub fn matches(&self, record: &AvatarRecord) -> bool {
        match self {
            Self::All => true,
            Self::Category(name) => record.category == *name,
        }
    }
}

impl Default for CategoryFilter {
    fn default() -> Self {
        Self::All
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Tab {
    Upload,
    Library,
    Settings,
}

impl Tab {
    pub const ALL: [Tab; 3] = [Tab::Upload, Tab::Library, Tab::Settings];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Library => "library",
            Self::Settings => "settings",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tab| tab.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl Default for Tab {
    fn default() -> Self {
        Self::Upload
    }
}
