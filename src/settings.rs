use crate::storage::{KeyValueStore, Outcome, StoreStatus, decode_stored_string};
use crate::types::DEFAULT_CATEGORY;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

pub const SECRET_KEY: &str = "imgbbKey";
pub const THEME_KEY: &str = "theme";
pub const CATEGORIES_KEY: &str = "categories";
pub const DEFAULT_THEME: &str = "default";

/// Keys that may reach the synced partition. The secret is deliberately absent.
const SYNC_KEYS: [&str; 2] = [THEME_KEY, CATEGORIES_KEY];

/// Merged view: synced fields with the local secret overlaid.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imgbb_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    pub categories: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    fn from_parts(mut fields: Map<String, Value>, imgbb_key: Option<String>) -> Self {
        let theme = fields
            .remove(THEME_KEY)
            .and_then(|value| value.as_str().map(str::to_string));
        let categories = fields
            .remove(CATEGORIES_KEY)
            .and_then(|value| serde_json::from_value::<Vec<String>>(value).ok())
            .map(normalize_categories)
            .unwrap_or_else(default_categories);
        fields.remove(SECRET_KEY);

        Self {
            imgbb_key,
            theme,
            categories,
            extra: fields,
        }
    }

    pub fn theme_or_default(&self) -> &str {
        self.theme.as_deref().unwrap_or(DEFAULT_THEME)
    }
}

/// Partial update. The outer `Option` of `imgbb_key` tells whether the patch
/// touches the secret at all; `Some(None)` (a JSON `null`) and `Some(Some(""))`
/// both clear it. Keys in `extra` are echoed back by [`SettingsStore::set`] but
/// never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_field"
    )]
    pub imgbb_key: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Maps a present field, `null` included, to `Some`; `default` covers absence.
fn present_field<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl SettingsPatch {
    pub fn secret(secret: impl Into<String>) -> Self {
        Self {
            imgbb_key: Some(Some(secret.into())),
            ..Default::default()
        }
    }

    fn into_fields(self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        }
    }
}

pub fn default_categories() -> Vec<String> {
    vec![DEFAULT_CATEGORY.to_string()]
}

/// Drops blank names and later duplicates, keeping first-seen order.
pub fn normalize_categories(categories: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    categories
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}

pub struct SettingsStore<S: KeyValueStore, L: KeyValueStore> {
    synced: S,
    local: L,
}

impl<S: KeyValueStore, L: KeyValueStore> SettingsStore<S, L> {
    pub fn new(synced: S, local: L) -> Self {
        Self { synced, local }
    }

    /// Raw contents of the synced partition, decoded per key.
    pub fn synced_snapshot(&self) -> Outcome<Map<String, Value>> {
        match self.read_synced() {
            Ok(fields) => Outcome::clean(fields),
            Err(err) => {
                crate::debug_log!("[settings] read synced failed: {:#}", err);
                Outcome::with_status(Map::new(), StoreStatus::degraded(format!("{err:#}")))
            }
        }
    }

    fn read_synced(&self) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        for (key, raw) in self.synced.entries()? {
            match serde_json::from_slice::<Value>(&raw) {
                Ok(value) => {
                    fields.insert(key, value);
                }
                Err(err) => {
                    crate::debug_log!("[settings] skip undecodable key {}: {}", key, err);
                }
            }
        }
        Ok(fields)
    }

    fn read_local_secret(&self) -> Result<Option<String>> {
        Ok(decode_stored_string(self.local.get(SECRET_KEY)?))
    }

    fn write_local_secret(&self, secret: &str) -> Result<()> {
        if secret.is_empty() {
            self.local.remove(SECRET_KEY)?;
        } else {
            self.local.insert(SECRET_KEY, secret.as_bytes())?;
        }
        self.local.flush()
    }

    fn write_synced(&self, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_vec(value).with_context(|| format!("encode {key}"))?;
        self.synced.insert(key, &raw)?;
        self.synced.flush()
    }

    /// Moves a secret left in the synced partition by older builds into the
    /// local one. A secret already stored locally wins.
    fn migrate_legacy_secret(&self, legacy: &Value) -> Result<()> {
        if let Some(secret) = legacy.as_str().filter(|secret| !secret.is_empty())
            && self.read_local_secret()?.is_none()
        {
            self.write_local_secret(secret)?;
        }
        self.synced.remove(SECRET_KEY)?;
        self.synced.flush()
    }

    /// Never fails; storage faults fall back to defaults and show up in the
    /// returned status.
    pub fn get(&self) -> Outcome<Settings> {
        let Outcome {
            value: mut fields,
            mut status,
        } = self.synced_snapshot();

        let legacy_secret = fields.remove(SECRET_KEY);
        if let Some(legacy) = legacy_secret.as_ref() {
            crate::debug_log!("[settings] migrating legacy secret out of synced partition");
            let migrated = self.migrate_legacy_secret(legacy);
            if let Err(err) = migrated.as_ref() {
                crate::debug_log!("[settings] legacy secret migration failed: {:#}", err);
            }
            status = status.merge(StoreStatus::from_result(&migrated));
        }

        let local_secret = match self.read_local_secret() {
            Ok(secret) => secret,
            Err(err) => {
                crate::debug_log!("[settings] read local secret failed: {:#}", err);
                status = status.merge(StoreStatus::degraded(format!("{err:#}")));
                None
            }
        };
        let secret = local_secret.or_else(|| {
            legacy_secret
                .as_ref()
                .and_then(Value::as_str)
                .filter(|secret| !secret.is_empty())
                .map(str::to_string)
        });

        Outcome::with_status(Settings::from_parts(fields, secret), status)
    }

    /// Routes the secret to the local partition, persists allow-listed keys to
    /// the synced partition and returns the merged view for this call.
    pub fn set(&self, patch: SettingsPatch) -> Outcome<Settings> {
        let Outcome {
            value: current,
            mut status,
        } = self.get();

        let mut secret = current.imgbb_key.clone();
        let mut merged = current.extra;
        if let Some(theme) = current.theme {
            merged.insert(THEME_KEY.to_string(), Value::from(theme));
        }
        merged.insert(
            CATEGORIES_KEY.to_string(),
            Value::from(current.categories),
        );

        let mut fields = patch.into_fields();
        if let Some(next_secret) = fields.remove(SECRET_KEY) {
            let next_secret = next_secret.as_str().unwrap_or_default().to_string();
            let written = self.write_local_secret(&next_secret);
            if let Err(err) = written.as_ref() {
                crate::debug_log!("[settings] write local secret failed: {:#}", err);
            }
            status = status.merge(StoreStatus::from_result(&written));
            secret = (!next_secret.is_empty()).then_some(next_secret);
        }

        for (key, mut value) in fields {
            if key == CATEGORIES_KEY
                && let Ok(categories) = serde_json::from_value::<Vec<String>>(value.clone())
            {
                value = Value::from(normalize_categories(categories));
            }

            if SYNC_KEYS.contains(&key.as_str()) {
                let written = self.write_synced(&key, &value);
                if let Err(err) = written.as_ref() {
                    crate::debug_log!("[settings] write synced {} failed: {:#}", key, err);
                }
                status = status.merge(StoreStatus::from_result(&written));
            } else {
                crate::debug_log!("[settings] key {} is not synced, kept in memory only", key);
            }
            merged.insert(key, value);
        }

        Outcome::with_status(Settings::from_parts(merged, secret), status)
    }

    pub fn api_key(&self) -> Option<String> {
        self.get()
            .value
            .imgbb_key
            .filter(|key| !key.trim().is_empty())
    }

    /// Persists the default list the first time categories are read. When the
    /// synced partition cannot be read, the defaults are returned unpersisted
    /// so a stored list is never overwritten.
    pub fn ensure_categories(&self) -> Outcome<Vec<String>> {
        let snapshot = self.synced_snapshot();
        if snapshot.status.is_degraded() || snapshot.value.contains_key(CATEGORIES_KEY) {
            let settings = self.get();
            return Outcome::with_status(
                settings.value.categories,
                snapshot.status.merge(settings.status),
            );
        }

        let updated = self.set(SettingsPatch {
            categories: Some(default_categories()),
            ..Default::default()
        });
        Outcome::with_status(
            updated.value.categories,
            snapshot.status.merge(updated.status),
        )
    }

    /// Appends a trimmed, non-blank name unless it is already listed.
    pub fn add_category(&self, name: &str) -> Outcome<Vec<String>> {
        let current = self.ensure_categories();
        let name = name.trim();
        if current.status.is_degraded() {
            crate::debug_log!("[settings] category list unreadable, not adding {}", name);
            return current;
        }
        if name.is_empty() || current.value.iter().any(|existing| existing == name) {
            return current;
        }

        let mut categories = current.value;
        categories.push(name.to_string());
        let updated = self.set(SettingsPatch {
            categories: Some(categories),
            ..Default::default()
        });
        Outcome::with_status(updated.value.categories, current.status.merge(updated.status))
    }
}
