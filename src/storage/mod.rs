//! Storage module for saved connection profiles.
//!
//! Profiles are persisted as flat `"<profile name>.<field>"` keys in a
//! [`KeyValueStore`]. The whole map is read on every load; every save or
//! delete rewrites it in one persist.
pub mod kv;

pub use kv::{FileStore, KeyValueStore, KeyValues, MemoryStore};

use crate::core::{ClientError, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_SEPARATOR: &str = ";";

const FIELD_DRIVER: &str = "driver";
const FIELD_URL: &str = "url";
const FIELD_AUTO_LOGIN: &str = "autologin";
const FIELD_USER: &str = "user";
const FIELD_PASSWORD: &str = "password";
const FIELD_SEPARATOR: &str = "separator";
const FIELD_HOTKEY: &str = "hotkey";
const FIELD_ORDER: &str = "order";

/// A named description of how to reach one database.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    /// Identity key, compared case-insensitively.
    pub name: String,
    /// Driver to load before connecting; `None` relies on registered drivers.
    pub driver: Option<String>,
    /// Driver-specific connection locator.
    pub url: String,
    /// When false the password is asked for at connect time.
    pub auto_login: bool,
    pub user: String,
    pub password: Option<String>,
    pub separator: String,
    pub hotkey: Option<char>,
    pub order: Option<i32>,
}

impl ConnectionProfile {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        ConnectionProfile {
            name: name.into(),
            driver: None,
            url: url.into(),
            auto_login: false,
            user: String::new(),
            password: None,
            separator: DEFAULT_SEPARATOR.to_string(),
            hotkey: None,
            order: None,
        }
    }

    fn same_name(&self, other: &str) -> bool {
        names_match(&self.name, other)
    }

    fn hotkey_matches(&self, hotkey: char) -> bool {
        self.hotkey
            .map(|own| own.to_lowercase().eq(hotkey.to_lowercase()))
            .unwrap_or(false)
    }

    fn to_key_values(&self) -> KeyValues {
        let mut values = KeyValues::new();
        let mut put = |field: &str, value: String| {
            values.insert(format!("{}.{}", self.name, field), value);
        };
        put(FIELD_DRIVER, self.driver.clone().unwrap_or_default());
        put(FIELD_URL, self.url.clone());
        put(FIELD_AUTO_LOGIN, self.auto_login.to_string());
        put(FIELD_USER, self.user.clone());
        if let Some(password) = &self.password {
            put(FIELD_PASSWORD, password.clone());
        }
        put(FIELD_SEPARATOR, self.separator.clone());
        if let Some(hotkey) = self.hotkey {
            put(FIELD_HOTKEY, hotkey.to_string());
        }
        if let Some(order) = self.order {
            put(FIELD_ORDER, order.to_string());
        }
        values
    }

    fn from_fields(name: &str, fields: &BTreeMap<&str, &str>) -> Result<Self> {
        let mut profile = ConnectionProfile::new(name, "");
        for (&field, &value) in fields {
            match field {
                FIELD_DRIVER => profile.driver = non_empty(value),
                FIELD_URL => profile.url = value.to_string(),
                FIELD_AUTO_LOGIN => {
                    profile.auto_login = value.trim().parse().map_err(|_| {
                        ClientError::Load(format!(
                            "profile {:?}: invalid autologin value {:?}",
                            name, value
                        ))
                    })?
                }
                FIELD_USER => profile.user = value.to_string(),
                FIELD_PASSWORD => profile.password = Some(value.to_string()),
                FIELD_SEPARATOR => {
                    if !value.is_empty() {
                        profile.separator = value.to_string();
                    }
                }
                FIELD_HOTKEY => profile.hotkey = value.chars().next(),
                FIELD_ORDER => {
                    profile.order = match value.trim() {
                        "" => None,
                        raw => Some(raw.parse().map_err(|_| {
                            ClientError::Load(format!(
                                "profile {:?}: invalid order value {:?}",
                                name, value
                            ))
                        })?),
                    }
                }
                unknown => warn!("Ignoring unknown field {:?} of profile {:?}", unknown, name),
            }
        }
        Ok(profile)
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("auto_login", &self.auto_login)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("separator", &self.separator)
            .field("hotkey", &self.hotkey)
            .field("order", &self.order)
            .finish()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn names_match(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Display ordering of profiles.
///
/// Profiles with an explicit order come first, by that order; the rest
/// follow alphabetically (case-insensitive). Equal orders fall back to the
/// name so the result never depends on load order.
pub fn compare_profiles(a: &ConnectionProfile, b: &ConnectionProfile) -> Ordering {
    let by_name = || {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    };
    match (a.order, b.order) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(by_name),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => by_name(),
    }
}

/// Splits a stored key into profile name and field name at the last `.`.
fn split_key(key: &str) -> Option<(&str, &str)> {
    let (name, field) = key.rsplit_once('.')?;
    if name.is_empty() || field.is_empty() {
        None
    } else {
        Some((name, field))
    }
}

fn keys_of<'a>(values: &'a KeyValues, name: &'a str) -> impl Iterator<Item = &'a String> + 'a {
    values.keys().filter(move |key| {
        split_key(key)
            .map(|(owner, _)| names_match(owner, name))
            .unwrap_or(false)
    })
}

/// Persists and retrieves connection profiles.
pub struct ProfileStore<S: KeyValueStore> {
    backend: S,
    // Serializes load-then-persist sequences.
    lock: Mutex<()>,
}

impl<S: KeyValueStore> ProfileStore<S> {
    pub fn new(backend: S) -> Self {
        ProfileStore {
            backend,
            lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Loads every profile, sorted by [`compare_profiles`].
    pub fn list(&self) -> Result<Vec<ConnectionProfile>> {
        let profiles = parse_profiles(&self.backend.load()?)?;
        debug!("Loaded {} profiles", profiles.len());
        Ok(profiles)
    }

    /// Returns the profile called `name` (case-insensitive), if any.
    pub fn find_by_name(&self, name: &str) -> Result<Option<ConnectionProfile>> {
        Ok(self.list()?.into_iter().find(|p| p.same_name(name)))
    }

    /// Inserts or replaces the profile with `profile.name`.
    pub fn save(&self, profile: &ConnectionProfile) -> Result<()> {
        check_name(profile)?;

        let _guard = self.lock()?;
        let mut values = self.backend.load().map_err(as_save_error)?;
        check_hotkey(profile, &[profile.name.as_str()], &values)?;
        remove_profile_keys(&mut values, &profile.name);
        values.extend(profile.to_key_values());
        self.backend.persist(&values).map_err(as_save_error)?;
        info!("Saved profile {}", profile.name);
        Ok(())
    }

    /// Replaces the profile `old_name` with `profile` in a single persist.
    pub fn rename(&self, old_name: &str, profile: &ConnectionProfile) -> Result<()> {
        check_name(profile)?;

        let _guard = self.lock()?;
        let mut values = self.backend.load().map_err(as_save_error)?;
        if keys_of(&values, old_name).next().is_none() {
            return Err(ClientError::State(format!("no profile named {:?}", old_name)));
        }
        check_hotkey(profile, &[old_name, profile.name.as_str()], &values)?;
        remove_profile_keys(&mut values, old_name);
        remove_profile_keys(&mut values, &profile.name);
        values.extend(profile.to_key_values());
        self.backend.persist(&values).map_err(as_save_error)?;
        info!("Renamed profile {} to {}", old_name, profile.name);
        Ok(())
    }

    /// Removes the profile called `name`.
    pub fn delete_by_name(&self, name: &str) -> Result<()> {
        let _guard = self.lock()?;
        let mut values = self
            .backend
            .load()
            .map_err(|e| ClientError::Delete(e.to_string()))?;
        if remove_profile_keys(&mut values, name) == 0 {
            return Err(ClientError::State(format!("no profile named {:?}", name)));
        }
        self.backend
            .persist(&values)
            .map_err(|e| ClientError::Delete(e.to_string()))?;
        info!("Deleted profile {}", name);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| ClientError::Save("profile store lock poisoned".to_string()))
    }
}

fn parse_profiles(values: &KeyValues) -> Result<Vec<ConnectionProfile>> {
    let mut grouped: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    for (key, value) in values {
        let (name, field) = split_key(key)
            .ok_or_else(|| ClientError::Load(format!("malformed profile key {:?}", key)))?;
        grouped.entry(name).or_default().insert(field, value.as_str());
    }

    let mut profiles = grouped
        .iter()
        .map(|(name, fields)| ConnectionProfile::from_fields(name, fields))
        .collect::<Result<Vec<_>>>()?;
    profiles.sort_by(compare_profiles);
    Ok(profiles)
}

fn check_name(profile: &ConnectionProfile) -> Result<()> {
    if profile.name.trim().is_empty() {
        return Err(ClientError::Save("profile name is blank".to_string()));
    }
    Ok(())
}

/// Checks the hotkey against every stored profile not named in `own_names`.
/// If the stored profiles cannot be parsed, the check is skipped.
fn check_hotkey(profile: &ConnectionProfile, own_names: &[&str], values: &KeyValues) -> Result<()> {
    let Some(hotkey) = profile.hotkey else {
        return Ok(());
    };
    let existing = match parse_profiles(values) {
        Ok(existing) => existing,
        Err(e) => {
            warn!("Skipping hotkey check for {}: {}", profile.name, e);
            return Ok(());
        }
    };
    if let Some(clash) = existing
        .iter()
        .filter(|p| !own_names.iter().any(|own| p.same_name(own)))
        .find(|p| p.hotkey_matches(hotkey))
    {
        return Err(ClientError::Save(format!(
            "hotkey {:?} is already used by profile {:?}",
            hotkey, clash.name
        )));
    }
    Ok(())
}

fn remove_profile_keys(values: &mut KeyValues, name: &str) -> usize {
    let doomed: Vec<String> = keys_of(values, name).cloned().collect();
    for key in &doomed {
        values.remove(key);
    }
    doomed.len()
}

fn as_save_error(err: ClientError) -> ClientError {
    match err {
        ClientError::Save(_) => err,
        other => ClientError::Save(other.to_string()),
    }
}
