//! SessionStore trait and its in-memory implementation.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use rand::RngCore;

use crate::config::SessionConfig;
use crate::value::Value;

/// Per-client state: an opaque key/value map plus a one-shot flash map
/// (values surface once, then disappear — spec.md §4.9 step 5).
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    id: Option<String>,
    values: HashMap<String, Value>,
    flash: HashMap<String, Value>,
    pending_flash: HashMap<String, Value>,
    dirty: bool,
}

impl SessionData {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.dirty = true;
        }
    }

    /// Flash values carried over from the previous request; read-only here,
    /// consumed the moment they were loaded.
    pub fn flash(&self) -> &HashMap<String, Value> {
        &self.flash
    }

    /// Queue a flash value for the *next* request.
    pub fn set_flash(&mut self, key: impl Into<String>, value: Value) {
        self.pending_flash.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// A copy of the current values, for PageHandler to seed the
    /// script-visible session dict before `Eval` (spec.md §4.9 step 5).
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.clone()
    }
}

#[derive(Debug, Clone)]
pub struct SessionCookieAttrs {
    pub name: String,
    pub value: String,
    pub max_age: Duration,
    pub path: String,
    pub domain: Option<String>,
    pub same_site: String,
    pub secure: bool,
    pub http_only: bool,
}

/// Load/save opaque per-client state (spec.md §3 "SessionStore (iface)").
/// `save` owns all session cookie writes (spec.md §9): it returns the
/// cookie to set only when the session was actually dirty.
pub trait SessionStore: Send + Sync {
    fn load(&self, cookie_value: Option<&str>) -> SessionData;
    fn save(&self, data: &SessionData) -> Option<SessionCookieAttrs>;
}

pub struct MemorySessionStore {
    values: DashMap<String, HashMap<String, Value>>,
    flash: DashMap<String, HashMap<String, Value>>,
    config: SessionConfig,
    dev_mode: bool,
}

impl MemorySessionStore {
    pub fn new(config: SessionConfig, dev_mode: bool) -> Self {
        Self {
            values: DashMap::new(),
            flash: DashMap::new(),
            config,
            dev_mode,
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, cookie_value: Option<&str>) -> SessionData {
        let Some(id) = cookie_value else {
            return SessionData::empty();
        };
        let Some(values) = self.values.get(id).map(|v| v.clone()) else {
            return SessionData::empty();
        };
        let flash = self.flash.remove(id).map(|(_, f)| f).unwrap_or_default();

        SessionData {
            id: Some(id.to_string()),
            values,
            flash,
            pending_flash: HashMap::new(),
            dirty: false,
        }
    }

    fn save(&self, data: &SessionData) -> Option<SessionCookieAttrs> {
        if !data.is_dirty() {
            return None;
        }

        let id = data.id.clone().unwrap_or_else(generate_session_id);
        self.values.insert(id.clone(), data.values.clone());
        if data.pending_flash.is_empty() {
            self.flash.remove(&id);
        } else {
            self.flash.insert(id.clone(), data.pending_flash.clone());
        }

        Some(SessionCookieAttrs {
            name: self.config.cookie_name.clone(),
            value: id,
            max_age: Duration::from_secs(self.config.expiry_secs),
            path: self.config.cookie_path.clone(),
            domain: self.config.cookie_domain.clone(),
            same_site: self.config.same_site.clone(),
            secure: !self.dev_mode,
            http_only: true,
        })
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            cookie_name: "basil_session".into(),
            expiry_secs: 86_400,
            cookie_path: "/".into(),
            cookie_domain: None,
            same_site: "lax".into(),
            secret: None,
            csrf: Default::default(),
        }
    }

    #[test]
    fn clean_session_issues_no_cookie() {
        let store = MemorySessionStore::new(config(), false);
        let data = store.load(None);
        assert!(store.save(&data).is_none());
    }

    #[test]
    fn dirty_session_round_trips_through_the_store() {
        let store = MemorySessionStore::new(config(), false);
        let mut data = store.load(None);
        data.set("user_id", Value::Integer(7));

        let attrs = store.save(&data).expect("dirty session issues a cookie");
        assert!(attrs.secure);

        let reloaded = store.load(Some(&attrs.value));
        assert_eq!(reloaded.get("user_id").unwrap().as_integer(), Some(7));
    }

    #[test]
    fn flash_values_are_consumed_after_one_load() {
        let store = MemorySessionStore::new(config(), false);
        let mut data = store.load(None);
        data.set_flash("notice", Value::String("saved".into()));
        let attrs = store.save(&data).unwrap();

        let next = store.load(Some(&attrs.value));
        assert_eq!(next.flash().get("notice").unwrap().as_str(), Some("saved"));

        let after = store.load(Some(&attrs.value));
        assert!(after.flash().is_empty());
    }

    #[test]
    fn dev_mode_issues_non_secure_cookies() {
        let store = MemorySessionStore::new(config(), true);
        let mut data = store.load(None);
        data.set("x", Value::Boolean(true));
        let attrs = store.save(&data).unwrap();
        assert!(!attrs.secure);
    }
}
