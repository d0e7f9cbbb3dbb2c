use std::collections::BTreeMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SessionError;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A user session owned by the request that loaded or created it.
///
/// Attribute values are kept as JSON values so any serializer strategy can
/// encode them and so equal content always produces the same fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: String,
    /// Creation time (ms since epoch)
    pub(crate) creation_time: i64,
    /// Start of the previous request that accessed this session
    pub(crate) last_accessed_time: i64,
    /// Start of the current request
    pub(crate) this_accessed_time: i64,
    /// Seconds of inactivity before the store drops the session
    pub(crate) max_inactive_interval: i64,
    pub(crate) attributes: BTreeMap<String, serde_json::Value>,
    dirty: bool,
    valid: bool,
    is_new: bool,
}

impl Session {
    /// A freshly created session: valid, new and not yet persisted.
    pub fn new(id: impl Into<String>, max_inactive_interval: i64) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            creation_time: now,
            last_accessed_time: now,
            this_accessed_time: now,
            max_inactive_interval,
            attributes: BTreeMap::new(),
            dirty: false,
            valid: true,
            is_new: true,
        }
    }

    /// A structurally empty session the serializer fills in on load.
    pub(crate) fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            creation_time: 0,
            last_accessed_time: 0,
            this_accessed_time: 0,
            max_inactive_interval: 0,
            attributes: BTreeMap::new(),
            dirty: false,
            valid: false,
            is_new: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creation_time(&self) -> i64 {
        self.creation_time
    }

    pub fn last_accessed_time(&self) -> i64 {
        self.last_accessed_time
    }

    pub fn max_inactive_interval(&self) -> i64 {
        self.max_inactive_interval
    }

    pub fn set_max_inactive_interval(&mut self, seconds: i64) {
        if self.max_inactive_interval != seconds {
            self.max_inactive_interval = seconds;
            self.dirty = true;
        }
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Raw attribute value.
    pub fn attribute_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    /// Typed attribute value. `Ok(None)` when the attribute is absent.
    pub fn attribute<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, SessionError> {
        self.attributes
            .get(name)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| SessionError::Serialization(e.to_string()))
    }

    pub fn attributes(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.attributes
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Set an attribute. Only marks the session dirty when the value changes.
    pub fn set_attribute<T: Serialize>(&mut self, name: &str, value: T) -> Result<(), SessionError> {
        let value =
            serde_json::to_value(value).map_err(|e| SessionError::Serialization(e.to_string()))?;

        if self.attributes.get(name) != Some(&value) {
            self.attributes.insert(name.to_string(), value);
            self.dirty = true;
        }
        Ok(())
    }

    /// Remove an attribute, returning its previous value.
    pub fn remove_attribute(&mut self, name: &str) -> Option<serde_json::Value> {
        let removed = self.attributes.remove(name);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Mark the session invalid; the store removes it after the request.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Record an access at the start of a request.
    pub fn access(&mut self) {
        self.last_accessed_time = self.this_accessed_time;
        self.this_accessed_time = now_millis();
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub(crate) fn set_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }

    pub(crate) fn reset_dirty(&mut self) {
        self.dirty = false;
    }
}
