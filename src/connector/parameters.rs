//! Server parameters reported via ParameterStatus.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

static TRACKED_PARAMETERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "server_version",
        "server_encoding",
        "client_encoding",
        "application_name",
        "DateStyle",
        "TimeZone",
        "integer_datetimes",
        "standard_conforming_strings",
        "is_superuser",
        "session_authorization",
    ])
});

/// Connector-local view of the server's reported parameters. Startup accepts
/// everything; later ParameterStatus updates only touch tracked keys.
#[derive(Debug, Clone, Default)]
pub struct ServerParameters {
    parameters: HashMap<String, String>,
}

impl ServerParameters {
    pub fn new() -> ServerParameters {
        ServerParameters::default()
    }

    /// Startup parameters may come uncapitalized, while ParameterStatus uses
    /// canonical keys.
    pub fn set(&mut self, mut key: String, value: String, startup: bool) {
        if key == "timezone" {
            key = "TimeZone".to_string();
        } else if key == "datestyle" {
            key = "DateStyle".to_string();
        }
        if startup || TRACKED_PARAMETERS.contains(key.as_str()) {
            self.parameters.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.get("server_version")
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn as_hashmap(&self) -> HashMap<String, String> {
        self.parameters.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_accepts_everything_later_updates_only_tracked() {
        let mut params = ServerParameters::new();
        params.set("some_extension_guc".into(), "1".into(), true);
        assert_eq!(params.get("some_extension_guc"), Some("1"));

        params.set("some_other_guc".into(), "2".into(), false);
        assert_eq!(params.get("some_other_guc"), None);

        params.set("TimeZone".into(), "UTC".into(), false);
        assert_eq!(params.get("TimeZone"), Some("UTC"));
    }

    #[test]
    fn lowercase_aliases_are_canonicalized() {
        let mut params = ServerParameters::new();
        params.set("timezone".into(), "UTC".into(), false);
        params.set("datestyle".into(), "ISO, MDY".into(), false);
        assert_eq!(params.get("TimeZone"), Some("UTC"));
        assert_eq!(params.get("DateStyle"), Some("ISO, MDY"));
    }
}
