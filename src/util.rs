//! Small request-handling helpers shared across modules.

use rustc_hash::FxHashMap;

/// Decoded query-string parameters.
///
/// Repeated keys keep the first value, matching how the upstream exchange
/// reads its query parameters.
#[derive(Debug, Clone, Default)]
pub struct QueryParams(FxHashMap<String, String>);

impl QueryParams {
    /// Parse the raw query portion of a request URI (without the `?`).
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        let mut map = FxHashMap::default();
        if let Some(raw) = raw {
            for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
                map.entry(k.into_owned()).or_insert_with(|| v.into_owned());
            }
        }
        Self(map)
    }

    /// Build from literal pairs; used for internally issued requests.
    #[must_use]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    /// Value for a key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether a key is present with a non-empty value.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_empty())
    }
}
