//! Core domain model for the global badge snapshot.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "badge-core";

/// Listing page scraped on every run.
pub const SOURCE_URL: &str = "https://www.streamdatabase.com/twitch/global-badges";
pub const SOURCE_ID: &str = "streamdatabase";
/// Path fragment shared by every badge detail link on the listing page.
pub const BADGE_PATH_MARKER: &str = "/twitch/global-badges/";
pub const CDN_HOST: &str = "static-cdn.jtvnw.net";
pub const DEFAULT_OUTPUT_FILE: &str = "global-badges.json";
/// Version id assumed for detail links that carry only a set id.
pub const DEFAULT_VERSION_ID: &str = "1";

/// Identity of one badge version across scrapes and the persisted snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BadgeKey {
    pub set_id: String,
    pub id: String,
}

impl BadgeKey {
    pub fn new(set_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            set_id: set_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for BadgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.set_id, self.id)
    }
}

/// One renderable icon within a set.
///
/// The three resolution fields always hold the same URL; the shape is kept
/// for compatibility with existing consumers of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadgeVersion {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub image_url_1x: String,
    #[serde(default)]
    pub image_url_2x: String,
    #[serde(default)]
    pub image_url_4x: String,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl BadgeVersion {
    pub fn with_url(id: impl Into<String>, url: &str) -> Self {
        Self {
            id: id.into(),
            image_url_1x: url.to_string(),
            image_url_2x: url.to_string(),
            image_url_4x: url.to_string(),
            extra: Map::new(),
        }
    }

    /// URL probed by the link checker.
    pub fn primary_url(&self) -> &str {
        &self.image_url_1x
    }

    pub fn replace_urls(&mut self, url: &str) {
        self.image_url_1x = url.to_string();
        self.image_url_2x = url.to_string();
        self.image_url_4x = url.to_string();
    }
}

/// One named badge category with its append-only list of versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadgeSet {
    #[serde(deserialize_with = "string_or_number")]
    pub set_id: String,
    #[serde(default)]
    pub versions: Vec<BadgeVersion>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl BadgeSet {
    pub fn new(set_id: impl Into<String>, first: BadgeVersion) -> Self {
        Self {
            set_id: set_id.into(),
            versions: vec![first],
            extra: Map::new(),
        }
    }
}

/// The persisted snapshot document: `{"global": [...]}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BadgeCollection {
    #[serde(default)]
    pub global: Vec<BadgeSet>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl BadgeCollection {
    pub fn keys(&self) -> HashSet<BadgeKey> {
        self.global
            .iter()
            .flat_map(|set| {
                set.versions
                    .iter()
                    .map(move |v| BadgeKey::new(set.set_id.clone(), v.id.clone()))
            })
            .collect()
    }

    pub fn find_set_mut(&mut self, set_id: &str) -> Option<&mut BadgeSet> {
        self.global.iter_mut().find(|set| set.set_id == set_id)
    }

    pub fn version(&self, key: &BadgeKey) -> Option<&BadgeVersion> {
        self.global
            .iter()
            .find(|set| set.set_id == key.set_id)
            .and_then(|set| set.versions.iter().find(|v| v.id == key.id))
    }

    pub fn version_count(&self) -> usize {
        self.global.iter().map(|set| set.versions.len()).sum()
    }
}

/// Ephemeral record parsed from the listing page for one (set, version) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedBadge {
    pub set_id: String,
    pub id: String,
    pub name: String,
    pub url: String,
}

impl ScrapedBadge {
    pub fn key(&self) -> BadgeKey {
        BadgeKey::new(self.set_id.clone(), self.id.clone())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number identifier, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_identifiers_are_read_as_strings() {
        let doc = r#"{"global": [{"set_id": 42, "versions": [{"id": 1, "image_url_1x": "a"}]}]}"#;
        let collection: BadgeCollection = serde_json::from_str(doc).unwrap();
        assert_eq!(collection.global[0].set_id, "42");
        assert_eq!(collection.global[0].versions[0].id, "1");
        assert_eq!(collection.global[0].versions[0].image_url_2x, "");
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let doc = r#"{"global":[{"set_id":"vip","title":"VIP","versions":[{"id":"1","image_url_1x":"u","image_url_2x":"u","image_url_4x":"u","click_action":"none"}]}],"generated_by":"x"}"#;
        let collection: BadgeCollection = serde_json::from_str(doc).unwrap();
        assert_eq!(collection.extra.get("generated_by"), Some(&JsonValue::from("x")));
        assert_eq!(collection.global[0].extra.get("title"), Some(&JsonValue::from("VIP")));

        let back = serde_json::to_value(&collection).unwrap();
        assert_eq!(back["global"][0]["versions"][0]["click_action"], "none");
        assert_eq!(back["generated_by"], "x");
    }

    #[test]
    fn known_fields_are_written_before_preserved_keys() {
        let doc = r#"{"click_action":"none","id":"1","image_url_1x":"u","image_url_2x":"u","image_url_4x":"u","title":"VIP"}"#;
        let version: BadgeVersion = serde_json::from_str(doc).unwrap();
        assert_eq!(
            serde_json::to_string(&version).unwrap(),
            r#"{"id":"1","image_url_1x":"u","image_url_2x":"u","image_url_4x":"u","click_action":"none","title":"VIP"}"#
        );
    }

    #[test]
    fn keys_cover_every_persisted_version() {
        let mut collection = BadgeCollection::default();
        collection
            .global
            .push(BadgeSet::new("subscriber", BadgeVersion::with_url("0", "u0")));
        collection.global[0]
            .versions
            .push(BadgeVersion::with_url("3", "u3"));
        collection
            .global
            .push(BadgeSet::new("vip", BadgeVersion::with_url("1", "v")));

        let keys = collection.keys();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&BadgeKey::new("subscriber", "3")));
        assert_eq!(collection.version_count(), 3);
        assert_eq!(
            collection
                .version(&BadgeKey::new("vip", "1"))
                .map(BadgeVersion::primary_url),
            Some("v")
        );
    }
}
