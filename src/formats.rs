use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Synthetic column holding the URL each record was extracted from.
pub const SOURCE_URL_FIELD: &str = "source_url";

/// Cell value for a field that neither the rules nor the fallback could fill.
pub const ERROR_VALUE: &str = "ERROR";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub website: String,
    pub fields: FieldMap,
    #[serde(
        default,
        alias = "listPageCheck",
        skip_serializing_if = "Option::is_none"
    )]
    pub list_page_check: Option<String>,
    #[serde(default, alias = "pageQuery", skip_serializing_if = "Option::is_none")]
    pub page_query: Option<String>,
    #[serde(
        default,
        alias = "nextPageXPath",
        alias = "next_page_xpath",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_page: Option<String>,
    /// Field whose rule decides whether a start URL is a detail page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_field: Option<String>,
    #[serde(default)]
    pub media: MediaFields,
    #[serde(flatten)]
    pub render: RenderOptions,
}

impl SiteConfig {
    pub fn is_media_field(&self, name: &str) -> bool {
        name == self.media.urls || name == self.media.names
    }

    /// Rule driving the media pair: whichever of the urls and names fields
    /// carries a path, the urls field first.
    pub fn media_rule(&self) -> Option<&FieldRule> {
        let urls = self.fields.get(&self.media.urls);
        let names = self.fields.get(&self.media.names);
        [urls, names]
            .into_iter()
            .flatten()
            .find(|rule| rule.has_path())
            .or(urls)
            .or(names)
    }

    pub fn probe_field(&self) -> Option<(&str, &FieldRule)> {
        match self.probe_field.as_deref() {
            Some(name) => self.fields.get_key_value(name),
            None => self.fields.iter().next(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(default, alias = "xpath")]
    pub path: Option<String>,
    #[serde(default)]
    pub transform: Option<String>,
}

impl FieldRule {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn has_path(&self) -> bool {
        self.path.as_deref().is_some_and(|path| !path.trim().is_empty())
    }
}

/// Ordered field map. Declaration order drives record and column order.
#[derive(Debug, Clone, Default)]
pub struct FieldMap(Vec<(String, FieldRule)>);

impl FieldMap {
    pub fn get(&self, name: &str) -> Option<&FieldRule> {
        self.get_key_value(name).map(|(_, rule)| rule)
    }

    pub fn get_key_value(&self, name: &str) -> Option<(&str, &FieldRule)> {
        self.iter().find(|(key, _)| *key == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Later duplicates replace earlier ones in place.
impl FromIterator<(String, FieldRule)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (String, FieldRule)>>(iter: I) -> Self {
        let mut fields: Vec<(String, FieldRule)> = Vec::new();
        for (name, rule) in iter {
            match fields.iter_mut().find(|(key, _)| *key == name) {
                Some(slot) => slot.1 = rule,
                None => fields.push((name, rule)),
            }
        }
        Self(fields)
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, rule) in self.iter() {
            map.serialize_entry(name, rule)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldMapVisitor;

        impl<'de> Visitor<'de> for FieldMapVisitor {
            type Value = FieldMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of field names to field rules")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldMap, A::Error> {
                let mut fields: Vec<(String, FieldRule)> = Vec::new();
                while let Some((name, rule)) = access.next_entry::<String, FieldRule>()? {
                    if fields.iter().any(|(key, _)| *key == name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate field name: {name}"
                        )));
                    }
                    fields.push((name, rule));
                }
                Ok(FieldMap(fields))
            }
        }

        deserializer.deserialize_map(FieldMapVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFields {
    pub urls: String,
    pub names: String,
}

impl Default for MediaFields {
    fn default() -> Self {
        Self {
            urls: "Фото_ссылки".to_owned(),
            names: "Фото_уникальные_названия".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Seconds to let the page settle before the DOM is captured.
    pub wait_time: u64,
    pub lazy_scroll: bool,
    pub max_scrolls: u32,
    /// Seconds between scroll steps.
    pub scroll_pause: u64,
    /// Selector that must match once the page is ready.
    #[serde(alias = "page_ready_xpath", skip_serializing_if = "Option::is_none")]
    pub page_ready: Option<String>,
    pub user_agent: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_time: 6,
            lazy_scroll: false,
            max_scrolls: 10,
            scroll_pause: 2,
            page_ready: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}
