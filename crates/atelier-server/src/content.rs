//! Page documents: one JSON file per allowed page under `content/`.
//!
//! Saves are validated against the page's schema before anything touches
//! disk. Reads return the stored bytes untouched.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::store::file::write_replace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Page parameter is missing.")]
    MissingPage,
    #[error("Invalid page specified.")]
    InvalidPage,
    #[error("Page not found")]
    NotFound,
    #[error("Invalid JSON data received.")]
    InvalidJson,
    #[error("Content does not match the page layout: {0}")]
    Schema(String),
    #[error("Failed to write to content file.")]
    Storage,
}

// ── Page ids ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageId {
    Index,
    Contact,
    Gallery,
    Pricing,
    Sauna,
    Shop,
}

impl PageId {
    pub const ALL: [PageId; 6] = [
        PageId::Index,
        PageId::Contact,
        PageId::Gallery,
        PageId::Pricing,
        PageId::Sauna,
        PageId::Shop,
    ];

    /// Reduce `raw` to its last path component, then match the allow-list.
    pub fn parse(raw: &str) -> Result<Self, ContentError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ContentError::MissingPage);
        }
        let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == base)
            .ok_or(ContentError::InvalidPage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageId::Index => "index",
            PageId::Contact => "contact",
            PageId::Gallery => "gallery",
            PageId::Pricing => "pricing",
            PageId::Sauna => "sauna",
            PageId::Shop => "shop",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Schemas ──────────────────────────────────────────────────────────────────

/// Accepts strings, numbers and null; editors sometimes save prices as numbers.
fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected text, found {other}"
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Footer {
    #[serde(default, deserialize_with = "text")]
    pub address: String,
    #[serde(default, deserialize_with = "text")]
    pub whatsapp: String,
    #[serde(default, deserialize_with = "text")]
    pub instagram: String,
    #[serde(default, deserialize_with = "text")]
    pub working_hours: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TitledText {
    #[serde(default, deserialize_with = "text")]
    pub title: String,
    #[serde(default, deserialize_with = "text")]
    pub description: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, deserialize_with = "text")]
    pub icon: String,
    #[serde(default, deserialize_with = "text")]
    pub title: String,
    #[serde(default, deserialize_with = "text")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingCard {
    #[serde(default, deserialize_with = "text")]
    pub package: String,
    #[serde(default, deserialize_with = "text")]
    pub price: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub recommended: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GalleryImage {
    #[serde(default, deserialize_with = "text")]
    pub src: String,
    #[serde(default, deserialize_with = "text")]
    pub alt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShopItem {
    #[serde(default, deserialize_with = "text")]
    pub category: String,
    #[serde(default, deserialize_with = "text")]
    pub package: String,
    #[serde(default, deserialize_with = "text")]
    pub price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_svg: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaunaIntro {
    #[serde(default, deserialize_with = "text")]
    pub title: String,
    #[serde(default, deserialize_with = "text")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_src: Option<String>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaunaPackage {
    #[serde(default, deserialize_with = "text")]
    pub title: String,
    #[serde(default, deserialize_with = "text")]
    pub price: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub recommended: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaunaPackages {
    pub packages: Vec<SaunaPackage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaunaBenefits {
    pub benefits: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPage {
    pub hero: TitledText,
    pub features: Vec<Feature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<Footer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingPage {
    pub page_header: TitledText,
    pub pricing_cards: Vec<PricingCard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<Footer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryPage {
    pub page_header: TitledText,
    pub gallery_images: Vec<GalleryImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<Footer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopPage {
    pub page_header: TitledText,
    pub shop_items: Vec<ShopItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<Footer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaunaPage {
    pub page_header: TitledText,
    pub sauna_intro: SaunaIntro,
    pub sauna_packages: SaunaPackages,
    pub sauna_benefits: SaunaBenefits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<Footer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPage {
    pub page_header: TitledText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<Footer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A page document, validated against the layout for its page id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PageDocument {
    Index(IndexPage),
    Contact(ContactPage),
    Gallery(GalleryPage),
    Pricing(PricingPage),
    Sauna(SaunaPage),
    Shop(ShopPage),
}

impl PageDocument {
    pub fn parse(page: PageId, body: &[u8]) -> Result<Self, ContentError> {
        let value: Value = serde_json::from_slice(body).map_err(|_| ContentError::InvalidJson)?;
        Self::from_value(page, value)
    }

    pub fn from_value(page: PageId, value: Value) -> Result<Self, ContentError> {
        fn typed<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ContentError> {
            serde_json::from_value(value).map_err(|e| ContentError::Schema(e.to_string()))
        }
        if !value.is_object() {
            return Err(ContentError::Schema("document must be a JSON object".into()));
        }
        Ok(match page {
            PageId::Index => Self::Index(typed(value)?),
            PageId::Contact => Self::Contact(typed(value)?),
            PageId::Gallery => Self::Gallery(typed(value)?),
            PageId::Pricing => Self::Pricing(typed(value)?),
            PageId::Sauna => Self::Sauna(typed(value)?),
            PageId::Shop => Self::Shop(typed(value)?),
        })
    }

    pub fn page(&self) -> PageId {
        match self {
            Self::Index(_) => PageId::Index,
            Self::Contact(_) => PageId::Contact,
            Self::Gallery(_) => PageId::Gallery,
            Self::Pricing(_) => PageId::Pricing,
            Self::Sauna(_) => PageId::Sauna,
            Self::Shop(_) => PageId::Shop,
        }
    }

    /// Pretty JSON, non-ASCII left as-is.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, ContentError> {
        let mut out = serde_json::to_vec_pretty(self).map_err(|_| ContentError::Storage)?;
        out.push(b'\n');
        Ok(out)
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, page: PageId) -> PathBuf {
        self.dir.join(page.file_name())
    }

    /// The stored document bytes, unparsed.
    pub fn get(&self, page: PageId) -> Result<Vec<u8>, ContentError> {
        match std::fs::read(self.path_for(page)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ContentError::NotFound),
            Err(e) => {
                error!(page = %page, error = %e, "could not read content file");
                Err(ContentError::Storage)
            }
        }
    }

    /// Validate `body` for `page` and replace the stored document.
    pub fn put(&self, page: PageId, body: &[u8]) -> Result<PageDocument, ContentError> {
        let doc = PageDocument::parse(page, body)?;
        let bytes = doc.to_pretty_json()?;
        write_replace(&self.path_for(page), &bytes).map_err(|e| {
            error!(page = %page, error = %e, "could not write content file");
            ContentError::Storage
        })?;
        info!(page = %page, bytes = bytes.len(), "content saved");
        Ok(doc)
    }
}
