use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationMode {
    #[default]
    Forward,
    Reverse,
    Api,
}

/// Selectors for one list page. In HTML mode these are CSS selectors; in API
/// mode `item_container` is the JSON key of the item array and the rest are
/// per-item field keys.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSelectors {
    pub item_container: Option<String>,
    pub title: Option<String>,
    pub date: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextRule {
    pub container: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRule {
    pub container: String,
    pub images: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileLinkRule {
    pub container: String,
    pub links: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddedPdfRule {
    pub viewer: String,
    #[serde(default = "default_viewer_attributes")]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub pre_visit: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPdfRule {
    pub scripts: String,
}

/// One selector group per extractor kind; absent groups disable that
/// extractor for the matching pages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailSelectors {
    pub text: Option<TextRule>,
    pub images: Option<ImageRule>,
    pub pdf_links: Option<FileLinkRule>,
    pub docx_links: Option<FileLinkRule>,
    pub embedded_pdf: Option<EmbeddedPdfRule>,
    pub script_pdf: Option<ScriptPdfRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailSelectorEntry {
    pub host: String,
    #[serde(default)]
    pub path_prefix: String,
    #[serde(flatten)]
    pub selectors: DetailSelectors,
}

impl DetailSelectorEntry {
    fn matches(&self, detail_url: &str) -> bool {
        let Ok(parsed) = Url::parse(detail_url) else {
            return false;
        };
        if parsed.host_str() != Some(self.host.as_str()) {
            return false;
        }
        parsed.path().starts_with(&self.path_prefix)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub pagination_mode: PaginationMode,
    pub list_url: Option<String>,
    pub api_url: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub selectors: ListSelectors,
    /// Per-source override that wins over the shared detail selector list.
    pub detail: Option<DetailSelectors>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WechatSourceConfig {
    pub id: String,
    pub name: String,
    pub biz: Option<String>,
    #[serde(default = "default_wechat_count")]
    pub count: u32,
    #[serde(default)]
    pub article_urls: Vec<String>,
}

fn default_max_pages() -> u32 {
    1
}

fn default_wechat_count() -> u32 {
    5
}

fn default_viewer_attributes() -> Vec<String> {
    vec!["src".to_string(), "data-src".to_string()]
}

/// Config files may hold a bare array or wrap it under a named key.
#[derive(Deserialize)]
#[serde(untagged)]
enum SourceFile<T> {
    Wrapped { sources: Vec<T> },
    Bare(Vec<T>),
}

impl<T> SourceFile<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            SourceFile::Wrapped { sources } => sources,
            SourceFile::Bare(items) => items,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    pub sources: Vec<SourceConfig>,
    pub detail_selectors: Vec<DetailSelectorEntry>,
    pub wechat_sources: Vec<WechatSourceConfig>,
}

impl SourceCatalog {
    /// Load all source definitions from a config directory. Missing files
    /// yield empty sections; malformed files are logged and skipped so a bad
    /// edit cannot take the service down.
    pub fn load(dir: &Path) -> Self {
        Self {
            sources: read_section::<SourceConfig>(&dir.join("sources.json")),
            detail_selectors: read_section::<DetailSelectorEntry>(&dir.join("detail_selectors.json")),
            wechat_sources: read_section::<WechatSourceConfig>(&dir.join("wechat.json")),
        }
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|src| src.id == id)
    }

    pub fn wechat_source(&self, id: &str) -> Option<&WechatSourceConfig> {
        self.wechat_sources.iter().find(|src| src.id == id)
    }

    /// Resolve the detail selector group for one detail URL: a per-source
    /// override wins, then the first shared entry matching host and path
    /// prefix, then the first shared entry as a catch-all.
    pub fn detail_selectors_for<'a>(
        &'a self,
        source: Option<&'a SourceConfig>,
        detail_url: &str,
    ) -> Option<&'a DetailSelectors> {
        if let Some(selectors) = source.and_then(|src| src.detail.as_ref()) {
            return Some(selectors);
        }
        self.detail_selectors
            .iter()
            .find(|entry| entry.matches(detail_url))
            .map(|entry| &entry.selectors)
            .or_else(|| self.detail_selectors.first().map(|entry| &entry.selectors))
    }
}

fn read_section<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return Vec::new(),
    };
    if contents.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<SourceFile<T>>(&contents) {
        Ok(file) => file.into_vec(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping malformed source config file");
            Vec::new()
        }
    }
}

/// Shared handle through which the orchestrator sees the catalog. `reload`
/// swaps the whole catalog atomically between crawl cycles.
#[derive(Clone)]
pub struct CatalogHandle {
    dir: PathBuf,
    inner: Arc<RwLock<Arc<SourceCatalog>>>,
}

impl CatalogHandle {
    pub fn new(dir: PathBuf, catalog: SourceCatalog) -> Self {
        Self {
            dir,
            inner: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    pub fn current(&self) -> Arc<SourceCatalog> {
        self.inner
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    pub fn replace(&self, catalog: SourceCatalog) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Arc::new(catalog);
        }
    }

    pub fn reload(&self) {
        self.replace(SourceCatalog::load(&self.dir));
    }
}
