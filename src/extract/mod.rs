pub mod document;
pub mod ocr;

use std::collections::HashMap;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tokio::task;
use tracing::{debug, warn};
use url::Url;

use crate::{
    fetch::Fetch,
    model::Attachment,
    source::{DetailSelectors, EmbeddedPdfRule, FileLinkRule, ImageRule, ScriptPdfRule, TextRule},
    util::url::{normalize_url, page_origin, url_tail},
};

use ocr::OcrEngine;

const PDF_MIME: &str = "application/pdf";
const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

#[derive(Debug, Default)]
pub struct DetailExtraction {
    pub content: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Pdf,
    Docx,
}

#[derive(Debug)]
struct FileLink {
    url: String,
    filename: Option<String>,
    kind: FileKind,
}

#[derive(Debug)]
struct EmbeddedPdf {
    pdf_url: String,
    /// Set when the viewer page must be visited first to pick up cookies.
    viewer_url: Option<String>,
}

/// Everything the selector phase decides, with owned strings only. The DOM
/// is parsed and dropped inside `build_plan` so no parser state is held
/// across await points.
#[derive(Debug, Default)]
struct ExtractionPlan {
    text: String,
    image_urls: Vec<String>,
    file_links: Vec<FileLink>,
    embedded: Option<EmbeddedPdf>,
    script_pdf_urls: Vec<String>,
}

/// Run the generic selector-driven pipeline for one fetched detail page:
/// body text, image OCR, direct and embedded attachments, then aggregate.
/// Every sub-step is best-effort; a failing attachment never aborts the item.
pub async fn extract_detail(
    fetcher: &dyn Fetch,
    ocr: &OcrEngine,
    html: &str,
    detail_url: &str,
    base_url: &str,
    headers: &HashMap<String, String>,
    selectors: Option<&DetailSelectors>,
) -> DetailExtraction {
    let plan = selectors
        .map(|selectors| build_plan(html, base_url, selectors))
        .unwrap_or_default();

    let mut image_texts = Vec::new();
    if ocr.enabled() {
        for image_url in &plan.image_urls {
            let Ok(bytes) = fetcher.get_bytes(image_url, headers).await else {
                continue;
            };
            let text = ocr.recognize(bytes).await;
            if !text.is_empty() {
                image_texts.push(text);
            }
        }
    }

    let mut attachments = Vec::new();

    for link in &plan.file_links {
        let Ok(bytes) = fetcher.get_bytes(&link.url, headers).await else {
            continue;
        };
        let (text, mime) = match link.kind {
            FileKind::Pdf => (pdf_text_blocking(bytes).await, PDF_MIME),
            FileKind::Docx => (docx_text_blocking(bytes).await, DOCX_MIME),
        };
        let filename = link
            .filename
            .clone()
            .unwrap_or_else(|| url_tail(&link.url).to_string());
        attachments.push(Attachment {
            url: link.url.clone(),
            filename: Some(filename),
            mime_type: Some(mime.to_string()),
            text: Some(text),
        });
    }

    if let Some(embedded) = &plan.embedded {
        // Hot-link protection on these viewers checks Referer and Origin.
        let mut download_headers = headers.clone();
        download_headers.insert("Referer".to_string(), detail_url.to_string());
        if let Some(origin) = page_origin(detail_url) {
            download_headers.insert("Origin".to_string(), origin);
        }

        if let Some(viewer_url) = &embedded.viewer_url {
            if fetcher.get_text(viewer_url, &download_headers).await.is_err() {
                debug!(url = %viewer_url, "viewer pre-visit failed, downloading anyway");
            }
        }

        if let Ok(bytes) = fetcher.get_bytes(&embedded.pdf_url, &download_headers).await {
            let text = pdf_text_blocking(bytes).await;
            attachments.push(Attachment {
                url: embedded.pdf_url.clone(),
                filename: Some(url_tail(&embedded.pdf_url).to_string()),
                mime_type: Some(PDF_MIME.to_string()),
                text: Some(text),
            });
        }
    }

    for pdf_url in &plan.script_pdf_urls {
        // The link itself is worth keeping even when the download fails.
        let text = match fetcher.get_bytes(pdf_url, headers).await {
            Ok(bytes) => pdf_text_blocking(bytes).await,
            Err(_) => String::new(),
        };
        attachments.push(Attachment {
            url: pdf_url.clone(),
            filename: Some(url_tail(pdf_url).to_string()),
            mime_type: Some(PDF_MIME.to_string()),
            text: Some(text),
        });
    }

    let snippets: Vec<String> = attachments
        .iter()
        .filter(|att| att.text.as_deref().is_some_and(|text| !text.is_empty()))
        .map(attachment_snippet)
        .collect();
    let content = aggregate_content(&plan.text, &image_texts, &snippets);

    DetailExtraction {
        content,
        attachments,
    }
}

async fn pdf_text_blocking(bytes: Vec<u8>) -> String {
    task::spawn_blocking(move || document::pdf_text(&bytes))
        .await
        .unwrap_or_default()
}

async fn docx_text_blocking(bytes: Vec<u8>) -> String {
    task::spawn_blocking(move || document::docx_text(&bytes))
        .await
        .unwrap_or_default()
}

fn build_plan(html: &str, base_url: &str, selectors: &DetailSelectors) -> ExtractionPlan {
    let doc = Html::parse_document(html);

    ExtractionPlan {
        text: selectors
            .text
            .as_ref()
            .map(|rule| extract_text(&doc, rule))
            .unwrap_or_default(),
        image_urls: selectors
            .images
            .as_ref()
            .map(|rule| collect_image_urls(&doc, rule, base_url))
            .unwrap_or_default(),
        file_links: collect_typed_links(&doc, selectors, base_url),
        embedded: selectors
            .embedded_pdf
            .as_ref()
            .and_then(|rule| resolve_embedded_pdf(&doc, rule, base_url)),
        script_pdf_urls: selectors
            .script_pdf
            .as_ref()
            .map(|rule| collect_script_pdf_urls(&doc, rule, base_url))
            .unwrap_or_default(),
    }
}

pub(crate) fn parse_selector(raw: &str) -> Option<Selector> {
    match Selector::parse(raw) {
        Ok(selector) => Some(selector),
        Err(err) => {
            warn!(selector = raw, error = %err, "invalid CSS selector in detail config");
            None
        }
    }
}

/// Body text per the configured rule: paragraph nodes first, then the
/// content sub-selector, then the whole container.
fn extract_text(doc: &Html, rule: &TextRule) -> String {
    let Some(container_selector) = parse_selector(&rule.container) else {
        return String::new();
    };
    let Some(container) = doc.select(&container_selector).next() else {
        return String::new();
    };

    let chunks: Vec<String> = if let Some(content_raw) = rule.content.as_deref() {
        let Ok(paragraph_selector) = Selector::parse("p") else {
            return String::new();
        };
        let paragraphs: Vec<ElementRef> = container.select(&paragraph_selector).collect();
        if !paragraphs.is_empty() {
            paragraphs.iter().map(element_text).collect()
        } else if let Some(content_selector) = parse_selector(content_raw) {
            container
                .select(&content_selector)
                .map(|node| element_text(&node))
                .collect()
        } else {
            Vec::new()
        }
    } else {
        vec![element_text(&container)]
    };

    chunks
        .into_iter()
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Visible text of one element, space-joined, with script and style
/// subtrees skipped.
pub(crate) fn element_text(element: &ElementRef) -> String {
    let mut fragments = Vec::new();
    collect_text_fragments(*element, &mut fragments);
    fragments.join(" ")
}

fn collect_text_fragments(element: ElementRef, fragments: &mut Vec<String>) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            let name = child_element.value().name();
            if name.eq_ignore_ascii_case("script") || name.eq_ignore_ascii_case("style") {
                continue;
            }
            collect_text_fragments(child_element, fragments);
        } else if let Some(text) = child.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                fragments.push(trimmed.to_string());
            }
        }
    }
}

fn collect_image_urls(doc: &Html, rule: &ImageRule, base_url: &str) -> Vec<String> {
    let Some(container_selector) = parse_selector(&rule.container) else {
        return Vec::new();
    };
    let Some(container) = doc.select(&container_selector).next() else {
        return Vec::new();
    };
    let Some(image_selector) = parse_selector(&rule.images) else {
        return Vec::new();
    };

    container
        .select(&image_selector)
        .filter_map(|img| img.value().attr("src"))
        .filter_map(|src| normalize_url(base_url, src))
        .collect()
}

fn collect_typed_links(
    doc: &Html,
    selectors: &DetailSelectors,
    base_url: &str,
) -> Vec<FileLink> {
    let mut links = Vec::new();
    if let Some(rule) = &selectors.pdf_links {
        links.extend(collect_file_links(doc, rule, base_url, FileKind::Pdf));
    }
    if let Some(rule) = &selectors.docx_links {
        links.extend(collect_file_links(doc, rule, base_url, FileKind::Docx));
    }
    links
}

fn collect_file_links(
    doc: &Html,
    rule: &FileLinkRule,
    base_url: &str,
    kind: FileKind,
) -> Vec<FileLink> {
    let Some(container_selector) = parse_selector(&rule.container) else {
        return Vec::new();
    };
    let Some(container) = doc.select(&container_selector).next() else {
        return Vec::new();
    };
    let Some(link_selector) = parse_selector(&rule.links) else {
        return Vec::new();
    };

    let extension = match kind {
        FileKind::Pdf => ".pdf",
        FileKind::Docx => ".docx",
    };

    let mut links = Vec::new();
    for anchor in container.select(&link_selector) {
        let href = anchor
            .value()
            .attr("href")
            .or_else(|| anchor.value().attr("src"));
        let Some(url) = href.and_then(|href| normalize_url(base_url, href)) else {
            continue;
        };
        if !url.to_lowercase().ends_with(extension) {
            continue;
        }
        let text = element_text(&anchor);
        links.push(FileLink {
            url,
            filename: (!text.is_empty()).then_some(text),
            kind,
        });
    }
    links
}

/// Resolve a viewer iframe to the real PDF URL, either via its `file=`
/// query parameter or directly when the source already points at a PDF.
fn resolve_embedded_pdf(
    doc: &Html,
    rule: &EmbeddedPdfRule,
    base_url: &str,
) -> Option<EmbeddedPdf> {
    let viewer_selector = parse_selector(&rule.viewer)?;
    let viewer = doc.select(&viewer_selector).next()?;

    let src = rule
        .attributes
        .iter()
        .find_map(|attr| viewer.value().attr(attr))
        .map(str::trim)
        .filter(|src| !src.is_empty())?;
    let viewer_url = normalize_url(base_url, src)?;

    let file_param = Url::parse(&viewer_url).ok().and_then(|parsed| {
        parsed
            .query_pairs()
            .find(|(key, _)| key == "file")
            .map(|(_, value)| value.into_owned())
    });

    let pdf_url = match file_param {
        Some(file) => normalize_url(base_url, &file)?,
        None if viewer_url.to_lowercase().ends_with(".pdf") => viewer_url.clone(),
        None => return None,
    };

    Some(EmbeddedPdf {
        pdf_url,
        viewer_url: rule.pre_visit.then_some(viewer_url),
    })
}

fn collect_script_pdf_urls(doc: &Html, rule: &ScriptPdfRule, base_url: &str) -> Vec<String> {
    let Some(script_selector) = parse_selector(&rule.scripts) else {
        return Vec::new();
    };
    let Ok(call_pattern) = Regex::new(r#"showVsbpdfIframe\(["']([^"']+?\.pdf)["']"#) else {
        return Vec::new();
    };

    let mut urls = Vec::new();
    for script in doc.select(&script_selector) {
        let body: String = script.text().collect();
        if let Some(caps) = call_pattern.captures(&body) {
            if let Some(url) = normalize_url(base_url, &caps[1]) {
                urls.push(url);
            }
        }
    }
    urls
}

/// Merge base text, the OCR block, and the attachment snippet block with
/// blank lines between non-empty blocks.
pub fn aggregate_content(
    text: &str,
    image_texts: &[String],
    attachment_snippets: &[String],
) -> String {
    let mut chunks = Vec::new();
    if !text.is_empty() {
        chunks.push(text.to_string());
    }
    if !image_texts.is_empty() {
        chunks.push(image_texts.join("\n"));
    }
    if !attachment_snippets.is_empty() {
        chunks.push(attachment_snippets.join("\n"));
    }
    chunks.join("\n\n")
}

/// Marker line plus the attachment's text, for inclusion in the aggregated
/// content.
pub fn attachment_snippet(attachment: &Attachment) -> String {
    let title = attachment
        .filename
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(&attachment.url);
    format!("【附件：{}】\n{}", title, attachment.text.as_deref().unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use async_trait::async_trait;

    struct StubFetch {
        bodies: HashMap<String, Vec<u8>>,
    }

    impl StubFetch {
        fn empty() -> Self {
            Self {
                bodies: HashMap::new(),
            }
        }

        fn with_body(url: &str, bytes: &[u8]) -> Self {
            let mut bodies = HashMap::new();
            bodies.insert(url.to_string(), bytes.to_vec());
            Self { bodies }
        }

        fn refuse(&self, url: &str) -> FetchError {
            FetchError {
                url: url.to_string(),
                attempts: 1,
            }
        }
    }

    #[async_trait]
    impl Fetch for StubFetch {
        async fn get_text(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<String, FetchError> {
            Err(self.refuse(url))
        }

        async fn get_bytes(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<Vec<u8>, FetchError> {
            self.bodies.get(url).cloned().ok_or_else(|| self.refuse(url))
        }

        async fn post_api(
            &self,
            url: &str,
            _payload: &HashMap<String, String>,
            _headers: &HashMap<String, String>,
        ) -> Result<serde_json::Value, FetchError> {
            Err(self.refuse(url))
        }
    }

    fn text_only_selectors(container: &str, content: Option<&str>) -> DetailSelectors {
        DetailSelectors {
            text: Some(TextRule {
                container: container.to_string(),
                content: content.map(str::to_string),
            }),
            ..DetailSelectors::default()
        }
    }

    #[test]
    fn text_extraction_prefers_paragraphs_and_skips_scripts() {
        let html = r#"
            <div id="body">
                <p>第一段 内容</p>
                <p><script>var x = 1;</script>第二段</p>
            </div>"#;
        let selectors = text_only_selectors("#body", Some(".content"));
        let plan = build_plan(html, "https://a.b", &selectors);
        assert_eq!(plan.text, "第一段 内容\n第二段");
    }

    #[test]
    fn text_extraction_uses_content_nodes_without_paragraphs() {
        let html = r#"
            <div id="body">
                <div class="content">block one</div>
                <div class="content">block two</div>
            </div>"#;
        let selectors = text_only_selectors("#body", Some(".content"));
        let plan = build_plan(html, "https://a.b", &selectors);
        assert_eq!(plan.text, "block one\nblock two");
    }

    #[test]
    fn text_extraction_whole_container_without_content_selector() {
        let html = r#"<div id="body"><span>left</span> <span>right</span></div>"#;
        let selectors = text_only_selectors("#body", None);
        let plan = build_plan(html, "https://a.b", &selectors);
        assert_eq!(plan.text, "left right");
    }

    #[test]
    fn file_links_filter_by_extension_and_take_link_text() {
        let html = r#"
            <div id="att">
                <a href="/files/report.pdf">年度报告</a>
                <a href="/files/notes.docx">会议纪要</a>
                <a href="/files/picture.png">图片</a>
            </div>"#;
        let selectors = DetailSelectors {
            pdf_links: Some(FileLinkRule {
                container: "#att".to_string(),
                links: "a".to_string(),
            }),
            docx_links: Some(FileLinkRule {
                container: "#att".to_string(),
                links: "a".to_string(),
            }),
            ..DetailSelectors::default()
        };
        let plan = build_plan(html, "https://a.b", &selectors);
        assert_eq!(plan.file_links.len(), 2);
        assert_eq!(plan.file_links[0].url, "https://a.b/files/report.pdf");
        assert_eq!(plan.file_links[0].filename.as_deref(), Some("年度报告"));
        assert_eq!(plan.file_links[0].kind, FileKind::Pdf);
        assert_eq!(plan.file_links[1].kind, FileKind::Docx);
    }

    #[test]
    fn embedded_viewer_resolves_file_param() {
        let html = r#"<iframe class="pdf" src="/viewer.html?file=%2Fdocs%2Fplan.pdf"></iframe>"#;
        let selectors = DetailSelectors {
            embedded_pdf: Some(EmbeddedPdfRule {
                viewer: "iframe.pdf".to_string(),
                attributes: vec!["src".to_string(), "data-src".to_string()],
                pre_visit: false,
            }),
            ..DetailSelectors::default()
        };
        let plan = build_plan(html, "https://a.b", &selectors);
        let embedded = plan.embedded.unwrap();
        assert_eq!(embedded.pdf_url, "https://a.b/docs/plan.pdf");
        assert!(embedded.viewer_url.is_none());
    }

    #[test]
    fn embedded_viewer_falls_back_to_data_src() {
        let html = r#"<iframe class="pdf" data-src="https://a.b/files/direct.pdf"></iframe>"#;
        let selectors = DetailSelectors {
            embedded_pdf: Some(EmbeddedPdfRule {
                viewer: "iframe.pdf".to_string(),
                attributes: vec!["src".to_string(), "data-src".to_string()],
                pre_visit: true,
            }),
            ..DetailSelectors::default()
        };
        let plan = build_plan(html, "https://a.b", &selectors);
        let embedded = plan.embedded.unwrap();
        assert_eq!(embedded.pdf_url, "https://a.b/files/direct.pdf");
        assert_eq!(
            embedded.viewer_url.as_deref(),
            Some("https://a.b/files/direct.pdf")
        );
    }

    #[test]
    fn script_pdf_urls_come_from_call_pattern() {
        let html = r#"
            <div class="article">
                <script>showVsbpdfIframe("/attach/2024/plan.pdf", "100%", "600");</script>
                <script>console.log("no pdf here");</script>
            </div>"#;
        let selectors = DetailSelectors {
            script_pdf: Some(ScriptPdfRule {
                scripts: ".article script".to_string(),
            }),
            ..DetailSelectors::default()
        };
        let plan = build_plan(html, "https://a.b", &selectors);
        assert_eq!(plan.script_pdf_urls, vec!["https://a.b/attach/2024/plan.pdf"]);
    }

    #[test]
    fn aggregation_layout_matches_marker_format() {
        let attachment = Attachment {
            url: "https://a.b/f.pdf".to_string(),
            filename: Some("f.pdf".to_string()),
            mime_type: Some(PDF_MIME.to_string()),
            text: Some("C".to_string()),
        };
        let snippets = vec![attachment_snippet(&attachment)];
        let content = aggregate_content("A", &["B".to_string()], &snippets);
        assert_eq!(content, "A\n\nB\n\n【附件：f.pdf】\nC");
    }

    #[test]
    fn aggregation_skips_empty_blocks() {
        assert_eq!(aggregate_content("A", &[], &[]), "A");
        assert_eq!(aggregate_content("", &["B".to_string()], &[]), "B");
        assert_eq!(aggregate_content("", &[], &[]), "");
    }

    #[test]
    fn snippet_falls_back_to_url_without_filename() {
        let attachment = Attachment {
            url: "https://a.b/f.pdf".to_string(),
            filename: None,
            mime_type: None,
            text: Some("body".to_string()),
        };
        assert_eq!(
            attachment_snippet(&attachment),
            "【附件：https://a.b/f.pdf】\nbody"
        );
    }

    #[tokio::test]
    async fn failed_direct_download_is_dropped_but_script_link_kept() {
        let html = r#"
            <div id="att"><a href="https://a.b/gone.pdf">missing</a></div>
            <div class="article">
                <script>showVsbpdfIframe("https://a.b/also-gone.pdf", "w");</script>
            </div>"#;
        let selectors = DetailSelectors {
            pdf_links: Some(FileLinkRule {
                container: "#att".to_string(),
                links: "a".to_string(),
            }),
            script_pdf: Some(ScriptPdfRule {
                scripts: ".article script".to_string(),
            }),
            ..DetailSelectors::default()
        };

        let fetcher = StubFetch::empty();
        let extraction = extract_detail(
            &fetcher,
            &OcrEngine::default(),
            html,
            "https://a.b/news/1.htm",
            "https://a.b",
            &HashMap::new(),
            Some(&selectors),
        )
        .await;

        assert_eq!(extraction.attachments.len(), 1);
        let kept = &extraction.attachments[0];
        assert_eq!(kept.url, "https://a.b/also-gone.pdf");
        assert_eq!(kept.text.as_deref(), Some(""));
        // Empty-text attachments never appear in the content block.
        assert_eq!(extraction.content, "");
    }

    #[tokio::test]
    async fn unparseable_attachment_is_recorded_with_empty_text() {
        let html = r#"
            <div id="body"><p>正文</p></div>
            <div id="att"><a href="https://a.b/broken.pdf">附件一</a></div>"#;
        let selectors = DetailSelectors {
            text: Some(TextRule {
                container: "#body".to_string(),
                content: Some("p".to_string()),
            }),
            pdf_links: Some(FileLinkRule {
                container: "#att".to_string(),
                links: "a".to_string(),
            }),
            ..DetailSelectors::default()
        };

        let fetcher = StubFetch::with_body("https://a.b/broken.pdf", b"not a pdf");
        let extraction = extract_detail(
            &fetcher,
            &OcrEngine::default(),
            html,
            "https://a.b/news/1.htm",
            "https://a.b",
            &HashMap::new(),
            Some(&selectors),
        )
        .await;

        assert_eq!(extraction.content, "正文");
        assert_eq!(extraction.attachments.len(), 1);
        assert_eq!(extraction.attachments[0].filename.as_deref(), Some("附件一"));
        assert_eq!(extraction.attachments[0].text.as_deref(), Some(""));
    }
}
