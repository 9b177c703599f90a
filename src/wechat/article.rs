use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::{extract::element_text, util::time::parse_datetime};

/// Phrases the MP platform renders instead of an article when it has been
/// deleted, blocked or rate-limited. Checked on the raw HTML before any
/// parsing.
const DELETED_MARKERS: [&str; 5] = [
    "该内容已被发布者删除",
    "此内容因违规无法查看",
    "此内容被投诉且经审核涉嫌侵权",
    "该公众号已迁移",
    "环境异常",
];

pub fn deleted_marker(html: &str) -> Option<&'static str> {
    DELETED_MARKERS
        .iter()
        .copied()
        .find(|marker| html.contains(marker))
}

#[derive(Debug, Default)]
pub struct ParsedArticle {
    pub title: Option<String>,
    pub author: Option<String>,
    pub content: String,
    pub publish_time: Option<DateTime<Utc>>,
    /// Raw script value kept even when it does not parse to a timestamp.
    pub raw_publish_time: Option<String>,
}

/// Parse one article page: title, author, rendered body text and the
/// publish time hidden in inline script variables.
pub fn parse_article(html: &str) -> ParsedArticle {
    let doc = Html::parse_document(html);

    let title = select_text(&doc, "h1").or_else(|| meta_property(&doc, "og:title"));
    let author = select_text(&doc, "#js_name").or_else(|| meta_name(&doc, "author"));

    let mut content = rich_text(&doc);
    if content.is_empty() {
        // Image-only and card articles keep their summary in OG tags.
        content = meta_property(&doc, "og:description")
            .map(|desc| html_escape::decode_html_entities(&desc).into_owned())
            .or_else(|| {
                meta_property(&doc, "og:image")
                    .map(|image| format!("[图片消息]\n![image]({image})"))
            })
            .unwrap_or_default();
    }

    let raw_publish_time = script_time_value(html);
    let publish_time = raw_publish_time.as_deref().and_then(parse_datetime);

    ParsedArticle {
        title,
        author,
        content,
        publish_time,
        raw_publish_time,
    }
}

fn select_text(doc: &Html, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    let element = doc.select(&parsed).next()?;
    let text = element_text(&element);
    (!text.is_empty()).then_some(text)
}

fn meta_property(doc: &Html, property: &str) -> Option<String> {
    meta_attr(doc, &format!(r#"meta[property="{property}"]"#))
}

fn meta_name(doc: &Html, name: &str) -> Option<String> {
    meta_attr(doc, &format!(r#"meta[name="{name}"]"#))
}

fn meta_attr(doc: &Html, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    let content = doc
        .select(&parsed)
        .next()?
        .value()
        .attr("content")?
        .trim()
        .to_string();
    (!content.is_empty()).then_some(content)
}

const BLOCK_TAGS: [&str; 12] = [
    "p",
    "div",
    "section",
    "li",
    "blockquote",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "tr",
];

/// Walk the rich-content container rendering a plain-text view:
/// line breaks stay line breaks, images become their own markdown line,
/// block elements terminate a line.
fn rich_text(doc: &Html) -> String {
    let Ok(container_selector) = Selector::parse("#js_content") else {
        return String::new();
    };
    let Some(container) = doc.select(&container_selector).next() else {
        return String::new();
    };

    let mut rendered = String::new();
    render_node(container, &mut rendered);
    collapse_blank_lines(&rendered)
}

fn render_node(element: ElementRef, out: &mut String) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            let name = child_element.value().name();
            match name {
                "script" | "style" => {}
                "br" => out.push('\n'),
                "img" => {
                    let src = child_element
                        .value()
                        .attr("data-src")
                        .or_else(|| child_element.value().attr("src"));
                    if let Some(src) = src.map(str::trim).filter(|src| !src.is_empty()) {
                        if !out.is_empty() && !out.ends_with('\n') {
                            out.push('\n');
                        }
                        out.push_str("![image](");
                        out.push_str(src);
                        out.push_str(")\n");
                    }
                }
                _ => {
                    render_node(child_element, out);
                    if BLOCK_TAGS.contains(&name) && !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
            }
        } else if let Some(text) = child.value().as_text() {
            let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !normalized.is_empty() {
                out.push_str(&normalized);
            }
        }
    }
}

fn collapse_blank_lines(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(blank) = Regex::new(r"\n\s*\n") else {
        return trimmed.to_string();
    };
    blank.replace_all(trimmed, "\n").into_owned()
}

/// First script-embedded time value, in the platform's variable priority
/// order. Accepts quoted strings and bare numbers.
fn script_time_value(html: &str) -> Option<String> {
    for variable in ["createTime", "ct", "publish_time"] {
        let Ok(pattern) = Regex::new(&format!(
            r#"\b{variable}\b\s*=\s*(?:"([^"]*)"|'([^']*)'|(\d+))"#
        )) else {
            continue;
        };
        let Some(caps) = pattern.captures(html) else {
            continue;
        };
        let value = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|group| group.as_str().trim().to_string());
        if let Some(value) = value.filter(|value| !value.is_empty()) {
            return Some(value);
        }
    }
    None
}
