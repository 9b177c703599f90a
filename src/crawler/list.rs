use scraper::Html;
use serde_json::Value;

use crate::{
    extract::{element_text, parse_selector},
    source::ListSelectors,
    util::url::normalize_url,
};

/// One raw row from a list page, before the detail fetch. `url` may be
/// absent when the markup carries no usable link; such rows are skipped
/// by the orchestrator.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub title: String,
    pub date: Option<String>,
    pub url: Option<String>,
    pub category: Option<String>,
}

/// Parse one HTML list page into entries via the source's selectors.
pub fn parse_list_html(html: &str, base_url: &str, selectors: &ListSelectors) -> Vec<ListEntry> {
    let Some(container_selector) = selectors
        .item_container
        .as_deref()
        .and_then(parse_selector)
    else {
        return Vec::new();
    };

    let title_selector = selectors.title.as_deref().and_then(parse_selector);
    let date_selector = selectors.date.as_deref().and_then(parse_selector);
    let url_selector = selectors.url.as_deref().and_then(parse_selector);
    let category_selector = selectors.category.as_deref().and_then(parse_selector);

    let document = Html::parse_document(html);
    let mut entries = Vec::new();
    for item in document.select(&container_selector) {
        let title = match &title_selector {
            Some(selector) => item
                .select(selector)
                .next()
                .map(|node| element_text(&node))
                .unwrap_or_default(),
            None => element_text(&item),
        };

        let date = date_selector.as_ref().and_then(|selector| {
            item.select(selector)
                .next()
                .map(|node| element_text(&node))
                .filter(|text| !text.is_empty())
        });

        let category = category_selector.as_ref().and_then(|selector| {
            item.select(selector)
                .next()
                .map(|node| element_text(&node))
                .filter(|text| !text.is_empty())
        });

        // Without a link selector the item element itself is the anchor.
        let link_element = match &url_selector {
            Some(selector) => item.select(selector).next(),
            None => Some(item),
        };
        let url = link_element
            .and_then(|node| {
                node.value()
                    .attr("href")
                    .or_else(|| node.value().attr("src"))
            })
            .and_then(|raw| normalize_url(base_url, raw));

        entries.push(ListEntry {
            title,
            date,
            url,
            category,
        });
    }
    entries
}

/// Parse one API response page. The selector fields double as JSON keys
/// here, with the upstream's conventional names as defaults.
pub fn parse_api_entries(
    response: &Value,
    base_url: &str,
    selectors: &ListSelectors,
) -> Vec<ListEntry> {
    let list_key = selectors.item_container.as_deref().unwrap_or("infolist");
    let title_key = selectors.title.as_deref().unwrap_or("title");
    let date_key = selectors.date.as_deref().unwrap_or("releasetime");
    let url_key = selectors.url.as_deref().unwrap_or("url");

    let Some(items) = response.get(list_key).and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .map(|item| ListEntry {
            title: field_text(item, title_key).unwrap_or_default(),
            date: field_text(item, date_key),
            url: field_text(item, url_key).and_then(|raw| normalize_url(base_url, &raw)),
            category: selectors.category.as_deref().and_then(|key| field_text(item, key)),
        })
        .collect()
}

fn field_text(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
