use regex::Regex;
use scraper::{Html, Selector};

/// Page URLs for forward pagination, page 1 first. URLs carrying a
/// `listN.htm` segment get the page number substituted into it; anything
/// else falls back to a `page=N` query parameter.
pub fn forward_page_urls(list_url: &str, max_pages: u32) -> Vec<String> {
    let mut urls = vec![list_url.to_string()];
    if max_pages <= 1 {
        return urls;
    }

    let pattern = Regex::new(r"(?i)(list)(\d+)(\.htm)").ok();
    let located = pattern.as_ref().and_then(|pattern| pattern.captures(list_url));
    for page in 2..=max_pages {
        match located.as_ref().and_then(|caps| caps.get(0).zip(caps.get(3))) {
            Some((whole, suffix)) => urls.push(format!(
                "{}list{}{}{}",
                &list_url[..whole.start()],
                page,
                suffix.as_str(),
                &list_url[whole.end()..]
            )),
            None => {
                let separator = if list_url.contains('?') { '&' } else { '?' };
                urls.push(format!("{list_url}{separator}page={page}"));
            }
        }
    }
    urls
}

/// Page URLs for reverse pagination, newest additional page first. The
/// caller fetches page 1 itself (its markup carries the max page index);
/// this walks `max_page - 1` down to 1, capped at `max_pages - 1` URLs.
pub fn reverse_page_urls(list_url: &str, max_page: u32, max_pages: u32) -> Vec<String> {
    (1..max_page)
        .rev()
        .take(max_pages.saturating_sub(1) as usize)
        .map(|page| insert_page_segment(list_url, page))
        .collect()
}

/// `list.htm` becomes `list/7.htm`: the page number goes in as a path
/// segment ahead of the file extension.
fn insert_page_segment(list_url: &str, page: u32) -> String {
    let segment_start = list_url.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match list_url[segment_start..].rfind('.') {
        Some(offset) => {
            let dot = segment_start + offset;
            format!("{}/{}{}", &list_url[..dot], page, &list_url[dot..])
        }
        None => format!("{}/{}", list_url.trim_end_matches('/'), page),
    }
}

/// Highest page index advertised by a list page's own pagination block.
/// Only anchors shaped like this list's own page URLs count, so content
/// links with numeric filenames stay out of the result.
pub fn max_page_index(html: &str, list_url: &str) -> Option<u32> {
    let segment_start = list_url.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    let segment = &list_url[segment_start..];
    let (stem, extension) = match segment.rfind('.') {
        Some(dot) => (&segment[..dot], &segment[dot..]),
        None => (segment, ""),
    };
    if stem.is_empty() {
        return None;
    }

    let page_href = Regex::new(&format!(
        r"(?i)(?:^|/){}/(\d+){}$",
        regex::escape(stem),
        regex::escape(extension)
    ))
    .ok()?;

    let document = Html::parse_document(html);
    let anchor_selector = Selector::parse("a").ok()?;
    document
        .select(&anchor_selector)
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| {
            page_href
                .captures(href)
                .and_then(|caps| caps[1].parse::<u32>().ok())
        })
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_substitutes_into_list_pattern() {
        let urls = forward_page_urls("https://news.example.edu/zcfg/list1.htm", 3);
        assert_eq!(
            urls,
            vec![
                "https://news.example.edu/zcfg/list1.htm",
                "https://news.example.edu/zcfg/list2.htm",
                "https://news.example.edu/zcfg/list3.htm",
            ]
        );
    }

    #[test]
    fn forward_pattern_is_case_insensitive() {
        let urls = forward_page_urls("https://a.b/List7.HTM", 2);
        assert_eq!(urls[1], "https://a.b/list2.HTM");
    }

    #[test]
    fn forward_keeps_text_after_the_pattern() {
        let urls = forward_page_urls("https://a.b/zcfg/list1.htm?lang=zh", 2);
        assert_eq!(urls[1], "https://a.b/zcfg/list2.htm?lang=zh");
    }

    #[test]
    fn forward_appends_query_without_pattern() {
        let urls = forward_page_urls("https://a.b/news", 2);
        assert_eq!(urls, vec!["https://a.b/news", "https://a.b/news?page=2"]);

        let urls = forward_page_urls("https://a.b/news?cat=5", 2);
        assert_eq!(urls[1], "https://a.b/news?cat=5&page=2");
    }

    #[test]
    fn forward_single_page_is_just_the_list_url() {
        assert_eq!(
            forward_page_urls("https://a.b/list1.htm", 1),
            vec!["https://a.b/list1.htm"]
        );
    }

    #[test]
    fn reverse_walks_down_from_max_page() {
        let urls = reverse_page_urls("https://a.b/tzgg/list.htm", 8, 3);
        assert_eq!(
            urls,
            vec!["https://a.b/tzgg/list/7.htm", "https://a.b/tzgg/list/6.htm"]
        );
    }

    #[test]
    fn reverse_stops_at_page_one() {
        let urls = reverse_page_urls("https://a.b/list.htm", 3, 10);
        assert_eq!(
            urls,
            vec!["https://a.b/list/2.htm", "https://a.b/list/1.htm"]
        );
    }

    #[test]
    fn reverse_without_max_page_yields_nothing() {
        assert!(reverse_page_urls("https://a.b/list.htm", 1, 5).is_empty());
        assert!(reverse_page_urls("https://a.b/list.htm", 0, 5).is_empty());
    }

    #[test]
    fn max_page_index_reads_pagination_anchors() {
        let html = r#"
            <div class="page">
                <a href="list/2.htm">2</a>
                <a href="/tzgg/list/3.htm">3</a>
                <a href="list/34.htm">尾页</a>
                <a href="content_2024.htm">不是分页</a>
                <a href="/info/1002/8354.htm">正文链接</a>
            </div>"#;
        assert_eq!(
            max_page_index(html, "https://a.b/tzgg/list.htm"),
            Some(34)
        );
    }

    #[test]
    fn max_page_index_absent_without_page_links() {
        assert_eq!(
            max_page_index("<div><a href='/about'>关于</a></div>", "https://a.b/list.htm"),
            None
        );
    }
}
