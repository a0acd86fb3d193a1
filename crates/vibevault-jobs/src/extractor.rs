//! HTML metadata extraction.
//!
//! Turns a fetched page into a [`MetadataRecord`]. Extraction is total: any
//! input, including malformed HTML, yields a record. Each field takes the
//! first present, non-blank source in precedence order.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{Html, Selector};
use url::Url;

use vibevault_core::MetadataRecord;

const TITLE_KEYS: &[&str] = &["og:title"];
const DESCRIPTION_KEYS: &[&str] = &["og:description", "description"];
const SITE_NAME_KEYS: &[&str] = &["og:site_name"];
const IMAGE_KEYS: &[&str] = &["og:image", "twitter:image"];
const PUBLISHED_TIME_KEYS: &[&str] = &["article:published_time", "published_time"];

/// `rel` values accepted as a favicon, most preferred first.
const FAVICON_RELS: &[&str] = &["icon", "shortcut icon", "apple-touch-icon"];

/// Extract display metadata from `html` fetched from `page_url`.
pub fn extract(html: &str, page_url: &str) -> MetadataRecord {
    let document = Html::parse_document(html);
    let page = Url::parse(page_url).ok();

    let title = meta_content(&document, TITLE_KEYS).or_else(|| title_text(&document));
    let image =
        meta_content(&document, IMAGE_KEYS).map(|src| resolve_against_page(&src, page.as_ref()));
    let favicon =
        favicon_href(&document).map(|href| resolve_against_origin(&href, page.as_ref()));
    let published_time =
        meta_content(&document, PUBLISHED_TIME_KEYS).and_then(|raw| parse_published_time(&raw));

    MetadataRecord {
        title,
        description: meta_content(&document, DESCRIPTION_KEYS),
        site_name: meta_content(&document, SITE_NAME_KEYS),
        image,
        favicon,
        published_time,
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn clean(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Content of the first `<meta>` whose `property` or `name` matches a key,
/// trying keys in order.
fn meta_content(document: &Html, keys: &[&str]) -> Option<String> {
    let sel = selector("meta[content]")?;
    keys.iter().find_map(|key| {
        document.select(&sel).find_map(|el| {
            let v = el.value();
            let matches = [v.attr("property"), v.attr("name")]
                .into_iter()
                .flatten()
                .any(|k| k.trim().eq_ignore_ascii_case(key));
            if matches {
                v.attr("content").and_then(clean)
            } else {
                None
            }
        })
    })
}

fn title_text(document: &Html) -> Option<String> {
    let sel = selector("title")?;
    document
        .select(&sel)
        .find_map(|el| clean(&el.text().collect::<String>()))
}

fn normalize_rel(rel: &str) -> String {
    rel.split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn favicon_href(document: &Html) -> Option<String> {
    let sel = selector("link[rel][href]")?;
    let links: Vec<(String, &str)> = document
        .select(&sel)
        .filter_map(|el| {
            let v = el.value();
            Some((normalize_rel(v.attr("rel")?), v.attr("href")?))
        })
        .collect();

    FAVICON_RELS.iter().find_map(|wanted| {
        links
            .iter()
            .filter(|(rel, _)| rel == wanted)
            .find_map(|(_, href)| clean(href))
    })
}

fn resolve_against_page(value: &str, page: Option<&Url>) -> String {
    page.and_then(|base| base.join(value).ok())
        .map(String::from)
        .unwrap_or_else(|| value.to_string())
}

/// Resolve `value` against the page origin (`scheme://host[:port]/`).
fn resolve_against_origin(value: &str, page: Option<&Url>) -> String {
    let origin = page.map(|p| {
        let mut origin = p.clone();
        origin.set_query(None);
        origin.set_fragment(None);
        origin.set_path("/");
        origin
    });
    resolve_against_page(value, origin.as_ref())
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS` (taken as UTC), or `YYYY-MM-DD`.
fn parse_published_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
