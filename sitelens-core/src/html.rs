//! Lightweight HTML scraping for the inspect and link-extract stages.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::types::SeoMeta;

static ANCHOR_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .expect("anchor href regex should compile")
});
static TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").expect("title regex should compile")
});
static META: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("meta regex should compile"));
static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<link\b[^>]*>").expect("link regex should compile"));
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .expect("attribute regex should compile")
});

/// `href` targets of every anchor, resolved against `base`. Fragment-only,
/// `javascript:` and `mailto:`/`tel:` links are skipped.
pub fn extract_links(html: &str, base: &Url) -> Vec<String> {
    ANCHOR_HREF
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).or(caps.get(2)).or(caps.get(3)))
        .map(|m| decode_entities(m.as_str().trim()))
        .filter(|href| {
            !href.is_empty()
                && !href.starts_with('#')
                && !starts_with_ignore_case(href, "javascript:")
                && !starts_with_ignore_case(href, "mailto:")
                && !starts_with_ignore_case(href, "tel:")
        })
        .filter_map(|href| base.join(&href).ok())
        .map(|url| url.to_string())
        .collect()
}

/// Title, description, favicon and social image, plus internal/external
/// link counts relative to `base`'s host.
pub fn extract_seo(html: &str, base: &Url) -> SeoMeta {
    let title = TITLE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| collapse_whitespace(&decode_entities(m.as_str())))
        .filter(|t| !t.is_empty());

    let mut description = None;
    let mut og_image = None;
    for tag in META.find_iter(html) {
        let attrs = attributes(tag.as_str());
        let key = attr(&attrs, "name")
            .or_else(|| attr(&attrs, "property"))
            .map(str::to_ascii_lowercase);
        let content = attr(&attrs, "content").map(decode_entities);
        match (key.as_deref(), content) {
            (Some("description"), Some(content)) if description.is_none() => {
                description = Some(content)
            }
            (Some("og:image"), Some(content)) if og_image.is_none() => {
                og_image = base.join(&content).ok().map(|u| u.to_string())
            }
            _ => {}
        }
    }

    let favicon = LINK
        .find_iter(html)
        .map(|tag| attributes(tag.as_str()))
        .find(|attrs| {
            attr(attrs, "rel")
                .map(|rel| rel.to_ascii_lowercase().split_whitespace().any(|r| r == "icon"))
                .unwrap_or(false)
        })
        .and_then(|attrs| attr(&attrs, "href").map(str::to_string))
        .and_then(|href| base.join(&href).ok())
        .map(|u| u.to_string());

    let (internal_links, external_links) =
        extract_links(html, base)
            .iter()
            .fold((0, 0), |(internal, external), link| {
                let same_host = Url::parse(link)
                    .ok()
                    .map(|u| u.host_str() == base.host_str())
                    .unwrap_or(false);
                if same_host {
                    (internal + 1, external)
                } else {
                    (internal, external + 1)
                }
            });

    SeoMeta {
        title,
        description,
        favicon,
        og_image,
        internal_links,
        external_links,
    }
}

fn attributes(tag: &str) -> Vec<(String, String)> {
    ATTR.captures_iter(tag)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2).or(caps.get(3)).or(caps.get(4))?.as_str();
            Some((name, value.to_string()))
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
