use once_cell::sync::Lazy;
use regex::Regex;

static LOC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<loc>\s*(?:<!\[CDATA\[)?\s*(.*?)\s*(?:\]\]>)?\s*</loc>")
        .expect("sitemap loc regex should compile")
});

static SITEMAP_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<sitemapindex\b").expect("sitemap index regex should compile")
});

/// Entries of one sitemap document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitemapDocument {
    /// Page locations (`<urlset>`).
    pub urls: Vec<String>,
    /// Nested sitemap locations (`<sitemapindex>`).
    pub sitemaps: Vec<String>,
}

pub fn parse_sitemap(xml: &str) -> SitemapDocument {
    let locations: Vec<String> = LOC
        .captures_iter(xml)
        .filter_map(|caps| caps.get(1))
        .map(|m| unescape_xml(m.as_str()))
        .filter(|loc| !loc.is_empty())
        .collect();

    if SITEMAP_INDEX.is_match(xml) {
        SitemapDocument {
            urls: Vec::new(),
            sitemaps: locations,
        }
    } else {
        SitemapDocument {
            urls: locations,
            sitemaps: Vec::new(),
        }
    }
}

/// `Sitemap:` directives announced in a robots.txt body.
pub fn robots_sitemaps(robots: &str) -> Vec<String> {
    robots
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or_default().trim();
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("sitemap")
                .then(|| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
        .collect()
}

fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://example.com/</loc></url>
              <url>
                <loc> https://example.com/search?a=1&amp;b=2 </loc>
                <lastmod>2024-01-01</lastmod>
              </url>
              <url><loc><![CDATA[https://example.com/blog]]></loc></url>
            </urlset>"#;
        let doc = parse_sitemap(xml);
        assert_eq!(
            doc.urls,
            vec![
                "https://example.com/",
                "https://example.com/search?a=1&b=2",
                "https://example.com/blog",
            ]
        );
        assert!(doc.sitemaps.is_empty());
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"<sitemapindex>
              <sitemap><loc>https://example.com/sitemap-pages.xml</loc></sitemap>
              <sitemap><loc>https://example.com/sitemap-blog.xml</loc></sitemap>
            </sitemapindex>"#;
        let doc = parse_sitemap(xml);
        assert!(doc.urls.is_empty());
        assert_eq!(doc.sitemaps.len(), 2);
    }

    #[test]
    fn reads_robots_directives() {
        let robots = "User-agent: *\nDisallow: /admin\nSitemap: https://example.com/a.xml\nsitemap:https://example.com/b.xml # news\n";
        assert_eq!(
            robots_sitemaps(robots),
            vec!["https://example.com/a.xml", "https://example.com/b.xml"]
        );
    }
}
