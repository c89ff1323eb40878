use anyhow::Context as _;
use url::Url;

use crate::document::{Document, SelectorPath};
use crate::formats::SiteConfig;
use crate::resolve::resolve_field;

/// What one listing page yields: detail links and the page after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub links: Vec<Url>,
    pub next: Option<Url>,
}

impl ListingPage {
    pub fn first_link(&self) -> Option<&Url> {
        self.links.first()
    }
}

/// Evaluates `list_page_check` and the pagination settings against one page.
pub fn scan_listing(html: &str, config: &SiteConfig, page_url: &Url) -> anyhow::Result<ListingPage> {
    let document = Document::parse(html);
    let links = discover_links(&document, config, page_url)?;
    let next = next_page_url(&document, config, page_url)?;
    Ok(ListingPage { links, next })
}

/// Absolute, de-duplicated detail links in document order.
pub fn discover_links(
    document: &Document,
    config: &SiteConfig,
    base: &Url,
) -> anyhow::Result<Vec<Url>> {
    let Some(path) = config.list_page_check.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    let path = SelectorPath::parse(path).context("list_page_check")?;

    let mut links: Vec<Url> = Vec::new();
    for href in document.select_links(&path) {
        let Some(url) = resolve_link(base, &href) else {
            tracing::debug!(href = %href, "skipping listing link");
            continue;
        };
        if !links.contains(&url) {
            links.push(url);
        }
    }
    Ok(links)
}

/// The following listing page: the `next_page` element's link when
/// configured, otherwise the `page_query` parameter incremented by one.
pub fn next_page_url(
    document: &Document,
    config: &SiteConfig,
    current: &Url,
) -> anyhow::Result<Option<Url>> {
    if let Some(path) = config.next_page.as_deref().filter(|p| !p.trim().is_empty()) {
        let path = SelectorPath::parse(path).context("next_page")?;
        let next = document
            .select_links(&path)
            .into_iter()
            .find_map(|href| resolve_link(current, &href));
        return Ok(next.filter(|next| next != current));
    }

    if let Some(param) = config.page_query.as_deref().filter(|p| !p.trim().is_empty()) {
        return Ok(Some(increment_page_query(current, param.trim())));
    }

    Ok(None)
}

/// Sets `param` to its current value plus one; a missing or non-numeric
/// value counts as page 1.
pub fn increment_page_query(url: &Url, param: &str) -> Url {
    let mut page = 1u64;
    let mut pairs: Vec<(String, String)> = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == param {
            page = value.trim().parse::<u64>().unwrap_or(1);
            continue;
        }
        pairs.push((key.into_owned(), value.into_owned()));
    }
    pairs.push((param.to_owned(), page.saturating_add(1).to_string()));

    let mut next = url.clone();
    next.query_pairs_mut().clear().extend_pairs(pairs);
    next
}

/// A start URL is a detail page when the probe field resolves by rules.
pub fn looks_like_detail(html: &str, config: &SiteConfig) -> bool {
    let Some((name, rule)) = config.probe_field() else {
        return false;
    };
    let outcome = resolve_field(&Document::parse(html), rule);
    tracing::debug!(field = name, resolved = outcome.is_resolved(), "probe field");
    outcome.is_resolved()
}

fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{FieldMap, FieldRule};

    fn config() -> SiteConfig {
        SiteConfig {
            website: "homes.example".to_owned(),
            fields: [("Название".to_owned(), FieldRule::new("h1.title"))]
                .into_iter()
                .collect::<FieldMap>(),
            list_page_check: Some("article.card a.link".to_owned()),
            page_query: None,
            next_page: None,
            probe_field: None,
            media: Default::default(),
            render: Default::default(),
        }
    }

    const LISTING: &str = r#"
<html><body>
  <article class="card"><a class="link" href="/listing/1#photos">One</a></article>
  <article class="card"><a class="link" href="listing/2?ref=list">Two</a></article>
  <article class="card"><a class="link" href="/listing/1">One again</a></article>
  <article class="card"><a class="link" href="javascript:void(0)">Ad</a></article>
  <nav><a class="next" href="/search?page=3">Next</a></nav>
</body></html>
"#;

    fn base() -> Url {
        Url::parse("https://homes.example/search?page=2").unwrap()
    }

    #[test]
    fn links_are_absolute_and_unique() -> anyhow::Result<()> {
        let page = scan_listing(LISTING, &config(), &base())?;
        let links = page.links.iter().map(Url::as_str).collect::<Vec<_>>();
        assert_eq!(
            links,
            vec![
                "https://homes.example/listing/1",
                "https://homes.example/listing/2?ref=list"
            ]
        );
        assert_eq!(page.next, None);
        Ok(())
    }

    #[test]
    fn next_page_link_wins_over_query() -> anyhow::Result<()> {
        let mut config = config();
        config.next_page = Some("nav a.next".to_owned());
        config.page_query = Some("page".to_owned());
        let page = scan_listing(LISTING, &config, &base())?;
        assert_eq!(
            page.next.as_ref().map(Url::as_str),
            Some("https://homes.example/search?page=3")
        );
        Ok(())
    }

    #[test]
    fn next_page_pointing_at_itself_stops() -> anyhow::Result<()> {
        let mut config = config();
        config.next_page = Some("nav a.next".to_owned());
        let current = Url::parse("https://homes.example/search?page=3")?;
        assert_eq!(scan_listing(LISTING, &config, &current)?.next, None);
        Ok(())
    }

    #[test]
    fn page_query_is_incremented() {
        let url = Url::parse("https://homes.example/search?city=lisbon&page=2").unwrap();
        assert_eq!(
            increment_page_query(&url, "page").as_str(),
            "https://homes.example/search?city=lisbon&page=3"
        );

        let first = Url::parse("https://homes.example/search?city=lisbon").unwrap();
        assert_eq!(
            increment_page_query(&first, "p").as_str(),
            "https://homes.example/search?city=lisbon&p=2"
        );
    }

    #[test]
    fn invalid_listing_selector_is_an_error() {
        let mut config = config();
        config.list_page_check = Some("article a[".to_owned());
        assert!(scan_listing(LISTING, &config, &base()).is_err());
    }

    #[test]
    fn legacy_xpath_listing_selector_finds_same_links() -> anyhow::Result<()> {
        let mut legacy = config();
        legacy.list_page_check = Some("//article[@class='card']/a/@href".to_owned());
        legacy.next_page = Some("//nav/a[contains(@class, 'next')]".to_owned());
        let mut css = config();
        css.next_page = Some("nav a.next".to_owned());

        let legacy = scan_listing(LISTING, &legacy, &base())?;
        let css = scan_listing(LISTING, &css, &base())?;
        assert_eq!(legacy.links, css.links);
        assert_eq!(legacy.next, css.next);
        Ok(())
    }

    #[test]
    fn probe_field_decides_detail_pages() {
        assert!(!looks_like_detail(LISTING, &config()));
        assert!(looks_like_detail(
            "<html><body><h1 class=\"title\">Villa</h1></body></html>",
            &config()
        ));
    }
}
