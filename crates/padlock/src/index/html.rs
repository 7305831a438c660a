//! Parsing of PEP 503 simple-index pages.

use crate::types::{Link, ProjectKey};
use miette::{miette, IntoDiagnostic};
use tl::HTMLTag;
use url::Url;

/// Everything a project page tells us: the artifact links and the index
/// repository version advertised by the page.
#[derive(Debug, Default, Clone)]
pub struct ProjectPage {
    /// The simple API repository version, e.g. "1.0".
    pub repository_version: String,
    /// One link per artifact anchor, in page order.
    pub links: Vec<Link>,
}

fn link_from_anchor(base: &Url, tag: &HTMLTag<'_>) -> Option<Link> {
    let attributes = tag.attributes();
    let href = attributes.get("href").flatten()?.as_utf8_str();
    let url = base.join(href.as_ref()).ok()?;

    let mut link = Link::new(url);
    link.comes_from = Some(base.to_string());

    link.requires_python = attributes
        .get("data-requires-python")
        .flatten()
        .map(|a| html_escape::decode_html_entities(a.as_utf8_str().as_ref()).into_owned())
        .filter(|v| !v.is_empty());

    link.dist_info_metadata = attributes
        .get("data-dist-info-metadata")
        .flatten()
        .is_some()
        || attributes.get("data-core-metadata").flatten().is_some();

    if let Some(reason) = attributes.get("data-yanked").flatten() {
        link.yank_reason = Some(reason.as_utf8_str().into_owned());
    }

    Some(link)
}

/// Parses a project's simple-index page into its artifact links.
pub fn parse_project_page(base: &Url, body: &str) -> miette::Result<ProjectPage> {
    let dom = tl::parse(body, tl::ParserOptions::default()).into_diagnostic()?;
    let mut page = ProjectPage::default();

    page.repository_version = dom
        .query_selector("meta[name=\"pypi:repository-version\"]")
        .and_then(|mut nodes| nodes.next())
        .and_then(|node| node.get(dom.parser()))
        .and_then(|node| node.as_tag())
        .and_then(|tag| tag.attributes().get("content"))
        .flatten()
        .map(|value| value.as_utf8_str().into_owned())
        .unwrap_or_default();

    // a <base href> redirects all relative anchors
    let base = dom
        .query_selector("base")
        .and_then(|mut nodes| nodes.next())
        .and_then(|node| node.get(dom.parser()))
        .and_then(|node| node.as_tag())
        .and_then(|tag| tag.attributes().get("href"))
        .flatten()
        .and_then(|value| Url::parse(value.as_utf8_str().as_ref()).ok())
        .unwrap_or_else(|| base.clone());

    if let Some(anchors) = dom.query_selector("a") {
        for anchor in anchors {
            let Some(tag) = anchor.get(dom.parser()).and_then(|n| n.as_tag()) else {
                continue;
            };
            if let Some(link) = link_from_anchor(&base, tag) {
                page.links.push(link);
            }
        }
    }

    Ok(page)
}

/// Extracts the project key a page URL refers to: its last non-empty path
/// segment.
pub fn project_key_from_url(url: &Url) -> miette::Result<ProjectKey> {
    let segment = url
        .path_segments()
        .and_then(|segments| segments.rev().find(|s| !s.is_empty()))
        .ok_or_else(|| miette!("no package segments found in url '{url}'"))?;
    segment
        .parse()
        .into_diagnostic()
        .map_err(|e| miette!("cannot parse '{segment}' from url '{url}' as a project key: {e}"))
}

#[cfg(test)]
mod test {
    use super::*;

    const PAGE: &str = r#"
<html><head><meta name="pypi:repository-version" content="1.0"></head>
<body>
  <a href="/files/demo-0.0.1-py2.py3-none-any.whl#sha256=abcd"
     data-requires-python="&gt;=3.6">demo-0.0.1-py2.py3-none-any.whl</a>
  <a href="/files/demo-0.0.1.tar.gz" data-yanked="broken release">demo-0.0.1.tar.gz</a>
  <a href="/files/demo-0.0.2-py3-none-any.whl" data-dist-info-metadata="true">other</a>
</body></html>"#;

    #[test]
    fn test_parse_project_page() {
        let base: Url = "https://example.org/simple/demo/".parse().unwrap();
        let page = parse_project_page(&base, PAGE).unwrap();
        assert_eq!(page.repository_version, "1.0");
        assert_eq!(page.links.len(), 3);

        let wheel = &page.links[0];
        assert_eq!(wheel.requires_python.as_deref(), Some(">=3.6"));
        assert_eq!(wheel.hashes.get("sha256").map(String::as_str), Some("abcd"));
        assert!(wheel.yank_reason.is_none());

        let sdist = &page.links[1];
        assert_eq!(sdist.yank_reason.as_deref(), Some("broken release"));

        assert!(page.links[2].dist_info_metadata);
    }

    #[test]
    fn test_project_key_from_url() {
        let url: Url = "https://example.org/simple/Sphinx-RTD-theme/".parse().unwrap();
        assert_eq!(
            project_key_from_url(&url).unwrap().as_str(),
            "sphinx-rtd-theme"
        );
    }
}
