//! Plain HTTP page fetcher backed by a SearXNG-compatible JSON search endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;

use super::{PageData, PageLink, SearchHit, WebFetcher};
use crate::config::FetchConfig;

const USER_AGENT: &str = concat!("agentloop/", env!("CARGO_PKG_VERSION"));
const MAX_LINKS: usize = 100;

static TITLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static HIDDEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>|<noscript[^>]*>.*?</noscript>|<head[^>]*>.*?</head>")
        .unwrap()
});
static BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|ul|ol|h[1-6]|tr|table|section|article|header|footer|blockquote)\b[^>]*>")
        .unwrap()
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap()
});

pub struct HttpFetcher {
    http: reqwest::Client,
    search_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

impl HttpFetcher {
    pub fn new(search_url: impl Into<String>, config: &FetchConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            search_url: search_url.into(),
        })
    }
}

#[async_trait]
impl WebFetcher for HttpFetcher {
    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchHit>> {
        let response: SearchResponse = self
            .http
            .get(&self.search_url)
            .query(&[("q", query), ("format", "json")])
            .send()
            .await
            .with_context(|| format!("search request to {} failed", self.search_url))?
            .error_for_status()?
            .json()
            .await
            .context("malformed search response")?;

        Ok(response
            .results
            .into_iter()
            .take(max_results)
            .map(|result| SearchHit {
                title: result.title,
                url: result.url,
                snippet: result.content,
            })
            .collect())
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<PageData> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            return Ok(PageData::failed(url, format!("HTTP {status}")));
        }
        let html = response.text().await.context("unreadable page body")?;
        Ok(extract_page(url, &html))
    }
}

/// Title, block-separated text and outgoing links of an HTML document.
fn extract_page(url: &str, html: &str) -> PageData {
    let title = TITLE_RE
        .captures(html)
        .map(|caps| clean_inline(&caps[1]))
        .unwrap_or_default();

    let base = Url::parse(url).ok();
    let links = LINK_RE
        .captures_iter(html)
        .filter_map(|caps| {
            let target = match &base {
                Some(base) => base.join(caps[1].trim()).ok()?,
                None => Url::parse(caps[1].trim()).ok()?,
            };
            matches!(target.scheme(), "http" | "https").then(|| PageLink {
                url: target.to_string(),
                text: clean_inline(&caps[2]),
            })
        })
        .take(MAX_LINKS)
        .collect();

    let body = HIDDEN_RE.replace_all(html, " ");
    let body = BLOCK_RE.replace_all(&body, "\n");
    let body = TAG_RE.replace_all(&body, " ");
    let text = decode_entities(&body)
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    PageData {
        url: url.to_string(),
        title,
        text,
        links,
        tables: Vec::new(),
        success: true,
        error: None,
    }
}

fn clean_inline(fragment: &str) -> String {
    let text = TAG_RE.replace_all(fragment, " ");
    decode_entities(&text).split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>Pixel 9 &amp; camera</title>
<style>body { color: red }</style></head>
<body><script>var x = 1;</script>
<h1>Pixel 9 review</h1>
<p>The main sensor has   50 megapixels.</p>
<p>See <a href="/battery">battery <b>test</b></a> and
<a href="mailto:me@example.com">mail</a> or <a href='https://other.example/x'>other</a>.</p>
</body></html>"#;

    #[test]
    fn extracts_title_text_and_absolute_links() {
        let page = extract_page("https://a.example/review", PAGE);

        assert!(page.success);
        assert_eq!(page.title, "Pixel 9 & camera");
        let lines: Vec<&str> = page.text.lines().collect();
        assert_eq!(lines[0], "Pixel 9 review");
        assert_eq!(lines[1], "The main sensor has 50 megapixels.");
        assert!(!page.text.contains("var x"));
        assert!(!page.text.contains("color: red"));

        let urls: Vec<&str> = page.links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example/battery", "https://other.example/x"]);
        assert_eq!(page.links[0].text, "battery test");
    }

    #[test]
    fn search_payload_maps_to_hits() {
        let response: SearchResponse = serde_json::from_str(
            r#"{"results": [{"title": "A", "url": "https://a.example", "content": "snippet"}, {"url": "https://b.example"}]}"#,
        )
        .unwrap();
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[1].title, "");
        assert_eq!(response.results[0].content, "snippet");
    }
}
