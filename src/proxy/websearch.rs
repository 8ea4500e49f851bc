// Local webSearch2 handler for the AMP proxy
//
// AMP routes its web-search tool through the proxy rather than the
// vendor endpoint. When a Tavily key is configured the query goes
// there; otherwise the DuckDuckGo HTML endpoint is scraped for the top
// results. Either way the response shape is the same small JSON list.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_RESULTS: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchRequest {
    pub query: String,
    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebSearchResponse {
    pub query: String,
    pub provider: &'static str,
    pub results: Vec<WebSearchResult>,
}

pub async fn handle(
    client: &reqwest::Client,
    request: WebSearchRequest,
    tavily_api_key: Option<&str>,
) -> Result<WebSearchResponse> {
    let limit = request.max_results.unwrap_or(MAX_RESULTS).clamp(1, 20);
    match tavily_api_key {
        Some(key) if !key.is_empty() => {
            let results = search_tavily(client, &request.query, key, limit).await?;
            Ok(WebSearchResponse {
                query: request.query,
                provider: "tavily",
                results,
            })
        }
        _ => {
            let results = search_duckduckgo(client, &request.query, limit).await?;
            Ok(WebSearchResponse {
                query: request.query,
                provider: "duckduckgo",
                results,
            })
        }
    }
}

async fn search_tavily(
    client: &reqwest::Client,
    query: &str,
    api_key: &str,
    limit: usize,
) -> Result<Vec<WebSearchResult>> {
    let response = client
        .post("https://api.tavily.com/search")
        .json(&serde_json::json!({
            "api_key": api_key,
            "query": query,
            "max_results": limit,
        }))
        .send()
        .await
        .context("tavily request failed")?
        .error_for_status()
        .context("tavily returned an error status")?;

    let body: Value = response.json().await.context("tavily response body")?;
    let results = body
        .get("results")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .take(limit)
                .map(|item| WebSearchResult {
                    title: item
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    url: item
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    snippet: item
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(results)
}

fn result_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<a[^>]+class="result__a"[^>]+href="(?P<url>[^"]+)"[^>]*>(?P<title>.*?)</a>.*?class="result__snippet"[^>]*>(?P<snippet>.*?)</"#,
        )
        .expect("valid result pattern")
    })
}

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"))
}

fn strip_tags(html: &str) -> String {
    tag_pattern()
        .replace_all(html, "")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_string()
}

async fn search_duckduckgo(
    client: &reqwest::Client,
    query: &str,
    limit: usize,
) -> Result<Vec<WebSearchResult>> {
    let response = client
        .get("https://html.duckduckgo.com/html/")
        .query(&[("q", query)])
        .send()
        .await
        .context("duckduckgo request failed")?
        .error_for_status()
        .context("duckduckgo returned an error status")?;

    let html = response.text().await.context("duckduckgo response body")?;
    Ok(parse_duckduckgo(&html, limit))
}

fn parse_duckduckgo(html: &str, limit: usize) -> Vec<WebSearchResult> {
    result_pattern()
        .captures_iter(html)
        .take(limit)
        .map(|caps| WebSearchResult {
            title: strip_tags(&caps["title"]),
            url: strip_tags(&caps["url"]),
            snippet: strip_tags(&caps["snippet"]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duckduckgo_result_markup() {
        let html = r##"
            <div class="result">
              <a rel="nofollow" class="result__a" href="https://example.com/a">First <b>Result</b></a>
              <a class="result__snippet" href="#">Snippet &amp; text</a>
            </div>
            <div class="result">
              <a rel="nofollow" class="result__a" href="https://example.com/b">Second</a>
              <a class="result__snippet" href="#">Other</a>
            </div>
        "##;
        let results = parse_duckduckgo(html, 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "First Result");
        assert_eq!(results[0].url, "https://example.com/a");
        assert_eq!(results[0].snippet, "Snippet & text");
    }

    #[test]
    fn limit_truncates_results() {
        let html = r#"
            <a class="result__a" href="u1">t1</a><span class="result__snippet">s1</span></span>
            <a class="result__a" href="u2">t2</a><span class="result__snippet">s2</span></span>
        "#;
        assert_eq!(parse_duckduckgo(html, 1).len(), 1);
    }
}
