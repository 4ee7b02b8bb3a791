use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolError, ToolResult, parse_input, with_timeout};
use crate::{dual_debug, dual_info, dual_warn};

const DUCKDUCKGO_HTML_URL: &str = "https://html.duckduckgo.com/html/";
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";
/// Results fetched from the page; only the first [`RESULTS_SHOWN`] make it into the answer.
const RESULTS_FETCHED: usize = 5;
const RESULTS_SHOWN: usize = 3;

#[derive(Debug, Deserialize)]
struct SearchInput {
    query: String,
}

#[derive(Debug, Clone, PartialEq)]
struct SearchHit {
    title: String,
    url: String,
    snippet: String,
}

/// Web search through DuckDuckGo's HTML endpoint, condensed into one line.
pub struct SearchWebTool {
    client: reqwest::Client,
    timeout_secs: u64,
    max_chars: usize,
}

impl SearchWebTool {
    pub fn new(timeout_secs: u64, max_chars: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout_secs,
            max_chars,
        }
    }

    async fn search(&self, query: &str) -> ToolResult<Vec<SearchHit>> {
        let url = format!("{DUCKDUCKGO_HTML_URL}?q={}", urlencoding::encode(query));
        let response = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| {
                dual_warn!("search_web: request failed for '{}': {}", query, e);
                ToolError::Unavailable("search temporarily unavailable".into())
            })?;

        if !response.status().is_success() {
            return Err(ToolError::Upstream {
                what: "search provider".into(),
                status: response.status().as_u16(),
            });
        }

        let html = response
            .text()
            .await
            .map_err(|_| ToolError::Unavailable("search temporarily unavailable".into()))?;

        parse_duckduckgo_html(&html, RESULTS_FETCHED)
    }
}

fn selector(css: &str) -> ToolResult<Selector> {
    Selector::parse(css).map_err(|e| ToolError::Unavailable(format!("bad selector {css}: {e}")))
}

fn parse_duckduckgo_html(html: &str, max_results: usize) -> ToolResult<Vec<SearchHit>> {
    let document = Html::parse_document(html);
    let result_sel = selector(".result")?;
    let link_sel = selector(".result__a")?;
    let snippet_sel = selector(".result__snippet")?;

    let mut hits = Vec::new();
    for element in document.select(&result_sel) {
        if hits.len() >= max_results {
            break;
        }

        let link = element.select(&link_sel).next();
        let title = link
            .map(|el| el.text().collect::<String>())
            .unwrap_or_default()
            .trim()
            .to_string();
        let url = link
            .and_then(|el| el.value().attr("href"))
            .map(normalize_duckduckgo_url)
            .unwrap_or_default();
        let snippet = element
            .select(&snippet_sel)
            .next()
            .map(|el| el.text().collect::<String>())
            .unwrap_or_default()
            .trim()
            .to_string();

        if !title.is_empty() || !snippet.is_empty() {
            hits.push(SearchHit {
                title,
                url,
                snippet,
            });
        }
    }

    Ok(hits)
}

/// DuckDuckGo wraps result links as `https://duckduckgo.com/l/?uddg=<target>`.
fn normalize_duckduckgo_url(raw_url: &str) -> String {
    let absolute = if raw_url.starts_with("//") {
        format!("https:{raw_url}")
    } else {
        raw_url.to_string()
    };

    let Ok(parsed) = url::Url::parse(&absolute) else {
        return raw_url.to_string();
    };

    if parsed.domain() == Some("duckduckgo.com") && parsed.path().starts_with("/l/") {
        for (key, value) in parsed.query_pairs() {
            if key == "uddg" {
                return value.into_owned();
            }
        }
    }

    absolute
}

/// `title: snippet` for the first results, joined with ` | ` and cut at `max_chars`.
fn format_hits(hits: &[SearchHit], max_chars: usize) -> Option<String> {
    let formatted: Vec<String> = hits
        .iter()
        .take(RESULTS_SHOWN)
        .filter_map(|hit| match (hit.title.is_empty(), hit.snippet.is_empty()) {
            (false, false) => Some(format!("{}: {}", hit.title, hit.snippet)),
            (false, true) => Some(hit.title.clone()),
            (true, false) => Some(hit.snippet.clone()),
            (true, true) => None,
        })
        .collect();

    if formatted.is_empty() {
        return None;
    }

    let combined = formatted.join(" | ");
    if combined.chars().count() > max_chars {
        let cut: String = combined.chars().take(max_chars).collect();
        Some(format!("{cut}..."))
    } else {
        Some(combined)
    }
}

#[async_trait]
impl Tool for SearchWebTool {
    fn name(&self) -> &str {
        "search_web"
    }

    fn description(&self) -> &str {
        "Search the web using DuckDuckGo and return a short summary of the top results."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult<String> {
        let SearchInput { query } = parse_input(input)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidInput("query is required".into()));
        }

        dual_info!("search_web: starting search for '{}'", query);
        let hits = with_timeout("search", self.timeout_secs, self.search(query)).await?;
        for hit in hits.iter().take(RESULTS_SHOWN) {
            dual_debug!("search_web: {} <{}>", hit.title, hit.url);
        }

        match format_hits(&hits, self.max_chars) {
            Some(answer) => {
                dual_info!(
                    "search_web: returning {} results ({} chars)",
                    hits.len().min(RESULTS_SHOWN),
                    answer.chars().count()
                );
                Ok(answer)
            }
            None => {
                dual_warn!("search_web: no results found for '{}'", query);
                Err(ToolError::Unavailable(
                    "no search results found for this query".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(title: &str, snippet: &str) -> SearchHit {
        SearchHit {
            title: title.to_string(),
            url: String::new(),
            snippet: snippet.to_string(),
        }
    }

    #[test]
    fn test_parse_results_page() {
        let html = r#"
            <div class="result">
                <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&rut=abc">Rust Programming Language</a>
                <a class="result__snippet">A language empowering everyone.</a>
            </div>
            <div class="result">
                <a class="result__a" href="https://doc.rust-lang.org/book/">The Book</a>
                <div class="result__snippet">Learn Rust.</div>
            </div>
            <div class="result"></div>
        "#;

        let hits = parse_duckduckgo_html(html, 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Rust Programming Language");
        assert_eq!(hits[0].url, "https://www.rust-lang.org/");
        assert_eq!(hits[0].snippet, "A language empowering everyone.");
        assert_eq!(hits[1].url, "https://doc.rust-lang.org/book/");
    }

    #[test]
    fn test_normalize_passes_through_plain_links() {
        assert_eq!(
            normalize_duckduckgo_url("https://example.com/a?b=c"),
            "https://example.com/a?b=c"
        );
        assert_eq!(normalize_duckduckgo_url("not a url"), "not a url");
    }

    #[test]
    fn test_format_takes_top_three() {
        let hits = vec![
            hit("A", "first"),
            hit("B", ""),
            hit("", "third"),
            hit("D", "fourth"),
        ];
        assert_eq!(
            format_hits(&hits, 800).unwrap(),
            "A: first | B | third"
        );
    }

    #[test]
    fn test_format_truncates() {
        let hits = vec![hit("Title", &"x".repeat(900))];
        let answer = format_hits(&hits, 800).unwrap();
        assert_eq!(answer.chars().count(), 803);
        assert!(answer.ends_with("..."));
        assert!(answer.starts_with("Title: xxx"));
    }

    #[test]
    fn test_format_nothing() {
        assert_eq!(format_hits(&[], 800), None);
        assert_eq!(format_hits(&[hit("", "")], 800), None);
    }
}
