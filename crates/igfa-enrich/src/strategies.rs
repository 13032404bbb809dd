//! Concrete enrichment strategies: official-page metadata scrape, image
//! search, and the generative profile lookup.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use igfa_core::{AiProfile, FestivalRecord, ScrapeFields};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{AiStrategy, Outcome, ScrapeStrategy, StrategyError};

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self {
            timeout_secs: std::env::var("IGFA_SCRAPE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(12),
            user_agent: std::env::var("IGFA_USER_AGENT")
                .unwrap_or_else(|_| "igfa-bot/0.1".to_string()),
        }
    }
}

/// Fetches the official page and pulls open-graph metadata plus social
/// links. Partial results are expected: an image without a description is
/// still a win.
pub struct PageScrapeStrategy {
    client: reqwest::Client,
}

impl PageScrapeStrategy {
    pub fn new(config: ScrapeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent)
            .build()
            .context("building scrape http client")?;
        Ok(Self { client })
    }
}

fn select_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|node| node.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn absolutize(base: &Url, href: &str) -> Option<String> {
    base.join(href).ok().map(|u| u.to_string())
}

fn first_link_containing(document: &Html, needles: &[&str]) -> Option<String> {
    let sel = Selector::parse("a[href]").ok()?;
    document
        .select(&sel)
        .filter_map(|node| node.value().attr("href"))
        .find(|href| {
            let lower = href.to_ascii_lowercase();
            needles.iter().any(|n| lower.contains(n))
        })
        .map(|s| s.to_string())
}

fn extract_page_fields(base: &Url, html: &str) -> ScrapeFields {
    let document = Html::parse_document(html);
    ScrapeFields {
        image_url: select_attr(&document, r#"meta[property="og:image"]"#, "content")
            .and_then(|href| absolutize(base, &href)),
        logo_url: select_attr(&document, r#"link[rel="icon"]"#, "href")
            .or_else(|| select_attr(&document, r#"link[rel="shortcut icon"]"#, "href"))
            .and_then(|href| absolutize(base, &href)),
        description: select_attr(&document, r#"meta[property="og:description"]"#, "content")
            .or_else(|| select_attr(&document, r#"meta[name="description"]"#, "content")),
        twitter: first_link_containing(&document, &["twitter.com/", "x.com/"]),
        discord: first_link_containing(&document, &["discord.gg/", "discord.com/invite"]),
        location: select_attr(&document, r#"meta[property="og:locale"]"#, "content"),
        organizer: select_attr(&document, r#"meta[name="author"]"#, "content"),
    }
}

#[async_trait]
impl ScrapeStrategy for PageScrapeStrategy {
    async fn enrich(
        &self,
        record: &FestivalRecord,
    ) -> Result<Outcome<ScrapeFields>, StrategyError> {
        let page = record.official_page.trim();
        if page.is_empty() {
            return Ok(Outcome::Skipped("no official page".to_string()));
        }
        let base = Url::parse(page)
            .map_err(|e| StrategyError::Parse(format!("official page url: {e}")))?;

        let response = self.client.get(base.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StrategyError::HttpStatus {
                status: status.as_u16(),
                url: page.to_string(),
            });
        }
        let html = response.text().await?;
        let fields = extract_page_fields(&base, &html);
        debug!(name = %record.name, found_image = fields.image_url.is_some(), "page scraped");
        Ok(Outcome::Found(fields))
    }
}

#[derive(Debug, Clone)]
pub struct ImageSearchConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl ImageSearchConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("IGFA_IMAGE_SEARCH_URL").unwrap_or_default(),
            api_key: std::env::var("IGFA_IMAGE_SEARCH_KEY").unwrap_or_default(),
            timeout_secs: std::env::var("IGFA_IMAGE_SEARCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(12),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageSearchResponse {
    #[serde(default)]
    items: Vec<ImageSearchItem>,
}

#[derive(Debug, Deserialize)]
struct ImageSearchItem {
    link: String,
}

/// Web image search fallback: first hit for the festival name becomes the
/// image URL. Only fills the image field.
pub struct ImageSearchStrategy {
    client: reqwest::Client,
    config: ImageSearchConfig,
}

impl ImageSearchStrategy {
    pub fn new(config: ImageSearchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building image search http client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ScrapeStrategy for ImageSearchStrategy {
    async fn enrich(
        &self,
        record: &FestivalRecord,
    ) -> Result<Outcome<ScrapeFields>, StrategyError> {
        if self.config.endpoint.is_empty() {
            return Ok(Outcome::Skipped("image search not configured".to_string()));
        }
        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[
                ("q", format!("{} game festival", record.name).as_str()),
                ("key", self.config.api_key.as_str()),
                ("num", "1"),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StrategyError::HttpStatus {
                status: status.as_u16(),
                url: self.config.endpoint.clone(),
            });
        }
        let parsed: ImageSearchResponse = response
            .json()
            .await
            .map_err(|e| StrategyError::Parse(format!("image search payload: {e}")))?;
        match parsed.items.into_iter().next() {
            Some(item) => Ok(Outcome::Found(ScrapeFields {
                image_url: Some(item.link),
                ..Default::default()
            })),
            None => Ok(Outcome::Skipped("no image hits".to_string())),
        }
    }
}

/// Runs inner strategies in order and merges their fields, first writer
/// wins per field. A record counts as found if any inner strategy found
/// something; strategy errors only fail the composite when nothing else
/// produced a result.
pub struct CompositeScrapeStrategy {
    inner: Vec<Box<dyn ScrapeStrategy>>,
}

impl CompositeScrapeStrategy {
    pub fn new(inner: Vec<Box<dyn ScrapeStrategy>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ScrapeStrategy for CompositeScrapeStrategy {
    async fn enrich(
        &self,
        record: &FestivalRecord,
    ) -> Result<Outcome<ScrapeFields>, StrategyError> {
        let mut merged = ScrapeFields::default();
        let mut any_found = false;
        let mut first_error: Option<StrategyError> = None;

        for strategy in &self.inner {
            match strategy.enrich(record).await {
                Ok(Outcome::Found(fields)) => {
                    merged.merge(fields);
                    any_found = true;
                }
                Ok(Outcome::Skipped(_)) => {}
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if any_found {
            Ok(Outcome::Found(merged))
        } else if let Some(err) = first_error {
            Err(err)
        } else {
            Ok(Outcome::Skipped("no strategy produced a result".to_string()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("IGFA_AI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("IGFA_AI_API_KEY").unwrap_or_default(),
            model: std::env::var("IGFA_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout_secs: std::env::var("IGFA_AI_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

const PROFILE_PROMPT: &str = "You research video game festivals and events. \
Reply with a single JSON object with string fields: entity, kind, status, \
overview, eventDetails, participants, industryContext. Use empty strings \
for anything you do not know. Do not invent facts.";

/// Generative profile lookup against an OpenAI-compatible chat-completions
/// endpoint in JSON mode.
pub struct AiLookupStrategy {
    client: reqwest::Client,
    config: AiConfig,
}

impl AiLookupStrategy {
    pub fn new(config: AiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building ai http client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl AiStrategy for AiLookupStrategy {
    async fn lookup(&self, record: &FestivalRecord) -> Result<Outcome<AiProfile>, StrategyError> {
        if self.config.api_key.is_empty() {
            return Ok(Outcome::Skipped("ai lookup not configured".to_string()));
        }
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = json!({
            "model": self.config.model,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": PROFILE_PROMPT},
                {"role": "user", "content": format!(
                    "Profile the game festival or event named {:?}. Known type: {:?}. Official page: {:?}.",
                    record.name, record.festival_type, record.official_page
                )},
            ],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StrategyError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| StrategyError::Parse(format!("chat payload: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| StrategyError::Parse("empty completion".to_string()))?;
        let profile: AiProfile = serde_json::from_str(&content)
            .map_err(|e| StrategyError::Parse(format!("profile json: {e}")))?;
        Ok(Outcome::Found(profile))
    }
}
