//! Job-board adapter contract + the Greenhouse board implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobtrack_core::OfficeProfile;
use jobtrack_storage::{FetchError, FetchedResponse, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub mod normalize;

pub use normalize::{html_to_text, normalize_posting, NormalizeOptions};

pub const CRATE_NAME: &str = "jobtrack-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Board job ids arrive as numbers from Greenhouse but as strings from some mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    pub fn render(&self) -> String {
        match self {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// One job exactly as the board reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosting {
    #[serde(default)]
    pub id: Option<RawId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub absolute_url: Option<String>,
    #[serde(default)]
    pub location: Option<NamedRef>,
    #[serde(default)]
    pub offices: Vec<NamedRef>,
    #[serde(default)]
    pub departments: Vec<NamedRef>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub first_published: Option<String>,
    #[serde(default)]
    pub requisition_id: Option<String>,
}

impl RawPosting {
    pub fn req_id(&self) -> String {
        self.id.as_ref().map(RawId::render).unwrap_or_default()
    }

    /// Every place name the board attaches to the job.
    pub fn place_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        if let Some(name) = self.location.as_ref().and_then(|l| l.name.as_deref()) {
            names.push(name);
        }
        for office in &self.offices {
            names.extend(office.name.as_deref());
            names.extend(office.location.as_deref());
        }
        names
    }

    pub fn department_name(&self) -> &str {
        self.departments
            .iter()
            .find_map(|d| d.name.as_deref())
            .map(str::trim)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BoardListing {
    jobs: Vec<RawPosting>,
}

#[async_trait]
pub trait BoardAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn listing_url(&self) -> String;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedResponse, FetchError>;

    fn parse_listing(&self, response: &FetchedResponse) -> Result<Vec<RawPosting>, FetchError>;

    /// One GET against the board, narrowed to `office`.
    async fn fetch_office(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        office: &OfficeProfile,
    ) -> Result<Vec<RawPosting>, FetchError> {
        let response = self.fetch_listing(http, ctx).await?;
        let all = self.parse_listing(&response)?;
        let total = all.len();

        let mut matched = Vec::new();
        for raw in all {
            if !office.matches_location(&raw.place_names())
                || !office.accepts_department(raw.department_name())
            {
                continue;
            }
            if raw.req_id().is_empty() {
                warn!(office = %office.label, title = ?raw.title, "posting without id skipped");
                continue;
            }
            matched.push(raw);
        }

        info!(
            source_id = self.source_id(),
            office = %office.label,
            total,
            matched = matched.len(),
            "board listing filtered"
        );
        Ok(matched)
    }
}

#[derive(Debug, Clone)]
pub struct GreenhouseAdapter {
    api_base: String,
    board_token: String,
}

impl GreenhouseAdapter {
    pub fn new(api_base: impl Into<String>, board_token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            board_token: board_token.into(),
        }
    }
}

#[async_trait]
impl BoardAdapter for GreenhouseAdapter {
    fn source_id(&self) -> &'static str {
        "greenhouse"
    }

    fn listing_url(&self) -> String {
        format!("{}/{}/jobs", self.api_base, self.board_token)
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedResponse, FetchError> {
        http.fetch_bytes(
            ctx.run_id,
            self.source_id(),
            &self.listing_url(),
            &[("content", "true")],
        )
        .await
    }

    fn parse_listing(&self, response: &FetchedResponse) -> Result<Vec<RawPosting>, FetchError> {
        match serde_json::from_slice::<BoardListing>(&response.body) {
            Ok(listing) => Ok(listing.jobs),
            Err(json_err) => {
                let text = String::from_utf8_lossy(&response.body);
                if response.is_html() || text.trim_start().starts_with('<') {
                    if let Some(listing) = embedded_listing(&text) {
                        return Ok(listing.jobs);
                    }
                    return Err(FetchError::Malformed {
                        url: response.final_url.clone(),
                        reason: "html page without an embedded jobs listing".to_string(),
                    });
                }
                Err(FetchError::Malformed {
                    url: response.final_url.clone(),
                    reason: json_err.to_string(),
                })
            }
        }
    }
}

/// Pull a `{"jobs": [...]}` payload out of a JSON `<script>` block.
fn embedded_listing(html: &str) -> Option<BoardListing> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse(r#"script[type="application/json"], script[type="application/ld+json"]"#)
            .ok()?;
    document.select(&selector).find_map(|node| {
        let text = node.text().collect::<String>();
        serde_json::from_str::<BoardListing>(text.trim()).ok()
    })
}
