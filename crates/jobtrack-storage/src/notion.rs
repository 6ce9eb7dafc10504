//! Notion database backend for [`RecordStore`].
//!
//! Each tracked record is one page in the database. Columns map to page
//! properties by name; the description sections become the page's child
//! blocks.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use jobtrack_core::{
    truncate_chars, BodySection, FieldValue, RecordField, RecordFilter, RecordHandle, RecordPatch,
    StoredRecord,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::{RecordStore, StoreError};

/// Notion caps a single rich text object at this many characters.
pub const RICH_TEXT_LIMIT: usize = 2000;

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyKind {
    Title,
    RichText,
    Select,
    Url,
    Date,
    Checkbox,
}

impl PropertyKind {
    fn as_str(self) -> &'static str {
        match self {
            PropertyKind::Title => "title",
            PropertyKind::RichText => "rich_text",
            PropertyKind::Select => "select",
            PropertyKind::Url => "url",
            PropertyKind::Date => "date",
            PropertyKind::Checkbox => "checkbox",
        }
    }
}

/// Database property name for each column.
pub fn property_name(field: RecordField) -> &'static str {
    match field {
        RecordField::Title => "Title",
        RecordField::ReqId => "REQ ID",
        RecordField::Department => "Department",
        RecordField::Office => "Office",
        RecordField::Experience => "Experience",
        RecordField::ApplyUrl => "Apply URL",
        RecordField::Summary => "Summary",
        RecordField::PostedOn => "Posted",
        RecordField::Closed => "Closed",
        RecordField::ClosedOn => "Closed On",
        RecordField::SyncHash => "Sync Hash",
        RecordField::Status => "Status",
        RecordField::FirstSeen => "First Seen",
        RecordField::Notes => "Notes",
    }
}

fn property_kind(field: RecordField) -> PropertyKind {
    match field {
        RecordField::Title => PropertyKind::Title,
        RecordField::Department | RecordField::Office | RecordField::Status => {
            PropertyKind::Select
        }
        RecordField::ApplyUrl => PropertyKind::Url,
        RecordField::PostedOn | RecordField::ClosedOn | RecordField::FirstSeen => {
            PropertyKind::Date
        }
        RecordField::Closed => PropertyKind::Checkbox,
        RecordField::ReqId
        | RecordField::Experience
        | RecordField::Summary
        | RecordField::SyncHash
        | RecordField::Notes => PropertyKind::RichText,
    }
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub api_base: String,
    pub api_key: String,
    pub database_id: String,
    pub notion_version: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotionStore {
    client: reqwest::Client,
    api_base: String,
    database_id: String,
}

impl NotionStore {
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidCredential`] when the key is blank or not a
    /// valid header value, and [`StoreError::Request`] if the client cannot be built.
    pub fn new(config: NotionConfig) -> Result<Self, StoreError> {
        let key = config.api_key.trim();
        if key.is_empty() {
            return Err(StoreError::InvalidCredential(
                "NOTION_API_KEY is blank".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
            StoreError::InvalidCredential("NOTION_API_KEY contains invalid characters".to_string())
        })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            HeaderName::from_static("notion-version"),
            HeaderValue::from_str(&config.notion_version)
                .map_err(|e| StoreError::Decode(format!("invalid Notion-Version header: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            database_id: config.database_id,
        })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, StoreError> {
        let url = format!("{}{}", self.api_base, path);
        let mut req = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        debug!(%method, path, "notion request");

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let parsed = if text.trim().is_empty() {
            Ok(JsonValue::Null)
        } else {
            serde_json::from_str::<JsonValue>(&text)
        };

        if status.is_success() {
            return parsed.map_err(|e| StoreError::Decode(format!("{path}: {e}")));
        }
        let value = parsed.unwrap_or(JsonValue::Null);

        let code = value
            .get("code")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        let message = value
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("no message")
            .to_string();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::Unauthorized {
                status: status.as_u16(),
                message,
            }),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(message)),
            _ => Err(StoreError::Api {
                status: status.as_u16(),
                code,
                message,
            }),
        }
    }

    async fn list_child_block_ids(&self, page_id: &str) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut path = format!("/blocks/{page_id}/children?page_size={PAGE_SIZE}");
            if let Some(c) = &cursor {
                path.push_str("&start_cursor=");
                path.push_str(c);
            }
            let resp = self.call(Method::GET, &path, None).await?;
            let results = resp
                .get("results")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| StoreError::Decode("block list without results".to_string()))?;
            ids.extend(
                results
                    .iter()
                    .filter_map(|b| b.get("id").and_then(JsonValue::as_str))
                    .map(ToString::to_string),
            );
            cursor = next_cursor(&resp);
            if cursor.is_none() {
                return Ok(ids);
            }
        }
    }

    async fn replace_body(&self, page_id: &str, body: &[BodySection]) -> Result<(), StoreError> {
        for block_id in self.list_child_block_ids(page_id).await? {
            self.call(Method::DELETE, &format!("/blocks/{block_id}"), None)
                .await?;
        }
        let blocks = body_blocks(body);
        if !blocks.is_empty() {
            self.call(
                Method::PATCH,
                &format!("/blocks/{page_id}/children"),
                Some(&json!({ "children": blocks })),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for NotionStore {
    fn backend(&self) -> &'static str {
        "notion"
    }

    async fn verify_access(&self) -> Result<(), StoreError> {
        self.call(Method::GET, "/users/me", None).await.map(|_| ())
    }

    async fn missing_fields(&self) -> Result<Vec<RecordField>, StoreError> {
        let db = self
            .call(Method::GET, &format!("/databases/{}", self.database_id), None)
            .await?;
        let props = db
            .get("properties")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| StoreError::Decode("database without properties".to_string()))?;

        Ok(RecordField::ALL
            .into_iter()
            .filter(|field| {
                let actual = props
                    .get(property_name(*field))
                    .and_then(|p| p.get("type"))
                    .and_then(JsonValue::as_str);
                actual != Some(property_kind(*field).as_str())
            })
            .collect())
    }

    async fn query_records(
        &self,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let path = format!("/databases/{}/query", self.database_id);
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = json!({ "page_size": PAGE_SIZE });
            if let Some(f) = filter {
                body["filter"] = encode_filter(f);
            }
            if let Some(c) = &cursor {
                body["start_cursor"] = json!(c);
            }

            let resp = self.call(Method::POST, &path, Some(&body)).await?;
            let pages = resp
                .get("results")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| StoreError::Decode("query response without results".to_string()))?;
            for page in pages {
                records.push(decode_page(page)?);
            }

            cursor = next_cursor(&resp);
            if cursor.is_none() {
                return Ok(records);
            }
        }
    }

    async fn create_record(&self, patch: &RecordPatch) -> Result<RecordHandle, StoreError> {
        let mut body = json!({
            "parent": { "database_id": self.database_id },
            "properties": encode_properties(patch)?,
        });
        if let Some(sections) = &patch.body {
            let blocks = body_blocks(sections);
            if !blocks.is_empty() {
                body["children"] = JsonValue::Array(blocks);
            }
        }

        let page = self.call(Method::POST, "/pages", Some(&body)).await?;
        page.get("id")
            .and_then(JsonValue::as_str)
            .map(|id| RecordHandle(id.to_string()))
            .ok_or_else(|| StoreError::Decode("created page without id".to_string()))
    }

    async fn update_record(
        &self,
        handle: &RecordHandle,
        patch: &RecordPatch,
    ) -> Result<(), StoreError> {
        // Body first: the properties carry the sync hash, which must only
        // land once the body it describes is in place.
        if let Some(sections) = &patch.body {
            self.replace_body(handle.as_str(), sections).await?;
        }
        if !patch.fields.is_empty() {
            let body = json!({ "properties": encode_properties(patch)? });
            self.call(
                Method::PATCH,
                &format!("/pages/{}", handle.as_str()),
                Some(&body),
            )
            .await?;
        }
        Ok(())
    }
}

fn next_cursor(resp: &JsonValue) -> Option<String> {
    if resp.get("has_more").and_then(JsonValue::as_bool) != Some(true) {
        return None;
    }
    resp.get("next_cursor")
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
}

fn rich_text(content: &str) -> JsonValue {
    if content.is_empty() {
        return json!([]);
    }
    json!([{ "type": "text", "text": { "content": truncate_chars(content, RICH_TEXT_LIMIT) } }])
}

fn encode_value(field: RecordField, value: &FieldValue) -> Result<JsonValue, StoreError> {
    let kind = property_kind(field);
    let mismatch = || {
        StoreError::Rejected(format!(
            "{} expects a {} value, got {value:?}",
            property_name(field),
            kind.as_str()
        ))
    };

    Ok(match (kind, value) {
        (PropertyKind::Title, FieldValue::Text(s)) => json!({ "title": rich_text(s) }),
        (PropertyKind::RichText, FieldValue::Text(s)) => json!({ "rich_text": rich_text(s) }),
        (PropertyKind::Select, FieldValue::Text(s)) if s.trim().is_empty() => {
            json!({ "select": null })
        }
        (PropertyKind::Select, FieldValue::Text(s)) => {
            json!({ "select": { "name": truncate_chars(&s.replace(',', " "), 100) } })
        }
        (PropertyKind::Url, FieldValue::Text(s)) if s.trim().is_empty() => json!({ "url": null }),
        (PropertyKind::Url, FieldValue::Text(s)) => json!({ "url": s }),
        (PropertyKind::Date, FieldValue::Date(Some(d))) => {
            json!({ "date": { "start": d.format("%Y-%m-%d").to_string() } })
        }
        (PropertyKind::Date, FieldValue::Date(None)) => json!({ "date": null }),
        (PropertyKind::Checkbox, FieldValue::Flag(b)) => json!({ "checkbox": b }),
        _ => return Err(mismatch()),
    })
}

fn encode_properties(patch: &RecordPatch) -> Result<JsonValue, StoreError> {
    let mut props = Map::new();
    for (field, value) in &patch.fields {
        props.insert(property_name(*field).to_string(), encode_value(*field, value)?);
    }
    Ok(JsonValue::Object(props))
}

fn encode_filter(filter: &RecordFilter) -> JsonValue {
    let name = property_name(filter.field);
    let kind = property_kind(filter.field).as_str();
    let condition = match &filter.equals {
        FieldValue::Text(s) => json!({ "equals": s }),
        FieldValue::Flag(b) => json!({ "equals": b }),
        FieldValue::Date(Some(d)) => json!({ "equals": d.format("%Y-%m-%d").to_string() }),
        FieldValue::Date(None) => json!({ "is_empty": true }),
    };
    let mut out = Map::new();
    out.insert("property".to_string(), json!(name));
    out.insert(kind.to_string(), condition);
    JsonValue::Object(out)
}

fn plain_text(items: Option<&JsonValue>) -> String {
    items
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    t.get("plain_text")
                        .or_else(|| t.get("text").and_then(|x| x.get("content")))
                        .and_then(JsonValue::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn decode_property(field: RecordField, prop: &JsonValue) -> Option<FieldValue> {
    let value = match property_kind(field) {
        PropertyKind::Title => FieldValue::Text(plain_text(prop.get("title"))),
        PropertyKind::RichText => FieldValue::Text(plain_text(prop.get("rich_text"))),
        PropertyKind::Select => FieldValue::Text(
            prop.get("select")
                .and_then(|s| s.get("name"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        PropertyKind::Url => FieldValue::Text(
            prop.get("url")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        PropertyKind::Date => FieldValue::Date(
            prop.get("date")
                .and_then(|d| d.get("start"))
                .and_then(JsonValue::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()),
        ),
        PropertyKind::Checkbox => FieldValue::Flag(prop.get("checkbox")?.as_bool()?),
    };
    Some(value)
}

fn decode_page(page: &JsonValue) -> Result<StoredRecord, StoreError> {
    let id = page
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::Decode("page without id".to_string()))?;
    let props = page.get("properties").and_then(JsonValue::as_object);

    let mut fields = BTreeMap::new();
    if let Some(props) = props {
        for field in RecordField::ALL {
            if let Some(value) = props
                .get(property_name(field))
                .and_then(|p| decode_property(field, p))
            {
                fields.insert(field, value);
            }
        }
    }

    Ok(StoredRecord {
        handle: RecordHandle(id.to_string()),
        fields,
    })
}

fn body_blocks(sections: &[BodySection]) -> Vec<JsonValue> {
    let mut blocks = Vec::new();
    for section in sections.iter().filter(|s| !s.text.trim().is_empty()) {
        blocks.push(json!({
            "object": "block",
            "type": "heading_2",
            "heading_2": { "rich_text": rich_text(&section.heading) },
        }));
        blocks.push(json!({
            "object": "block",
            "type": "paragraph",
            "paragraph": { "rich_text": rich_text(&section.text) },
        }));
    }
    blocks
}
