//! Raw board record -> `Posting`. Pure; missing values become empty, never errors.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate};
use jobtrack_core::{truncate_chars, BodySection, OfficeProfile, Posting, TrackerProfile};
use regex::Regex;
use scraper::{ElementRef, Html, Node};

use crate::RawPosting;

/// Per-section cap; matches the store's rich-text limit.
pub const SECTION_CHARS: usize = 2000;
/// Select options are capped at 100 characters.
pub const DEPARTMENT_CHARS: usize = 100;

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "ul", "ol", "li", "h1", "h2", "h3", "h4", "h5", "h6",
    "table", "tr", "blockquote", "pre", "header", "footer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub summary_chars: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            summary_chars: SECTION_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    About,
    Duties,
    Required,
    Preferred,
}

impl SectionKind {
    const ORDER: [SectionKind; 4] = [
        SectionKind::About,
        SectionKind::Duties,
        SectionKind::Required,
        SectionKind::Preferred,
    ];

    fn heading(self) -> &'static str {
        match self {
            SectionKind::About => "About the Job",
            SectionKind::Duties => "What You'll Do",
            SectionKind::Required => "Required Qualifications",
            SectionKind::Preferred => "Preferred Qualifications",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            SectionKind::About => &["about the job", "about the team", "about the role"],
            SectionKind::Duties => &["what you'll do", "what you will do", "responsibilities"],
            SectionKind::Required => &[
                "required qualifications",
                "basic qualifications",
                "requirements",
            ],
            SectionKind::Preferred => &["preferred qualifications", "nice to have", "bonus points"],
        }
    }

    fn index(self) -> usize {
        match self {
            SectionKind::About => 0,
            SectionKind::Duties => 1,
            SectionKind::Required => 2,
            SectionKind::Preferred => 3,
        }
    }
}

pub fn normalize_posting(
    raw: &RawPosting,
    office: &OfficeProfile,
    profile: &TrackerProfile,
    opts: &NormalizeOptions,
) -> Posting {
    let description = raw.content.as_deref().map(html_to_text).unwrap_or_default();
    let sections = extract_sections(&description);

    let about = section_text(&sections, SectionKind::About);
    let summary_source = if about.is_empty() { description.as_str() } else { about };
    let summary = truncate_chars(summary_source, opts.summary_chars).to_string();

    let required = section_text(&sections, SectionKind::Required);
    let experience = extract_experience(required)
        .or_else(|| extract_experience(&description))
        .unwrap_or_default();

    let posted_on = raw
        .first_published
        .as_deref()
        .and_then(parse_board_date)
        .or_else(|| raw.updated_at.as_deref().and_then(parse_board_date));

    Posting {
        req_id: raw.req_id(),
        title: clean_inline(raw.title.as_deref().unwrap_or_default()),
        department: normalize_department(raw.department_name(), profile),
        office: office.label.clone(),
        experience,
        apply_url: raw.absolute_url.as_deref().unwrap_or_default().trim().to_string(),
        description,
        summary,
        sections,
        posted_on,
    }
}

/// Flatten board HTML (possibly entity-escaped) into plain text, one block per line.
pub fn html_to_text(content: &str) -> String {
    let decoded;
    let html = if content.contains("&lt;") {
        decoded = Html::parse_fragment(content)
            .root_element()
            .text()
            .collect::<String>();
        decoded.as_str()
    } else {
        content
    };

    let fragment = Html::parse_fragment(html);
    let mut out = String::new();
    push_element_text(fragment.root_element(), &mut out);

    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn push_element_text(element: ElementRef<'_>, out: &mut String) {
    let name = element.value().name();
    if name == "br" {
        out.push('\n');
        return;
    }
    if matches!(name, "script" | "style") {
        return;
    }

    let block = BLOCK_TAGS.contains(&name);
    if block {
        out.push('\n');
    }
    if name == "li" {
        out.push_str("- ");
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => push_collapsed(out, text),
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    push_element_text(el, out);
                }
            }
            _ => {}
        }
    }
    if block {
        out.push('\n');
    }
}

fn push_collapsed(out: &mut String, text: &str) {
    let mut last_space = out.is_empty() || out.ends_with(|c: char| c == ' ' || c == '\n');
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
}

fn heading_key(line: &str) -> String {
    line.trim()
        .replace(&['\u{2019}', '\u{2018}'][..], "'")
        .to_lowercase()
}

/// Match a heading line, returning its kind and any text after the heading on that line.
fn match_heading(line: &str) -> Option<(SectionKind, String)> {
    let key = heading_key(line);
    if key.chars().count() > 80 {
        return None;
    }
    SectionKind::ORDER.into_iter().find_map(|kind| {
        kind.keywords().iter().find_map(|keyword| {
            let rest = key.strip_prefix(keyword)?;
            if !(rest.is_empty() || rest.starts_with(':')) {
                return None;
            }
            // Keep source casing for the trailing text.
            let trimmed = line.trim();
            let tail = trimmed
                .get(trimmed.len().saturating_sub(rest.len())..)
                .unwrap_or(rest)
                .trim_start_matches(':')
                .trim();
            Some((kind, tail.to_string()))
        })
    })
}

fn extract_sections(description: &str) -> Vec<BodySection> {
    let mut buckets: [Option<Vec<String>>; 4] = Default::default();
    let mut current: Option<SectionKind> = None;

    for line in description.lines() {
        if let Some((kind, tail)) = match_heading(line) {
            let bucket = &mut buckets[kind.index()];
            // A repeated heading keeps the first section.
            current = if bucket.is_none() {
                *bucket = Some(Vec::new());
                Some(kind)
            } else {
                None
            };
            if let (Some(kind), false) = (current, tail.is_empty()) {
                if let Some(lines) = buckets[kind.index()].as_mut() {
                    lines.push(tail);
                }
            }
            continue;
        }
        if let Some(kind) = current {
            if let Some(lines) = buckets[kind.index()].as_mut() {
                lines.push(line.to_string());
            }
        }
    }

    SectionKind::ORDER
        .into_iter()
        .filter_map(|kind| {
            let text = buckets[kind.index()].as_ref()?.join("\n");
            let text = truncate_chars(text.trim(), SECTION_CHARS).to_string();
            (!text.is_empty()).then(|| BodySection {
                heading: kind.heading().to_string(),
                text,
            })
        })
        .collect()
}

fn section_text(sections: &[BodySection], kind: SectionKind) -> &str {
    sections
        .iter()
        .find(|s| s.heading == kind.heading())
        .map(|s| s.text.as_str())
        .unwrap_or_default()
}

fn experience_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})\s*(?:[-\u{2013}]\s*\d{1,2}\s*)?\+?\s*(?:years?|yrs)\b")
            .expect("valid experience regex")
    })
}

/// First "N years" / "N+ years" / "N-M years" mention, rendered as "N+ years".
pub fn extract_experience(text: &str) -> Option<String> {
    experience_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|years| format!("{}+ years", years.as_str()))
}

fn normalize_department(raw: &str, profile: &TrackerProfile) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let normalized = profile.normalize_department(raw.trim());
    let without_commas = normalized
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&without_commas, DEPARTMENT_CHARS).trim_end().to_string()
}

fn clean_inline(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_board_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.date_naive())
        .ok()
        .or_else(|| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NamedRef, RawId};
    use jobtrack_core::DepartmentRule;

    const ESCAPED_CONTENT: &str = "&lt;h3&gt;About the Job&lt;/h3&gt;&lt;p&gt;Build autonomous systems in &amp;nbsp;Taipei.&lt;/p&gt;\
&lt;h3&gt;What You&amp;rsquo;ll Do&lt;/h3&gt;&lt;ul&gt;&lt;li&gt;Design test fixtures&lt;/li&gt;&lt;li&gt;Debug boards&lt;/li&gt;&lt;/ul&gt;\
&lt;h3&gt;Required Qualifications&lt;/h3&gt;&lt;ul&gt;&lt;li&gt;BS in EE&lt;/li&gt;&lt;li&gt;5+ years of hardware test experience&lt;/li&gt;&lt;/ul&gt;\
&lt;h3&gt;Preferred Qualifications&lt;/h3&gt;&lt;p&gt;Mandarin fluency&lt;/p&gt;";

    fn taipei() -> OfficeProfile {
        TrackerProfile::builtin()
            .office("Taipei Taiwan")
            .cloned()
            .expect("builtin office")
    }

    fn raw() -> RawPosting {
        RawPosting {
            id: Some(RawId::Number(4821)),
            title: Some("  Electrical   Test Engineer ".to_string()),
            absolute_url: Some("https://boards.example/jobs/4821".to_string()),
            location: Some(NamedRef {
                name: Some("Taipei City, Taiwan".to_string()),
                location: None,
            }),
            departments: vec![NamedRef {
                name: Some("Electrical Engineering".to_string()),
                location: None,
            }],
            content: Some(ESCAPED_CONTENT.to_string()),
            updated_at: Some("2025-03-04T10:00:00-05:00".to_string()),
            first_published: Some("2025-02-01T08:30:00Z".to_string()),
            ..RawPosting::default()
        }
    }

    #[test]
    fn html_is_decoded_and_flattened_per_block() {
        let text = html_to_text("<p>Hello <b>world</b></p><ul><li>one</li><li>two</li></ul>");
        assert_eq!(text, "Hello world\n- one\n- two");
    }

    #[test]
    fn escaped_html_is_unescaped_first() {
        let text = html_to_text("&lt;p&gt;A &amp;amp; B&lt;/p&gt;&lt;p&gt;C&lt;/p&gt;");
        assert_eq!(text, "A & B\nC");
    }

    #[test]
    fn full_posting_maps_every_field() {
        let profile = TrackerProfile::builtin();
        let posting = normalize_posting(&raw(), &taipei(), &profile, &NormalizeOptions::default());

        assert_eq!(posting.req_id, "4821");
        assert_eq!(posting.title, "Electrical Test Engineer");
        assert_eq!(posting.office, "Taipei Taiwan");
        assert_eq!(posting.department, "Electrical Test Engineering");
        assert_eq!(posting.apply_url, "https://boards.example/jobs/4821");
        assert_eq!(posting.experience, "5+ years");
        assert_eq!(posting.posted_on, NaiveDate::from_ymd_opt(2025, 2, 1));

        let headings: Vec<_> = posting.sections.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(
            headings,
            vec![
                "About the Job",
                "What You'll Do",
                "Required Qualifications",
                "Preferred Qualifications"
            ]
        );
        assert!(posting.summary.starts_with("Build autonomous systems"));
        assert!(posting.sections[1].text.contains("- Debug boards"));
        assert!(posting.description.contains("Mandarin fluency"));
    }

    #[test]
    fn summary_is_truncated_to_configured_length() {
        let profile = TrackerProfile::builtin();
        let opts = NormalizeOptions { summary_chars: 5 };
        let posting = normalize_posting(&raw(), &taipei(), &profile, &opts);
        assert_eq!(posting.summary, "Build");
    }

    #[test]
    fn summary_falls_back_to_description_without_about_section() {
        let mut raw = raw();
        raw.content = Some("<p>Short role blurb.</p>".to_string());
        let posting = normalize_posting(
            &raw,
            &taipei(),
            &TrackerProfile::builtin(),
            &NormalizeOptions::default(),
        );
        assert_eq!(posting.summary, "Short role blurb.");
        assert!(posting.sections.is_empty());
        assert_eq!(posting.experience, "");
    }

    #[test]
    fn missing_optional_fields_become_empty() {
        let raw = RawPosting {
            id: Some(RawId::Text("99".to_string())),
            ..RawPosting::default()
        };
        let posting = normalize_posting(
            &raw,
            &taipei(),
            &TrackerProfile::builtin(),
            &NormalizeOptions::default(),
        );
        assert_eq!(posting.req_id, "99");
        assert_eq!(posting.title, "");
        assert_eq!(posting.department, "");
        assert_eq!(posting.experience, "");
        assert_eq!(posting.apply_url, "");
        assert_eq!(posting.description, "");
        assert_eq!(posting.summary, "");
        assert_eq!(posting.posted_on, None);
    }

    #[test]
    fn department_rules_apply_and_commas_are_stripped() {
        let mut profile = TrackerProfile::builtin();
        profile.department_rules = vec![DepartmentRule {
            contains_any: vec!["business".to_string(), "bd".to_string()],
            normalize_to: "Business Development".to_string(),
        }];
        assert_eq!(
            normalize_department("Business Ops, APAC", &profile),
            "Business Development"
        );
        assert_eq!(
            normalize_department("Sales, Marketing", &TrackerProfile::builtin()),
            "Sales Marketing"
        );
        let long = "x".repeat(150);
        assert_eq!(
            normalize_department(&long, &TrackerProfile::builtin())
                .chars()
                .count(),
            DEPARTMENT_CHARS
        );
    }

    #[test]
    fn experience_accepts_ranges_and_plain_years() {
        assert_eq!(extract_experience("3-5 years in firmware").as_deref(), Some("3+ years"));
        assert_eq!(extract_experience("at least 8 yrs").as_deref(), Some("8+ years"));
        assert_eq!(extract_experience("10+ Years of leadership").as_deref(), Some("10+ years"));
        assert_eq!(extract_experience("a few years"), None);
    }

    #[test]
    fn heading_with_inline_text_and_curly_apostrophe() {
        let sections =
            extract_sections("What you\u{2019}ll do: ship code\nmore work\nRequirements\n2 years");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].heading, "What You'll Do");
        assert_eq!(sections[0].text, "ship code\nmore work");
        assert_eq!(sections[1].text, "2 years");
    }

    #[test]
    fn posted_date_falls_back_to_updated_at() {
        assert_eq!(
            parse_board_date("2025-03-04T10:00:00-05:00"),
            NaiveDate::from_ymd_opt(2025, 3, 4)
        );
        assert_eq!(parse_board_date("2025-03-04"), NaiveDate::from_ymd_opt(2025, 3, 4));
        assert_eq!(parse_board_date("yesterday"), None);
    }
}
