use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use flp_core::{
    canonical_identity, posting_id, truncate_description, Budget, ClientSignal, Evidence,
    ListingRecord, PostedTime, DESCRIPTION_LIMIT,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

pub const EXTRACTOR_VERSION: &str = "flp-extract/1";

/// One undecoded discovery result, as handed over by a discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "markup", rename_all = "snake_case")]
pub enum RawItem {
    HtmlTile(String),
    /// An RSS `<item>` or Atom `<entry>` fragment.
    RssItem(String),
}

/// Canonical pain-point label and its trigger phrases, in reporting order.
pub const PAIN_POINT_CATALOG: &[(&str, &[&str])] = &[
    ("scaling issues", &["scale", "scaling", "growth", "growing pains"]),
    (
        "process problems",
        &["inefficient", "manual", "chaos", "disorganized", "process"],
    ),
    ("team issues", &["team", "leadership", "management", "coordination"]),
    ("system problems", &["systems", "automation", "workflow", "tools"]),
    (
        "operational chaos",
        &["chaos", "crisis", "urgent", "fix", "stabilize"],
    ),
];

const TILE_SELECTORS: &[&str] = &[
    r#"[data-test="job-tile"]"#,
    r#"[data-cy="job-tile"]"#,
    ".job-tile",
    "article[data-test]",
    ".up-card-section",
];
const TITLE_SELECTORS: &[&str] = &[
    r#"[data-test="job-tile-title"] a"#,
    ".job-tile-title a",
    "h2 a",
    "h3 a",
];
const DESCRIPTION_SELECTORS: &[&str] = &[
    r#"[data-test="job-description"]"#,
    ".job-description",
    ".description",
];
const BUDGET_SELECTORS: &[&str] = &[
    r#"[data-test="job-type-and-budget"]"#,
    r#"[data-test="budget"]"#,
    ".budget",
    ".job-budget",
    r#"[data-cy="budget"]"#,
    "small",
    ".text-muted",
    ".secondary-text",
];
const SKILL_SELECTORS: &[&str] = &[r#"[data-test="token-skill"]"#, ".skill-tag", ".token"];
const POSTED_SELECTORS: &[&str] = &[r#"[data-test="posted-on"]"#, ".posted-on", "time"];

const AMOUNT: &str = r"(\d[\d,]*(?:\.\d+)?)";
const PER_HOUR: &str = r"(?:/\s*(?:hr|hour)\b|per\s+hour\b)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BudgetShape {
    Hourly,
    /// Ranges keep only the lower bound.
    Fixed,
    FixedMarker,
    HourlyMarker,
}

struct BudgetPattern {
    name: &'static str,
    regex: Regex,
    shape: BudgetShape,
    /// Only trusted when the surrounding text says "hourly" somewhere.
    needs_hourly_context: bool,
}

fn budget_pattern_sources() -> Vec<(&'static str, String, BudgetShape, bool)> {
    vec![
        (
            "hourly_range",
            format!(r"(?i)\${AMOUNT}\s*-\s*\$?{AMOUNT}\s*{PER_HOUR}"),
            BudgetShape::Hourly,
            false,
        ),
        (
            "hourly_rate",
            format!(r"(?i)\${AMOUNT}\s*{PER_HOUR}"),
            BudgetShape::Hourly,
            false,
        ),
        (
            "hourly_labelled",
            format!(r"(?i)hourly(?:\s+(?:rate|range))?\s*:?\s*\${AMOUNT}(?:\s*-\s*\$?{AMOUNT})?"),
            BudgetShape::Hourly,
            false,
        ),
        (
            "fixed_price_labelled",
            format!(r"(?i)fixed[\s-]*price\s*:?\s*\${AMOUNT}"),
            BudgetShape::Fixed,
            false,
        ),
        (
            "bare_hourly_range",
            format!(r"(?i)\b{AMOUNT}\s*-\s*{AMOUNT}\s*{PER_HOUR}"),
            BudgetShape::Hourly,
            true,
        ),
        (
            "fixed_range",
            format!(r"(?i)\${AMOUNT}\s*-\s*\${AMOUNT}"),
            BudgetShape::Fixed,
            false,
        ),
        (
            "usd_range",
            format!(r"(?i)\b{AMOUNT}\s*-\s*{AMOUNT}\s*USD\b"),
            BudgetShape::Fixed,
            false,
        ),
        (
            "fixed_amount",
            format!(r"(?i)\${AMOUNT}"),
            BudgetShape::Fixed,
            false,
        ),
        (
            "fixed_price_marker",
            r"(?i)fixed[\s-]*price".to_string(),
            BudgetShape::FixedMarker,
            false,
        ),
        (
            "hourly_marker",
            r"(?i)\bhourly\b".to_string(),
            BudgetShape::HourlyMarker,
            false,
        ),
    ]
}

static BUDGET_PATTERNS: LazyLock<Vec<BudgetPattern>> = LazyLock::new(|| {
    budget_pattern_sources()
        .into_iter()
        .filter_map(|(name, source, shape, needs_hourly_context)| {
            Regex::new(&source).ok().map(|regex| BudgetPattern {
                name,
                regex,
                shape,
                needs_hourly_context,
            })
        })
        .collect()
});

static SPENT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\$(\d[\d,]*(?:\.\d+)?[km]?)\+?\s*spent").ok());
static RATING_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)rating\s*:\s*(\d+(?:\.\d+)?)").ok());
static VERIFIED_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\bpayment\s+(?:method\s+)?verified").ok());
static SKILLS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?im)skills\s*:\s*(.+?)\s*$").ok());
static BREAK_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</li>|</div>").ok());
static RSS_ITEM_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<item\b.*?</item>|<entry\b.*?</entry>").ok());

fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

fn evidence(pattern: &str, snippet: &str) -> Evidence {
    Evidence {
        selector_or_pattern: format!("budget/{pattern}"),
        snippet: snippet.trim().to_string(),
        extractor_version: EXTRACTOR_VERSION.to_string(),
    }
}

/// First matching budget pattern wins; pattern order is the tie-break.
///
/// Client spend (`$20k spent`) is not a budget and is masked out before matching.
pub fn extract_budget(text: &str) -> (Budget, Option<Evidence>) {
    let masked = match SPENT_RE.as_ref() {
        Some(re) => re.replace_all(text, " ").into_owned(),
        None => text.to_string(),
    };
    let hourly_context = masked.to_lowercase().contains("hourly");

    for pattern in BUDGET_PATTERNS.iter() {
        if pattern.needs_hourly_context && !hourly_context {
            continue;
        }
        let Some(caps) = pattern.regex.captures(&masked) else {
            continue;
        };
        let snippet = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let first = caps.get(1).and_then(|m| parse_amount(m.as_str()));
        let second = caps.get(2).and_then(|m| parse_amount(m.as_str()));

        let budget = match (pattern.shape, first) {
            (BudgetShape::Hourly, Some(min)) => Budget::Hourly { min, max: second },
            (BudgetShape::Fixed, Some(amount)) => Budget::Fixed { amount },
            (BudgetShape::FixedMarker | BudgetShape::HourlyMarker, _) => Budget::Unspecified,
            (_, None) => continue,
        };
        return (budget, Some(evidence(pattern.name, snippet)));
    }
    (Budget::Unspecified, None)
}

/// Tokens of an explicit `Skills:` line, split on `,` `;` `|`.
pub fn extract_skills(text: &str) -> Vec<String> {
    let Some(re) = SKILLS_RE.as_ref() else {
        return Vec::new();
    };
    let Some(caps) = re.captures(text) else {
        return Vec::new();
    };
    caps.get(1)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .split([',', ';', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn extract_client_signal(text: &str) -> ClientSignal {
    let rating = RATING_RE
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    let spent = SPENT_RE
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| format!("${}", m.as_str()));
    let payment_verified = VERIFIED_RE.as_ref().is_some_and(|re| re.is_match(text));
    ClientSignal {
        rating,
        spent,
        payment_verified,
    }
}

/// Canonical pain-point labels whose trigger phrases appear in `text`, in catalog order.
pub fn extract_pain_points(text: &str) -> Vec<String> {
    let text = text.to_lowercase();
    PAIN_POINT_CATALOG
        .iter()
        .filter(|(_, triggers)| triggers.iter().any(|t| text.contains(t)))
        .map(|(label, _)| label.to_string())
        .collect()
}

/// Markup to plain text, keeping line breaks so labelled lines (`Skills:`) stay separable.
pub fn html_to_text(markup: &str) -> String {
    let with_breaks = match BREAK_RE.as_ref() {
        Some(re) => re.replace_all(markup, "\n").into_owned(),
        None => markup.to_string(),
    };
    let fragment = Html::parse_fragment(&with_breaks);
    let text = fragment.root_element().text().collect::<String>();
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn clean_description(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn split_rss_items(feed: &str) -> Vec<RawItem> {
    let Some(re) = RSS_ITEM_RE.as_ref() else {
        return Vec::new();
    };
    re.find_iter(feed)
        .map(|m| RawItem::RssItem(m.as_str().to_string()))
        .collect()
}

/// Job tiles of a search results page, using the first tile selector that matches anything.
pub fn split_html_tiles(page: &str) -> Vec<RawItem> {
    let document = Html::parse_document(page);
    for css in TILE_SELECTORS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        let tiles = document
            .select(&selector)
            .map(|tile| RawItem::HtmlTile(tile.html()))
            .collect::<Vec<_>>();
        if !tiles.is_empty() {
            return tiles;
        }
    }
    Vec::new()
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = clean_description(&value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

fn select_first<'a>(root: ElementRef<'a>, selectors: &[&str]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|css| {
        let selector = Selector::parse(css).ok()?;
        root.select(&selector).next()
    })
}

fn select_first_text(root: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|css| {
        let selector = Selector::parse(css).ok()?;
        root.select(&selector)
            .find_map(|n| text_or_none(element_text(n)))
    })
}

fn select_all_texts(root: ElementRef<'_>, selectors: &[&str]) -> Vec<String> {
    for css in selectors {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        let texts = root
            .select(&selector)
            .filter_map(|n| text_or_none(element_text(n)))
            .collect::<Vec<_>>();
        if !texts.is_empty() {
            return texts;
        }
    }
    Vec::new()
}

struct RawFields {
    title: String,
    link: String,
    body_text: String,
    signal_text: String,
    skills: Vec<String>,
    posted_time: PostedTime,
}

fn assemble(fields: RawFields, campaign: &str, discovered_at: DateTime<Utc>) -> ListingRecord {
    let mut record = ListingRecord::empty(campaign, discovered_at);
    record.title = clean_description(&fields.title);
    if record.title.is_empty() {
        record.extraction_notes.push("missing title".into());
    }

    match canonical_identity(&fields.link) {
        Ok(identity) => {
            record.external_id = posting_id(&identity);
            record.identity = identity;
        }
        Err(err) => {
            record.extraction_failed = true;
            record.extraction_notes.push(format!("unusable posting link: {err}"));
        }
    }

    let (description, truncated) =
        truncate_description(&clean_description(&fields.body_text), DESCRIPTION_LIMIT);
    record.description = description;
    record.description_truncated = truncated;

    let (budget, budget_evidence) = extract_budget(&fields.signal_text);
    record.budget = budget;
    record.budget_evidence = budget_evidence;

    record.skills = if fields.skills.is_empty() {
        extract_skills(&fields.body_text)
    } else {
        fields.skills
    };
    record.client = extract_client_signal(&fields.signal_text);
    record.posted_time = fields.posted_time;
    record
}

/// Decode one raw item into a listing. Never fails: unusable markup yields a record
/// with `extraction_failed` set and a note saying why.
pub fn extract_listing(item: &RawItem, campaign: &str, discovered_at: DateTime<Utc>) -> ListingRecord {
    match item {
        RawItem::RssItem(xml) => extract_rss_item(xml, campaign, discovered_at),
        RawItem::HtmlTile(html) => extract_html_tile(html, campaign, discovered_at),
    }
}

fn extract_rss_item(xml: &str, campaign: &str, discovered_at: DateTime<Utc>) -> ListingRecord {
    // Atom entries need an Atom envelope for feed-rs to pick the right parser.
    let wrapped = if xml.trim_start().get(..6).is_some_and(|tag| tag.eq_ignore_ascii_case("<entry")) {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><feed xmlns="http://www.w3.org/2005/Atom"><title>discovery</title>{xml}</feed>"#
        )
    } else {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><rss version="2.0"><channel><title>discovery</title>{xml}</channel></rss>"#
        )
    };
    let feed = match feed_rs::parser::parse(wrapped.as_bytes()) {
        Ok(feed) => feed,
        Err(err) => {
            return ListingRecord::failed(campaign, discovered_at, format!("malformed rss item: {err}"));
        }
    };
    let Some(entry) = feed.entries.into_iter().next() else {
        return ListingRecord::failed(campaign, discovered_at, "rss fragment contains no item");
    };

    let title = entry.title.map(|t| t.content).unwrap_or_default();
    let link = entry
        .links
        .first()
        .map(|l| l.href.clone())
        .unwrap_or_default();
    let body_html = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .unwrap_or_default();
    let posted_time = entry
        .published
        .map(|ts| PostedTime::At(ts.with_timezone(&Utc)))
        .unwrap_or_default();

    let body_text = html_to_text(&body_html);
    assemble(
        RawFields {
            title,
            link,
            signal_text: body_text.clone(),
            body_text,
            skills: Vec::new(),
            posted_time,
        },
        campaign,
        discovered_at,
    )
}

fn extract_html_tile(html: &str, campaign: &str, discovered_at: DateTime<Utc>) -> ListingRecord {
    let fragment = Html::parse_fragment(html);
    let root = fragment.root_element();

    let title_link = select_first(root, TITLE_SELECTORS);
    let title = title_link
        .map(element_text)
        .or_else(|| select_first_text(root, &["h2", "h3"]))
        .unwrap_or_default();
    let link = title_link
        .and_then(|a| a.value().attr("href"))
        .unwrap_or_default()
        .to_string();
    if clean_description(&title).is_empty() && link.trim().is_empty() {
        return ListingRecord::failed(campaign, discovered_at, "job tile has no title or link");
    }

    let description = select_first(root, DESCRIPTION_SELECTORS)
        .map(|n| html_to_text(&n.inner_html()))
        .unwrap_or_default();

    let tile_text = element_text(root);
    let mut signal_text = clean_description(&tile_text);
    if !extract_budget(&signal_text).0.is_specified() {
        if let Some(budget_text) = BUDGET_SELECTORS.iter().find_map(|css| {
            let text = select_first_text(root, &[*css])?;
            extract_budget(&text).0.is_specified().then_some(text)
        }) {
            signal_text = format!("{budget_text}\n{signal_text}");
        }
    }

    let posted_time = select_first(root, POSTED_SELECTORS)
        .map(|n| {
            n.value()
                .attr("datetime")
                .map(PostedTime::parse)
                .unwrap_or_else(|| PostedTime::parse(&element_text(n)))
        })
        .unwrap_or_default();

    assemble(
        RawFields {
            title,
            link,
            body_text: description,
            signal_text,
            skills: select_all_texts(root, SKILL_SELECTORS),
            posted_time,
        },
        campaign,
        discovered_at,
    )
}
