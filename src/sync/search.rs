//! Message search over the in-memory corpus
//!
//! Filters are hard: a message failing any set filter is dropped. The query
//! text only ranks, so a filter-only search still returns every message that
//! passes. Scores are additive:
//!
//! | signal              | points |
//! |---------------------|--------|
//! | query text match    | 10     |
//! | sender match        | 15     |
//! | content type match  | 8      |
//! | attachment presence | 3      |
//! | reaction presence   | 3      |

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::sync::store::MessageStore;
use crate::types::{ContentKind, Message};

const TEXT_SCORE: u32 = 10;
const SENDER_SCORE: u32 = 15;
const KIND_SCORE: u32 = 8;
const ATTACHMENT_SCORE: u32 = 3;
const REACTION_SCORE: u32 = 3;

/// Inclusive timestamp range; an open end is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start_ns: Option<i64>,
    pub end_ns: Option<i64>,
}

impl DateRange {
    pub fn between(start_ns: i64, end_ns: i64) -> Self {
        Self {
            start_ns: Some(start_ns),
            end_ns: Some(end_ns),
        }
    }

    pub fn contains(&self, timestamp_ns: i64) -> bool {
        self.start_ns.map_or(true, |start| timestamp_ns >= start)
            && self.end_ns.map_or(true, |end| timestamp_ns <= end)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Relevance,
    Date,
    Sender,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Structured search query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub query: Option<String>,
    pub date_range: Option<DateRange>,
    pub sender: Option<String>,
    pub kind: Option<ContentKind>,
    pub has_attachments: Option<bool>,
    pub has_reactions: Option<bool>,
    /// Restrict to one conversation
    pub conversation_id: Option<String>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl SearchFilters {
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    fn needle(&self) -> Option<String> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_ascii_lowercase)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub message: Message,
    pub score: u32,
    /// Byte ranges of query matches in the message text
    pub highlights: Vec<Range<usize>>,
}

/// One page of results plus the number of matches before pagination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub total: usize,
    pub results: Vec<SearchResult>,
}

/// Score `message`, or `None` if a hard filter rejects it
fn score(message: &Message, filters: &SearchFilters, needle: Option<&str>) -> Option<u32> {
    if let Some(range) = &filters.date_range {
        if !range.contains(message.sent_at_ns) {
            return None;
        }
    }
    if let Some(conversation_id) = &filters.conversation_id {
        if &message.conversation_id != conversation_id {
            return None;
        }
    }

    let mut score = 0;
    if let Some(sender) = filters.sender.as_deref() {
        if !message.sender.eq_ignore_ascii_case(sender.trim()) {
            return None;
        }
        score += SENDER_SCORE;
    }
    if let Some(kind) = filters.kind {
        if message.content.kind() != kind {
            return None;
        }
        score += KIND_SCORE;
    }
    if let Some(wanted) = filters.has_attachments {
        if message.has_attachments() != wanted {
            return None;
        }
        score += ATTACHMENT_SCORE;
    }
    if let Some(wanted) = filters.has_reactions {
        if message.has_reactions() != wanted {
            return None;
        }
        score += REACTION_SCORE;
    }
    if let Some(needle) = needle {
        let haystack = message.content.searchable_text().to_ascii_lowercase();
        if haystack.contains(needle) || message.sender.to_ascii_lowercase().contains(needle) {
            score += TEXT_SCORE;
        }
    }
    Some(score)
}

fn compare(a: &SearchResult, b: &SearchResult, sort_by: SortBy, order: SortOrder) -> Ordering {
    let newest_first = || b.message.sent_at_ns.cmp(&a.message.sent_at_ns);
    let primary = match sort_by {
        SortBy::Relevance => a.score.cmp(&b.score),
        SortBy::Date => a.message.sent_at_ns.cmp(&b.message.sent_at_ns),
        SortBy::Sender => a
            .message
            .sender
            .to_ascii_lowercase()
            .cmp(&b.message.sender.to_ascii_lowercase()),
    };
    let primary = match order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    primary
        .then_with(newest_first)
        .then_with(|| a.message.id.cmp(&b.message.id))
}

/// Search a corpus; pure and deterministic
pub fn search(messages: &[Message], filters: &SearchFilters) -> SearchPage {
    let needle = filters.needle();

    let mut results: Vec<SearchResult> = messages
        .iter()
        .filter_map(|message| {
            let score = score(message, filters, needle.as_deref())?;
            let highlights = match (&needle, message.content.text.as_deref()) {
                (Some(needle), Some(text)) => highlight_ranges(text, needle),
                _ => Vec::new(),
            };
            Some(SearchResult {
                message: message.clone(),
                score,
                highlights,
            })
        })
        .collect();

    results.sort_by(|a, b| compare(a, b, filters.sort_by, filters.sort_order));

    let total = results.len();
    let limit = filters.limit.unwrap_or(usize::MAX);
    let results = results
        .into_iter()
        .skip(filters.offset)
        .take(limit)
        .collect();
    SearchPage { total, results }
}

/// Case-insensitive (ASCII) byte ranges of `needle` in `text`
pub fn highlight_ranges(text: &str, needle: &str) -> Vec<Range<usize>> {
    let needle = needle.to_ascii_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    let hay = text.to_ascii_lowercase();
    let mut ranges = Vec::new();
    let mut i = 0;
    while let Some(rel) = hay[i..].find(&needle) {
        let start = i + rel;
        let end = start + needle.len();
        ranges.push(start..end);
        i = end;
    }
    ranges
}

/// Search over the live message store
pub struct SearchIndex {
    store: Arc<MessageStore>,
    config: SearchConfig,
}

impl SearchIndex {
    pub fn new(store: Arc<MessageStore>, config: SearchConfig) -> Self {
        Self { store, config }
    }

    /// Run `filters` against a snapshot
    ///
    /// A query without a limit returns every match unless a page size is
    /// configured in `[search] default_limit`.
    pub fn query(&self, filters: &SearchFilters) -> SearchPage {
        match (filters.limit, self.config.default_limit) {
            (None, Some(page_size)) => {
                let filters = SearchFilters {
                    limit: Some(page_size),
                    ..filters.clone()
                };
                search(&self.store.snapshot(), &filters)
            }
            _ => search(&self.store.snapshot(), filters),
        }
    }
}
