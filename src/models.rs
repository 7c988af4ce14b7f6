//! Typed payloads returned by the upstream API.
//!
//! Fields the upstream omits on some versions are `Option`. Identifiers are required so
//! that error payloads never masquerade as an (empty) entity.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Timestamp layout used by `created_at` fields, e.g. `Wed Aug 27 13:08:45 +0000 2008`.
const API_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Parses any timestamp layout the upstream is known to emit.
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, API_TIME_FORMAT) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

/// An account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Numeric account id.
    pub id: u64,
    /// The id as a string, for clients without 64-bit integers.
    pub id_str: Option<String>,
    /// The handle, without the leading `@`.
    pub screen_name: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Profile bio.
    pub description: Option<String>,
    /// Free-form location text.
    pub location: Option<String>,
    /// Homepage link.
    pub url: Option<String>,
    /// Avatar image link.
    pub profile_image_url: Option<String>,
    /// Accounts following this one.
    pub followers_count: Option<u64>,
    /// Accounts this one follows.
    pub friends_count: Option<u64>,
    /// Statuses posted.
    pub statuses_count: Option<u64>,
    /// Statuses favorited.
    pub favourites_count: Option<u64>,
    /// Whether statuses are only visible to approved followers.
    pub protected: Option<bool>,
    /// Whether the account is verified.
    pub verified: Option<bool>,
    /// Creation time in the upstream's text layout.
    pub created_at: Option<String>,
    /// The most recent status, when the endpoint embeds it.
    pub status: Option<Box<Status>>,
}

impl User {
    /// `created_at` as a UTC timestamp.
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_timestamp)
    }
}

/// A status update (tweet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Numeric status id.
    pub id: u64,
    /// The id as a string.
    pub id_str: Option<String>,
    /// The status text.
    pub text: Option<String>,
    /// Creation time in the upstream's text layout.
    pub created_at: Option<String>,
    /// The posting application, often as an HTML link.
    pub source: Option<String>,
    /// Whether the text was cut short.
    pub truncated: Option<bool>,
    /// Whether the authenticated account favorited it.
    pub favorited: Option<bool>,
    /// Times this status was retweeted.
    pub retweet_count: Option<u64>,
    /// The status this one replies to.
    pub in_reply_to_status_id: Option<u64>,
    /// The author of the status this one replies to.
    pub in_reply_to_user_id: Option<u64>,
    /// Handle of the author this one replies to.
    pub in_reply_to_screen_name: Option<String>,
    /// The author, unless the request trimmed it.
    pub user: Option<Box<User>>,
    /// The original status when this one is a retweet.
    pub retweeted_status: Option<Box<Status>>,
    /// Entities change shape between versions and are kept untyped.
    pub entities: Option<Value>,
}

impl Status {
    /// `created_at` as a UTC timestamp.
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_timestamp)
    }
}

/// A curated list of accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    /// Numeric list id.
    pub id: u64,
    /// Display name.
    pub name: Option<String>,
    /// `@owner/slug`.
    pub full_name: Option<String>,
    /// URL-safe name, unique per owner.
    pub slug: Option<String>,
    /// Owner-supplied description.
    pub description: Option<String>,
    /// `public` or `private`.
    pub mode: Option<String>,
    /// Path of the list relative to the site root.
    pub uri: Option<String>,
    /// Accounts on the list.
    pub member_count: Option<u64>,
    /// Accounts subscribed to the list.
    pub subscriber_count: Option<u64>,
    /// Whether the authenticated account follows the list.
    pub following: Option<bool>,
    /// The owner.
    pub user: Option<User>,
}

/// A private message between two accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Numeric message id.
    pub id: u64,
    /// The message text.
    pub text: Option<String>,
    /// Creation time in the upstream's text layout.
    pub created_at: Option<String>,
    /// Id of the sending account.
    pub sender_id: Option<u64>,
    /// Id of the receiving account.
    pub recipient_id: Option<u64>,
    /// Handle of the sending account.
    pub sender_screen_name: Option<String>,
    /// Handle of the receiving account.
    pub recipient_screen_name: Option<String>,
    /// The sending account.
    pub sender: Option<User>,
    /// The receiving account.
    pub recipient: Option<User>,
}

/// A search stored on the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    /// Numeric saved search id.
    pub id: u64,
    /// Display name.
    pub name: Option<String>,
    /// The search terms.
    pub query: Option<String>,
    /// Sort position among the account's saved searches.
    pub position: Option<i64>,
    /// Creation time in the upstream's text layout.
    pub created_at: Option<String>,
}

/// A "Where On Earth" place that trends are reported for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereOnEarthLocation {
    /// The Where On Earth id.
    pub woeid: i64,
    /// Place name.
    pub name: Option<String>,
    /// Country name.
    pub country: Option<String>,
    /// Two-letter country code.
    #[serde(rename = "countryCode")]
    pub country_code: Option<String>,
    /// Link to the place's trends.
    pub url: Option<String>,
    /// Woeid of the enclosing place.
    #[serde(rename = "parentid")]
    pub parent_id: Option<i64>,
    /// Place kind (town, country...). Its shape varies, so it stays untyped.
    #[serde(rename = "placeType")]
    pub place_type: Option<Value>,
}

/// An application-level error reported by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable message.
    pub message: Option<String>,
    /// Numeric error code (current schema only).
    pub code: Option<i64>,
    /// The request path the error refers to (legacy schema only).
    pub request: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{} (code {})", message, code),
            (None, Some(message)) => f.write_str(message),
            (Some(code), None) => write!(f, "error code {}", code),
            (None, None) => write!(
                f,
                "error on {}",
                self.request.as_deref().unwrap_or("unknown request")
            ),
        }
    }
}

/// A status as returned by the search endpoint, which uses its own flattened schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStatus {
    /// Numeric status id.
    pub id: u64,
    /// The status text.
    pub text: Option<String>,
    /// Handle of the author.
    pub from_user: Option<String>,
    /// Id of the author.
    pub from_user_id: Option<u64>,
    /// Handle of the addressee, for replies.
    pub to_user: Option<String>,
    /// Id of the addressee, for replies.
    pub to_user_id: Option<u64>,
    /// Avatar of the author.
    pub profile_image_url: Option<String>,
    /// Creation time (RFC 2822 on this endpoint).
    pub created_at: Option<String>,
    /// Detected language.
    pub iso_language_code: Option<String>,
    /// The posting application, HTML-escaped.
    pub source: Option<String>,
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchResult {
    /// Matches that decoded; malformed entries are dropped.
    #[serde(default)]
    pub results: Vec<SearchStatus>,
    /// Highest status id in the page.
    pub max_id: Option<u64>,
    /// Lower id bound the search was run with.
    pub since_id: Option<u64>,
    /// Query string that fetches newer results.
    pub refresh_url: Option<String>,
    /// Query string of the following page.
    pub next_page: Option<String>,
    /// Page size.
    pub results_per_page: Option<u32>,
    /// One-based page number.
    pub page: Option<u32>,
    /// Server-side search time in seconds.
    pub completed_in: Option<f64>,
    /// The search terms, as echoed back.
    pub query: Option<String>,
}

/// A trending topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    /// The topic.
    pub name: String,
    /// Search terms that find it.
    pub query: Option<String>,
    /// Link to the search page.
    pub url: Option<String>,
    /// Advertising metadata, when the trend is paid.
    pub promoted_content: Option<Value>,
    /// The period the trend was reported for.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Trending topics, flattened across all reported periods.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrendsResult {
    /// When the upstream computed the trends.
    pub as_of: Option<DateTime<Utc>>,
    /// Every trend across all reported periods.
    #[serde(default)]
    pub trends: Vec<Trend>,
    /// Places the trends apply to.
    #[serde(default)]
    pub locations: Vec<WhereOnEarthLocation>,
}

/// One page of a cursor-paginated collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursored<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Cursor of the next page; `0` on the last page.
    pub next_cursor: Option<i64>,
    /// Cursor of the previous page; `0` on the first page.
    pub previous_cursor: Option<i64>,
}

impl<T> Cursored<T> {
    /// Returns `true` if the upstream reported another page.
    ///
    /// A next cursor of `0` marks the last page.
    pub fn has_next(&self) -> bool {
        self.next_cursor.is_some_and(|c| c != 0)
    }
}
