//! Command parsing and per-command handlers.
//!
//! Handlers are transport-agnostic: they take an [`Invocation`] and a
//! [`RecordSource`] and produce a [`Reply`]. `bot.rs` does the Telegram side.

use anyhow::Result;
use tracing::error;

use crate::api::{ApiResponse, Record, RecordSource};
use crate::format::{format_record_markdown, format_records};

pub const HELP_TEXT: &str = "👋 Welcome!\n\n\
                             You can:\n\
                             /record <number> - Get a record by number\n\
                             /search <query> - Search records\n\
                             /carrier <name> - View carrier data\n";

pub const MISSING_RECORD_NUMBER: &str = "⚠ Please provide a record number.";
pub const MISSING_SEARCH_QUERY: &str = "⚠ Please provide a search query.";
pub const MISSING_CARRIER_NAME: &str = "⚠ Please provide a carrier name.";

pub const RECORD_NOT_FOUND: &str = "❌ Record not found.";
pub const NO_MATCHING_RECORDS: &str = "❌ No matching records found.";
pub const NO_CARRIER_RECORDS: &str = "❌ No records found for that carrier.";

pub const SERVICE_UNAVAILABLE: &str =
    "⚠ The record service is unavailable right now. Please try again later.";

/// Commands shown in the Telegram command menu, as `(name, description)`.
pub const MENU: &[(&str, &str)] = &[
    ("start", "Show available commands"),
    ("record", "Get a record by number"),
    ("search", "Search records"),
    ("carrier", "View carrier data"),
];

/// A parsed slash-command: lowercased name plus whitespace-separated args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub name: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Parse `/cmd[@botname] arg...`. Returns `None` for non-command text or
    /// a command addressed to a different bot.
    pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Self> {
        let mut tokens = text.split_whitespace();
        let head = tokens.next()?.strip_prefix('/')?;

        let (name, target) = match head.split_once('@') {
            Some((name, target)) => (name, Some(target)),
            None => (head, None),
        };

        if let (Some(target), Some(me)) = (target, bot_username) {
            if !target.eq_ignore_ascii_case(me) {
                return None;
            }
        }

        if name.is_empty() {
            return None;
        }

        Some(Self {
            name: name.to_lowercase(),
            args: tokens.map(str::to_string).collect(),
        })
    }
}

/// Text to send back and whether it is MarkdownV2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub markdown: bool,
}

impl Reply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markdown: false,
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markdown: true,
        }
    }
}

/// Limits applied by the list handlers.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub per_page: u32,
    pub max_results: usize,
}

/// Route an invocation to its handler. `None` for unknown commands.
pub async fn dispatch(
    invocation: &Invocation,
    source: &dyn RecordSource,
    limits: Limits,
) -> Option<Reply> {
    let reply = match invocation.name.as_str() {
        "start" | "help" => Reply::plain(HELP_TEXT),
        "record" => record_cmd(&invocation.args, source).await,
        "search" => search_cmd(&invocation.args, source, limits).await,
        "carrier" => carrier_cmd(&invocation.args, source, limits).await,
        _ => return None,
    };
    Some(reply)
}

/// Whether the command talks to the record API (used for the typing indicator).
pub fn needs_lookup(invocation: &Invocation) -> bool {
    matches!(invocation.name.as_str(), "record" | "search" | "carrier")
        && !invocation.args.is_empty()
}

fn service_failure(what: &str, err: anyhow::Error) -> Reply {
    error!("Record API {} failed: {:#}", what, err);
    Reply::plain(SERVICE_UNAVAILABLE)
}

async fn record_cmd(args: &[String], source: &dyn RecordSource) -> Reply {
    let Some(number) = args.first() else {
        return Reply::plain(MISSING_RECORD_NUMBER);
    };

    match source.get_record(number).await {
        Ok(ApiResponse {
            ok: true,
            record: Some(record),
            ..
        }) if !record.is_empty() => Reply::markdown(format_record_markdown(&record)),
        Ok(_) => Reply::plain(RECORD_NOT_FOUND),
        Err(e) => service_failure("record lookup", e),
    }
}

async fn search_cmd(args: &[String], source: &dyn RecordSource, limits: Limits) -> Reply {
    if args.is_empty() {
        return Reply::plain(MISSING_SEARCH_QUERY);
    }
    let query = args.join(" ");

    list_reply(
        source.search_records(&query).await,
        |data| data.results,
        limits,
        NO_MATCHING_RECORDS,
        "search",
    )
}

async fn carrier_cmd(args: &[String], source: &dyn RecordSource, limits: Limits) -> Reply {
    let Some(carrier) = args.first() else {
        return Reply::plain(MISSING_CARRIER_NAME);
    };

    list_reply(
        source
            .get_records(1, limits.per_page, Some(carrier.as_str()))
            .await,
        |data| data.records,
        limits,
        NO_CARRIER_RECORDS,
        "carrier listing",
    )
}

fn list_reply(
    response: Result<ApiResponse>,
    pick: impl FnOnce(ApiResponse) -> Option<Vec<Record>>,
    limits: Limits,
    empty_text: &str,
    what: &str,
) -> Reply {
    match response {
        Ok(data) if data.ok => {
            // Empty objects would render as a blank message
            let records: Vec<Record> = pick(data)
                .unwrap_or_default()
                .into_iter()
                .filter(|record| !record.is_empty())
                .collect();
            if records.is_empty() {
                Reply::plain(empty_text)
            } else {
                Reply::markdown(format_records(&records, limits.max_results))
            }
        }
        Ok(_) => Reply::plain(empty_text),
        Err(e) => service_failure(what, e),
    }
}
