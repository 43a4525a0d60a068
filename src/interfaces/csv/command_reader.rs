use crate::error::{NegotiationError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Request,
    Offer,
    Update,
}

/// One row of a negotiation script.
///
/// `request` is the request id. `response` is a script-local label for an offer: an `offer`
/// row names the offer it creates, an `update` row names the offer it changes. `at` moves the
/// replay clock before the command runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandRecord {
    pub op: CommandKind,
    pub actor: String,
    pub request: String,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub price_type: Option<String>,
    #[serde(default)]
    pub buyer_status: Option<String>,
    #[serde(default)]
    pub seller_status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// Reads negotiation commands from a CSV source.
///
/// Whitespace is trimmed and short rows are accepted; missing trailing columns read as empty.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes commands, one `Result` per row.
    pub fn commands(self) -> impl Iterator<Item = Result<CommandRecord>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(NegotiationError::from))
    }
}
