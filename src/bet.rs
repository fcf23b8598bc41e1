//! Bet records and the batch text parser.

use std::fmt;

/// A single bet placed at an agency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetRecord {
    pub agency_id: String,
    pub first_name: String,
    pub last_name: String,
    pub document_id: String,
    pub birthdate: String,
    pub chosen_number: String,
}

/// A record line did not have exactly six fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bet format: {line:?}")]
pub struct InvalidBetFormat {
    pub line: String,
}

impl BetRecord {
    /// Parse one comma-separated record line.
    pub fn parse_line(line: &str) -> Result<Self, InvalidBetFormat> {
        let fields: Vec<&str> = line.split(',').collect();
        let [agency_id, first_name, last_name, document_id, birthdate, chosen_number] =
            fields[..]
        else {
            return Err(InvalidBetFormat {
                line: line.to_string(),
            });
        };

        Ok(Self {
            agency_id: agency_id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            document_id: document_id.to_string(),
            birthdate: birthdate.to_string(),
            chosen_number: chosen_number.to_string(),
        })
    }
}

impl fmt::Display for BetRecord {
    /// Formats the record as its wire/storage line, without a line break.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            self.agency_id,
            self.first_name,
            self.last_name,
            self.document_id,
            self.birthdate,
            self.chosen_number
        )
    }
}

/// Parse a batch payload into records, in line order.
///
/// Blank lines are skipped. The first line without exactly six fields aborts
/// the whole batch.
pub fn parse_batch(text: &str) -> Result<Vec<BetRecord>, InvalidBetFormat> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(BetRecord::parse_line)
        .collect()
}
