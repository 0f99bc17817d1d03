use crate::error::{PayError, Result};
use serde::Deserialize;
use std::io::Read;

/// One row of the simulator input.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Submission {
    pub op: Op,
    pub account: u64,
    #[serde(default)]
    pub msats: Option<u64>,
    /// Tip recipient account.
    #[serde(default)]
    pub recipient: Option<u64>,
    /// Whether a tip recipient supplies their own wallet invoice, turning the
    /// tip into a forward.
    #[serde(default)]
    pub p2p: Option<bool>,
    #[serde(default)]
    pub max_fee_msats: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// Seeds an account balance before the run.
    Fund,
    Donate,
    Tip,
    Withdraw,
}

/// Reads submissions from a CSV source.
///
/// Wraps `csv::Reader` and provides an iterator over `Result<Submission>`,
/// with whitespace trimming and flexible record lengths.
pub struct SubmissionReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> SubmissionReader<R> {
    /// Creates a new `SubmissionReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes submissions.
    pub fn submissions(self) -> impl Iterator<Item = Result<Submission>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PayError::from))
    }
}
