//! Okapi BM25 over the output of FTS4's `matchinfo(table, 'pcnalx')`.
//!
//! The blob is a sequence of native-endian `u32`:
//! `p` phrases, `c` columns, `n` rows, `a[c]` average tokens per column,
//! `l[c]` tokens in this row per column, then `x[3 * p * c]` hit triples of
//! (hits in this row, hits in all rows, rows with a hit).

const K1: f64 = 1.2;
const B: f64 = 0.75;
const MIN_IDF: f64 = 1e-6;

pub const TITLE: usize = 2;
pub const SUBTITLE: usize = 3;
pub const DESCRIPTION: usize = 4;
pub const SPEAKERS: usize = 5;
pub const TRACK: usize = 6;

/// Column weights for the combined score.
pub const WEIGHTS: [(usize, f64); 5] = [
    (TITLE, 8.0),
    (SUBTITLE, 4.0),
    (DESCRIPTION, 1.0),
    (SPEAKERS, 4.0),
    (TRACK, 2.0),
];

/// Added for items the user set a reminder on, so they always come first.
pub const REMIND_BOOST: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchInfo {
    phrases: usize,
    columns: usize,
    rows: u32,
    avg_tokens: Vec<u32>,
    row_tokens: Vec<u32>,
    hits: Vec<u32>,
}

impl MatchInfo {
    pub fn parse(blob: &[u8]) -> Option<Self> {
        if blob.len() % 4 != 0 {
            return None;
        }
        let words: Vec<u32> = blob
            .chunks_exact(4)
            .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Self::from_words(&words)
    }

    fn from_words(words: &[u32]) -> Option<Self> {
        let (&phrases, rest) = words.split_first()?;
        let (&columns, rest) = rest.split_first()?;
        let (&rows, rest) = rest.split_first()?;
        let (phrases, columns) = (phrases as usize, columns as usize);

        if rest.len() != 2 * columns + 3 * phrases * columns {
            return None;
        }
        let (avg_tokens, rest) = rest.split_at(columns);
        let (row_tokens, hits) = rest.split_at(columns);

        Some(Self {
            phrases,
            columns,
            rows,
            avg_tokens: avg_tokens.to_vec(),
            row_tokens: row_tokens.to_vec(),
            hits: hits.to_vec(),
        })
    }

    /// BM25 of this row for one column, summed over the query's phrases.
    pub fn score(&self, column: usize) -> f64 {
        if column >= self.columns {
            return 0.0;
        }
        let rows = self.rows as f64;
        let avg = self.avg_tokens[column] as f64;
        let len = self.row_tokens[column] as f64;

        (0..self.phrases)
            .map(|phrase| {
                let base = 3 * (column + phrase * self.columns);
                let tf = self.hits[base] as f64;
                let rows_with_hit = self.hits[base + 2] as f64;
                // An empty column can't contribute, and its zero average would poison the ratio.
                if tf == 0.0 || avg == 0.0 {
                    return 0.0;
                }
                let idf = ((rows - rows_with_hit + 0.5) / (rows_with_hit + 0.5))
                    .ln()
                    .max(MIN_IDF);
                idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * len / avg))
            })
            .sum()
    }

    /// Weighted sum over the item text columns.
    pub fn weighted(&self) -> f64 {
        WEIGHTS
            .iter()
            .map(|&(column, weight)| weight * self.score(column))
            .sum()
    }
}

pub fn item_score(info: &MatchInfo, remind: bool) -> f64 {
    let score = info.weighted();
    if remind {
        score + REMIND_BOOST
    } else {
        score
    }
}
