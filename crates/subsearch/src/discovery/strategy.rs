//! Query strategies and how a keyword expands into them.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::{CatalogClient, CatalogError, Listing};

/// Highest breadth level; every strategy runs.
pub const MAX_BREADTH: u8 = 5;

/// Per-token searches fetch at least this many results.
const MIN_TOKEN_LIMIT: usize = 100;

const AFFIX_SUFFIXES: &[&str] = &["s", "hub", "_irl", "memes", "help", "news"];
const AFFIX_PREFIXES: &[&str] = &["ask", "the", "true"];

static RE_TOKEN_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]+").unwrap());

/// Which global listing a sampling strategy draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    Popular,
    Newest,
}

/// One independent query against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Full-text search capped at the result cap.
    Primary { query: String, limit: usize },
    /// Partial name match, including the space/underscore variant.
    Name { query: String },
    /// Full-text search for a single keyword token.
    Token { token: String, limit: usize },
    /// Name match for a keyword combined with a common naming affix.
    Affix { variant: String },
    /// A slice of a global listing, filtered locally against the keyword.
    Sample { source: SampleSource, limit: usize },
}

impl Strategy {
    pub fn open(&self, client: &dyn CatalogClient) -> Result<Listing, CatalogError> {
        match self {
            Strategy::Primary { query, limit } => client.search(query, *limit),
            Strategy::Name { query } => client.search_by_name(query),
            Strategy::Token { token, limit } => client.search(token, *limit),
            Strategy::Affix { variant } => client.search_by_name(variant),
            Strategy::Sample {
                source: SampleSource::Popular,
                limit,
            } => client.popular(*limit),
            Strategy::Sample {
                source: SampleSource::Newest,
                limit,
            } => client.newest(*limit),
        }
    }

    /// Sampled listings are not keyword-scoped server side.
    pub fn needs_local_match(&self) -> bool {
        matches!(self, Strategy::Sample { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Strategy::Primary { .. } => "primary",
            Strategy::Name { .. } => "name",
            Strategy::Token { .. } => "token",
            Strategy::Affix { .. } => "affix",
            Strategy::Sample {
                source: SampleSource::Popular,
                ..
            } => "sample_popular",
            Strategy::Sample {
                source: SampleSource::Newest,
                ..
            } => "sample_newest",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Primary { query, .. } | Strategy::Name { query } => {
                write!(f, "{}('{}')", self.kind(), query)
            }
            Strategy::Token { token, .. } => write!(f, "token('{}')", token),
            Strategy::Affix { variant } => write!(f, "affix('{}')", variant),
            Strategy::Sample { limit, .. } => write!(f, "{}({})", self.kind(), limit),
        }
    }
}

/// Knobs that shape the strategy plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanSettings {
    pub popular_sample_max: usize,
    pub min_token_len: usize,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            popular_sample_max: 500,
            min_token_len: 3,
        }
    }
}

/// Splits a keyword on non-alphanumeric boundaries into distinct lower-case tokens.
pub fn tokenize(keyword: &str, min_len: usize) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in RE_TOKEN_SPLIT.split(keyword) {
        let token = token.to_lowercase();
        if token.chars().count() >= min_len.max(1) && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// The keyword with spaces and underscores swapped, if it has either.
pub fn name_variant(keyword: &str) -> Option<String> {
    if !keyword.contains(' ') && !keyword.contains('_') {
        return None;
    }
    let swapped: String = keyword
        .chars()
        .map(|c| match c {
            ' ' => '_',
            '_' => ' ',
            other => other,
        })
        .collect();
    (swapped != keyword).then_some(swapped)
}

/// Plural, prefix, and suffix forms of the compacted keyword.
pub fn affix_variants(keyword: &str) -> Vec<String> {
    let compact: String = keyword
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    if compact.is_empty() {
        return Vec::new();
    }

    AFFIX_SUFFIXES
        .iter()
        .map(|suffix| format!("{}{}", compact, suffix))
        .chain(AFFIX_PREFIXES.iter().map(|prefix| format!("{}{}", prefix, compact)))
        .collect()
}

/// Builds the ordered strategy list for one discovery run.
///
/// Strategies run in cost order and each breadth level adds one family:
/// 1 primary, 2 name, 3 tokens, 4 affixes, 5 sampling.
pub fn plan(keyword: &str, result_cap: usize, breadth: u8, settings: &PlanSettings) -> Vec<Strategy> {
    let breadth = breadth.clamp(1, MAX_BREADTH);
    let keyword = keyword.trim();
    let lowered = keyword.to_lowercase();
    let mut strategies = vec![Strategy::Primary {
        query: keyword.to_string(),
        limit: result_cap,
    }];

    if breadth >= 2 {
        strategies.push(Strategy::Name {
            query: keyword.to_string(),
        });
        if let Some(variant) = name_variant(keyword) {
            strategies.push(Strategy::Name { query: variant });
        }
    }

    if breadth >= 3 {
        let limit = MIN_TOKEN_LIMIT.max(result_cap / 3);
        strategies.extend(
            tokenize(keyword, settings.min_token_len)
                .into_iter()
                .filter(|token| *token != lowered)
                .map(|token| Strategy::Token { token, limit }),
        );
    }

    if breadth >= 4 {
        strategies.extend(
            affix_variants(keyword)
                .into_iter()
                .map(|variant| Strategy::Affix { variant }),
        );
    }

    if breadth >= 5 {
        let sip = settings.popular_sample_max.min(result_cap);
        if sip > 0 {
            strategies.push(Strategy::Sample {
                source: SampleSource::Popular,
                limit: sip,
            });
        }
        if sip / 2 > 0 {
            strategies.push(Strategy::Sample {
                source: SampleSource::Newest,
                limit: sip / 2,
            });
        }
    }

    strategies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Home-Lab setups", 3), vec!["home", "lab", "setups"]);
        assert_eq!(tokenize("a b cd", 3), Vec::<String>::new());
        assert_eq!(tokenize("rust rust", 3), vec!["rust"]);
        assert_eq!(tokenize("snake_case", 3), vec!["snake", "case"]);
    }

    #[test]
    fn test_name_variant() {
        assert_eq!(name_variant("ask science").as_deref(), Some("ask_science"));
        assert_eq!(name_variant("ask_science").as_deref(), Some("ask science"));
        assert_eq!(name_variant("science"), None);
    }

    #[test]
    fn test_affix_variants() {
        let variants = affix_variants("Board Games");
        assert!(variants.contains(&"boardgamess".to_string()));
        assert!(variants.contains(&"askboardgames".to_string()));
        assert!(variants.contains(&"boardgameshub".to_string()));
        assert_eq!(variants.len(), AFFIX_SUFFIXES.len() + AFFIX_PREFIXES.len());
        assert!(affix_variants("!!!").is_empty());
    }

    #[test]
    fn test_breadth_gates() {
        let settings = PlanSettings::default();
        let kinds = |breadth| -> Vec<&'static str> {
            plan("retro games", 300, breadth, &settings)
                .iter()
                .map(|s| s.kind())
                .collect()
        };

        assert_eq!(kinds(1), vec!["primary"]);
        assert_eq!(kinds(2), vec!["primary", "name", "name"]);
        assert_eq!(kinds(3).iter().filter(|k| **k == "token").count(), 2);
        assert!(kinds(4).contains(&"affix"));
        assert!(!kinds(4).contains(&"sample_popular"));
        let full = kinds(5);
        assert_eq!(full.last(), Some(&"sample_newest"));
        assert_eq!(kinds(0), kinds(1));
        assert_eq!(kinds(9), full);
    }

    #[test]
    fn test_token_strategy_skips_keyword_itself() {
        let strategies = plan("rust", 50, 3, &PlanSettings::default());
        assert!(!strategies.iter().any(|s| matches!(s, Strategy::Token { .. })));
    }

    #[test]
    fn test_limits() {
        let strategies = plan("retro games", 900, 5, &PlanSettings::default());
        assert_eq!(
            strategies[0],
            Strategy::Primary {
                query: "retro games".to_string(),
                limit: 900
            }
        );
        assert!(strategies.contains(&Strategy::Token {
            token: "retro".to_string(),
            limit: 300
        }));
        assert!(strategies.contains(&Strategy::Sample {
            source: SampleSource::Popular,
            limit: 500
        }));
        assert!(strategies.contains(&Strategy::Sample {
            source: SampleSource::Newest,
            limit: 250
        }));
    }
}
