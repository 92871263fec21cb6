//! Search-stage pipelines for endpoints backed by a full-text index.
//!
//! These never mix with predicate clauses: an endpoint either hands the store a
//! conjunction for `find` or one of these pipelines for `aggregate`.

use std::sync::LazyLock;

use bson::{Document, doc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::ListingError;
use crate::types::paths;

use super::pagination::Page;

const MIN_ADDRESS_LEN: usize = 10;
const MIN_WILDCARD_OPERAND: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSearchRequest {
    pub unparsed_address: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

/// Operator of a `"<op>:<operand>"` search expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOperator {
    Eq,
    Like,
}

impl SearchOperator {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "eq" => Some(Self::Eq),
            "like" => Some(Self::Like),
            _ => None,
        }
    }
}

fn quoted(path: &str, value: &str) -> String {
    format!("{path}:\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Address query string: the address term plus any of city/state/postal code,
/// joined with `AND`.
///
/// # Errors
/// `InvalidArgument` when the trimmed address is shorter than ten characters.
pub fn address_query(req: &AddressSearchRequest) -> Result<String, ListingError> {
    if req.unparsed_address.trim().chars().count() < MIN_ADDRESS_LEN {
        return Err(ListingError::InvalidArgument(
            "Invalid input. UnparsedAddress: the length must be no less than 10.".into(),
        ));
    }
    let mut terms = vec![quoted(paths::UNPARSED_ADDRESS, &req.unparsed_address)];
    for (path, value) in [
        (paths::CITY, &req.city),
        (paths::STATE_OR_PROVINCE, &req.state),
        (paths::POSTAL_CODE, &req.postal_code),
    ] {
        if !value.is_empty() {
            terms.push(quoted(path, value));
        }
    }
    Ok(terms.join(" AND "))
}

/// `$search` pipeline over the address index.
///
/// # Errors
/// See [`address_query`].
pub fn address_search(req: &AddressSearchRequest, index: &str) -> Result<Vec<Document>, ListingError> {
    let query = address_query(req)?;
    Ok(vec![doc! {
        "$search": {
            "index": index,
            "queryString": {
                "defaultPath": paths::UNPARSED_ADDRESS,
                "query": query,
            },
        }
    }])
}

/// Splits `"<op>:<operand>"`. Anything without exactly one `:` has no operand.
#[must_use]
pub fn parse_search_expression(raw: &str) -> (Option<SearchOperator>, String) {
    let mut parts = raw.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(op), Some(operand), None) => (SearchOperator::parse(op), operand.trim().to_owned()),
        _ => (None, String::new()),
    }
}

/// Wildcard search on `listing_id`, followed by `$skip` then `$limit`.
///
/// # Errors
/// `InvalidArgument` for an unknown operator or an operand shorter than three
/// characters.
pub fn listing_id_search(expression: &str, index: &str, page: Page) -> Result<Vec<Document>, ListingError> {
    let (op, operand) = parse_search_expression(expression);
    if operand.chars().count() < MIN_WILDCARD_OPERAND {
        return Err(ListingError::InvalidArgument(
            "Invalid input. minimum 3 chars required to search listings".into(),
        ));
    }
    let query = match op {
        Some(SearchOperator::Like) => format!("*{operand}*"),
        Some(SearchOperator::Eq) => operand,
        None => {
            return Err(ListingError::InvalidArgument(format!(
                "Invalid input. unsupported search operator in '{expression}'"
            )));
        }
    };
    Ok(vec![
        doc! {
            "$search": {
                "index": index,
                "wildcard": {
                    "path": paths::LISTING_ID,
                    "query": query,
                    "allowAnalyzedField": true,
                },
            }
        },
        doc! { "$skip": page.offset },
        doc! { "$limit": page.limit },
    ])
}

/// One `path:"value"`, `"value"` or bare term, followed by ` AND ` or the end.
static QUERY_TERM: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?:([^\s:"]+):"((?:[^"\\]|\\.)*)"|"((?:[^"\\]|\\.)*)"|([^"]+?))(?:\s+AND\s+|\s*$)"#).ok()
});
static ESCAPED: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\\(.)").ok());

/// Reads `path:"value"` terms back out of a query string built by [`address_query`].
///
/// Terms are separated by ` AND `; a bare term applies to `default_path`.
#[must_use]
pub fn parse_query_string(query: &str, default_path: &str) -> Vec<(String, String)> {
    let (Some(term), Some(escaped)) = (QUERY_TERM.as_ref(), ESCAPED.as_ref()) else {
        return Vec::new();
    };
    term.captures_iter(query.trim())
        .filter_map(|c| {
            let path = c.get(1).map_or(default_path, |m| m.as_str());
            let value = match (c.get(2).or_else(|| c.get(3)), c.get(4)) {
                (Some(quoted), _) => escaped.replace_all(quoted.as_str(), "$1").into_owned(),
                (None, Some(bare)) => bare.as_str().trim().to_owned(),
                (None, None) => return None,
            };
            Some((path.to_owned(), value))
        })
        .collect()
}

/// Compiles a search wildcard into an anchored, case-insensitive regex:
/// `*` matches any run and `?` exactly one character; everything else is literal.
#[must_use]
pub fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let mut source = String::from("^");
    let mut literal = String::new();
    for c in pattern.chars() {
        let wildcard = match c {
            '*' => ".*",
            '?' => ".",
            _ => {
                literal.push(c);
                continue;
            }
        };
        source.push_str(&regex::escape(&literal));
        source.push_str(wildcard);
        literal.clear();
    }
    source.push_str(&regex::escape(&literal));
    source.push('$');
    RegexBuilder::new(&source).case_insensitive(true).dot_matches_new_line(true).build().ok()
}

/// Glob match supporting `*` (any run) and `?` (one character), case-insensitively.
#[must_use]
pub fn wildcard_matches(pattern: &str, text: &str) -> bool {
    wildcard_regex(pattern).is_some_and(|re| re.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_terms_join_with_and() {
        let req = AddressSearchRequest {
            unparsed_address: "12 Main Street".into(),
            city: "Austin".into(),
            postal_code: "78701".into(),
            ..Default::default()
        };
        assert_eq!(
            address_query(&req).unwrap(),
            "property.location.address.unparsed_address:\"12 Main Street\" AND \
             property.location.address.city:\"Austin\" AND \
             property.location.address.postal_code:\"78701\""
        );
    }

    #[test]
    fn short_address_rejected() {
        let req = AddressSearchRequest { unparsed_address: "  12 Main  ".into(), ..Default::default() };
        assert!(matches!(address_query(&req), Err(ListingError::InvalidArgument(_))));
    }

    #[test]
    fn query_string_parses_back() {
        let req = AddressSearchRequest {
            unparsed_address: "5 \"Old\" Mill Road".into(),
            state: "TX".into(),
            ..Default::default()
        };
        let terms = parse_query_string(&address_query(&req).unwrap(), paths::UNPARSED_ADDRESS);
        assert_eq!(
            terms,
            vec![
                (paths::UNPARSED_ADDRESS.to_owned(), "5 \"Old\" Mill Road".to_owned()),
                (paths::STATE_OR_PROVINCE.to_owned(), "TX".to_owned()),
            ]
        );
    }

    #[test]
    fn like_wraps_operand_and_pages() {
        let stages = listing_id_search("like:123", "listingIdSearchIdx", Page { limit: 20, offset: 40 }).unwrap();
        assert_eq!(stages.len(), 3);
        let wildcard = stages[0].get_document("$search").unwrap().get_document("wildcard").unwrap();
        assert_eq!(wildcard.get_str("query").unwrap(), "*123*");
        assert_eq!(stages[1], doc! { "$skip": 40_i64 });
        assert_eq!(stages[2], doc! { "$limit": 20_i64 });
    }

    #[test]
    fn short_operand_rejected() {
        assert!(listing_id_search("like:12", "idx", Page { limit: 20, offset: 0 }).is_err());
        assert!(listing_id_search("12345", "idx", Page { limit: 20, offset: 0 }).is_err());
    }

    #[test]
    fn glob_matching() {
        assert!(wildcard_matches("*123*", "AB1234"));
        assert!(wildcard_matches("ab?2", "AB12"));
        assert!(!wildcard_matches("*999*", "AB1234"));
    }

    #[test]
    fn query_string_bare_terms_use_the_default_path() {
        let terms = parse_query_string("12 Main AND city:\"Rock AND Roll\"", "addr");
        assert_eq!(
            terms,
            vec![("addr".to_owned(), "12 Main".to_owned()), ("city".to_owned(), "Rock AND Roll".to_owned())]
        );
        assert!(parse_query_string("   ", "addr").is_empty());
    }

    #[test]
    fn wildcard_metacharacters_are_literal() {
        assert!(wildcard_matches("*1.2*", "AB1.2C"));
        assert!(!wildcard_matches("*1.2*", "AB1x2C"));
        assert!(wildcard_matches("(a+)*", "(A+)suffix"));
        assert!(!wildcard_matches("ab", "xaby"));
        assert!(wildcard_regex("[unclosed*").is_some());
    }
}
