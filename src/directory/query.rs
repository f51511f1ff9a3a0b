//! Boolean filter expressions over index documents.
//!
//! Filters are built from typed values and only turned into query syntax by
//! the backend, so user input never reaches the index unescaped.

use crate::directory::index::Document;
use serde_json::Value;

/// A boolean expression over document fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Every document
    All,
    /// Field equals the value exactly
    Eq {
        /// Field name
        field: String,
        /// Expected value
        value: String,
    },
    /// Field equals one of the values
    AnyOf {
        /// Field name
        field: String,
        /// Accepted values
        values: Vec<String>,
    },
    /// Full-text match: every word of `text` occurs in the field
    Match {
        /// Field name
        field: String,
        /// Free text typed by a user
        text: String,
    },
    /// All sub-filters hold
    And(Vec<Filter>),
    /// At least one sub-filter holds
    Or(Vec<Filter>),
    /// The sub-filter does not hold
    Not(Box<Filter>),
}

impl Filter {
    /// `field == value`
    pub fn eq(field: &str, value: impl Into<String>) -> Self {
        Filter::Eq { field: field.to_string(), value: value.into() }
    }

    /// `field in values`
    pub fn any_of<I, S>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::AnyOf {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Full-text match on `field`
    pub fn matches(field: &str, text: impl Into<String>) -> Self {
        Filter::Match { field: field.to_string(), text: text.into() }
    }

    /// Negation
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Render as a Lucene/Solr standard query string.
    pub fn to_solr(&self) -> String {
        match self {
            Filter::All => "*:*".to_string(),
            Filter::Eq { field, value } => format!("{}:{}", field, escape_query_chars(value)),
            Filter::AnyOf { values, .. } if values.is_empty() => "(*:* -*:*)".to_string(),
            Filter::AnyOf { field, values } => {
                let alternatives: Vec<String> = values.iter().map(|v| escape_query_chars(v)).collect();
                format!("{}:({})", field, alternatives.join(" OR "))
            }
            Filter::Match { field, text } => format!("{}:({})", field, escape_query_chars(text)),
            Filter::And(parts) => join(parts, " AND "),
            Filter::Or(parts) => join(parts, " OR "),
            Filter::Not(inner) => format!("(*:* -({}))", inner.to_solr()),
        }
    }

    /// Evaluate against a document held in memory.
    pub fn evaluate(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => field_values(doc, field).iter().any(|v| v == value),
            Filter::AnyOf { field, values } => field_values(doc, field)
                .iter()
                .any(|v| values.iter().any(|candidate| candidate == v)),
            Filter::Match { field, text } => {
                let terms: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
                field_values(doc, field).iter().any(|v| {
                    let haystack = v.to_lowercase();
                    terms.iter().all(|term| haystack.contains(term.as_str()))
                })
            }
            Filter::And(parts) => parts.iter().all(|f| f.evaluate(doc)),
            Filter::Or(parts) => parts.iter().any(|f| f.evaluate(doc)),
            Filter::Not(inner) => !inner.evaluate(doc),
        }
    }
}

fn join(parts: &[Filter], separator: &str) -> String {
    if parts.is_empty() {
        return "*:*".to_string();
    }
    parts
        .iter()
        .map(|p| format!("({})", p.to_solr()))
        .collect::<Vec<_>>()
        .join(separator)
}

/// Scalar values of a field as strings; multi-valued fields yield each entry.
fn field_values(doc: &Document, field: &str) -> Vec<String> {
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    match doc.get(field) {
        Some(Value::Array(items)) => items.iter().filter_map(scalar).collect(),
        Some(value) => scalar(value).into_iter().collect(),
        None => Vec::new(),
    }
}

/// A bounded query returning selected fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Which documents match
    pub filter: Filter,
    /// Fields to return, all when empty
    pub fields: Vec<String>,
    /// Maximum documents returned
    pub rows: usize,
}

impl Query {
    /// Query returning `fields` of at most `rows` matching documents.
    pub fn new(filter: Filter, fields: &[&str], rows: usize) -> Self {
        Self {
            filter,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            rows,
        }
    }
}

/// Escape query syntax characters in user input.
///
/// Mirrors the Solr client utility: every special character and all
/// whitespace is backslash-escaped.
pub fn escape_query_chars(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 2);
    for c in input.chars() {
        if matches!(
            c,
            '\\' | '+' | '-' | '!' | '(' | ')' | ':' | '^' | '[' | ']' | '"' | '{' | '}' | '~' | '*'
                | '?' | '|' | '&' | ';' | '/'
        ) || c.is_whitespace()
        {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(escape_query_chars("a+b"), "a\\+b");
        assert_eq!(escape_query_chars("my song (live).mp3"), "my\\ song\\ \\(live\\).mp3");
        assert_eq!(escape_query_chars("x:y OR *"), "x\\:y\\ OR\\ \\*");
        assert_eq!(escape_query_chars("plain"), "plain");
    }

    #[test]
    fn test_render_online_peers_query() {
        let filter = Filter::And(vec![
            Filter::eq("doc_type_s", "user"),
            Filter::eq("status_s", "online"),
            Filter::not(Filter::eq("username_s", "bob smith")),
        ]);
        assert_eq!(
            filter.to_solr(),
            "(doc_type_s:user) AND (status_s:online) AND ((*:* -(username_s:bob\\ smith)))"
        );
    }

    #[test]
    fn test_render_owner_set_and_text() {
        let filter = Filter::And(vec![
            Filter::any_of("owner_username_s", ["alice", "c-3po"]),
            Filter::matches("filename_txt_en", "live set"),
        ]);
        assert_eq!(
            filter.to_solr(),
            "(owner_username_s:(alice OR c\\-3po)) AND (filename_txt_en:(live\\ set))"
        );
    }

    #[test]
    fn test_evaluate_in_memory() {
        let file = doc(json!({
            "doc_type_s": "file",
            "owner_username_s": "alice",
            "filename_txt_en": "Live Set 2019.mp3",
            "size_l": 42
        }));
        assert!(Filter::eq("size_l", "42").evaluate(&file));
        assert!(Filter::matches("filename_txt_en", "set live").evaluate(&file));
        assert!(!Filter::matches("filename_txt_en", "studio").evaluate(&file));
        assert!(Filter::any_of("owner_username_s", ["bob", "alice"]).evaluate(&file));
        assert!(!Filter::any_of("owner_username_s", Vec::<String>::new()).evaluate(&file));
        assert!(Filter::not(Filter::eq("owner_username_s", "bob")).evaluate(&file));
        assert!(!Filter::eq("missing", "x").evaluate(&file));
    }

    proptest! {
        #[test]
        fn prop_escaping_is_reversible(input in "\\PC{0,24}") {
            let escaped = escape_query_chars(&input);
            let mut restored = String::new();
            let mut chars = escaped.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    restored.extend(chars.next());
                } else {
                    let special = "+-!():^[]\"{}~*?|&;/";
                    prop_assert!(!c.is_whitespace() && !special.contains(c));
                    restored.push(c);
                }
            }
            prop_assert_eq!(restored, input);
        }
    }
}
