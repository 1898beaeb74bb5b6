//! Filters, mutations, and sort specifications.
//!
//! This is deliberately not a query language: the dispatch layer above
//! the core translates whatever surface syntax it speaks into these
//! structures. Matching follows document-database conventions: a
//! comparison against an array field matches if any element matches.

use arbordb_codec::{Document, Value};
use std::cmp::Ordering;

/// A predicate over documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Field equals value (or an array element equals it).
    Eq(String, Value),
    /// Negation of [`Filter::Eq`].
    Ne(String, Value),
    /// Field is less than value.
    Lt(String, Value),
    /// Field is less than or equal to value.
    Lte(String, Value),
    /// Field is greater than value.
    Gt(String, Value),
    /// Field is greater than or equal to value.
    Gte(String, Value),
    /// Field equals any of the values.
    In(String, Vec<Value>),
    /// All sub-filters match.
    And(Vec<Filter>),
}

impl Filter {
    /// Tests a document against the filter.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => field_matches(doc, field, |v| v == value),
            Filter::Ne(field, value) => !field_matches(doc, field, |v| v == value),
            Filter::Lt(field, value) => {
                field_matches(doc, field, |v| v.cmp_order(value) == Ordering::Less)
            }
            Filter::Lte(field, value) => {
                field_matches(doc, field, |v| v.cmp_order(value) != Ordering::Greater)
            }
            Filter::Gt(field, value) => {
                field_matches(doc, field, |v| v.cmp_order(value) == Ordering::Greater)
            }
            Filter::Gte(field, value) => {
                field_matches(doc, field, |v| v.cmp_order(value) != Ordering::Less)
            }
            Filter::In(field, values) => {
                field_matches(doc, field, |v| values.iter().any(|want| v == want))
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }

    /// If the filter pins every primary-key field to an equality, returns
    /// the key values in pattern order.
    #[must_use]
    pub fn pk_point(&self, pk_pattern: &[String]) -> Option<Vec<Value>> {
        pk_pattern
            .iter()
            .map(|field| self.eq_on(field).cloned())
            .collect()
    }

    /// Returns the value this filter pins `field` to by equality, if any.
    #[must_use]
    pub fn eq_on(&self, field: &str) -> Option<&Value> {
        match self {
            Filter::Eq(f, value) if f == field => Some(value),
            Filter::And(filters) => filters.iter().find_map(|f| f.eq_on(field)),
            _ => None,
        }
    }
}

/// Tests a field against a predicate, matching array elements too.
fn field_matches<F>(doc: &Document, field: &str, pred: F) -> bool
where
    F: Fn(&Value) -> bool,
{
    match doc.get_path(field) {
        Some(Value::Array(elements)) => {
            elements.iter().any(|e| pred(e)) || pred(&Value::Array(elements.clone()))
        }
        Some(value) => pred(value),
        None => pred(&Value::Null),
    }
}

/// A document mutation applied by update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Replace the whole document (primary-key fields must be unchanged).
    Replace(Document),
    /// Set fields by dotted path.
    Set(Vec<(String, Value)>),
    /// Remove fields by dotted path.
    Unset(Vec<String>),
}

impl Mutation {
    /// Applies the mutation, returning the new document.
    #[must_use]
    pub fn apply(&self, doc: &Document) -> Document {
        match self {
            Mutation::Replace(new_doc) => new_doc.clone(),
            Mutation::Set(fields) => {
                let mut out = doc.clone();
                for (path, value) in fields {
                    out.set_path(path, value.clone());
                }
                out
            }
            Mutation::Unset(paths) => {
                let mut out = doc.clone();
                for path in paths {
                    out.remove_path(path);
                }
                out
            }
        }
    }

    /// The set of field paths the mutation can touch; `None` means any
    /// (whole-document replacement).
    #[must_use]
    pub fn touched_paths(&self) -> Option<Vec<&str>> {
        match self {
            Mutation::Replace(_) => None,
            Mutation::Set(fields) => Some(fields.iter().map(|(p, _)| p.as_str()).collect()),
            Mutation::Unset(paths) => Some(paths.iter().map(String::as_str).collect()),
        }
    }
}

/// Sort order over result documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    /// Fields and directions, most significant first; `true` = ascending.
    pub fields: Vec<(String, bool)>,
}

impl SortSpec {
    /// An ascending sort on one field.
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            fields: vec![(field.into(), true)],
        }
    }

    /// A descending sort on one field.
    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            fields: vec![(field.into(), false)],
        }
    }

    /// Compares two documents under the sort.
    #[must_use]
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, ascending) in &self.fields {
            let av = a.get_path(field).cloned().unwrap_or(Value::Null);
            let bv = b.get_path(field).cloned().unwrap_or(Value::Null);
            let ord = av.cmp_order(&bv);
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// True when the sort is exactly ascending primary-key order, which a
    /// partition-ordered scan already produces.
    #[must_use]
    pub fn is_pk_order(&self, pk_pattern: &[String]) -> bool {
        self.fields.len() == pk_pattern.len()
            && self
                .fields
                .iter()
                .zip(pk_pattern)
                .all(|((field, ascending), pk)| *ascending && field == pk)
    }
}
