//! Ordered document type.

use crate::value::Value;

/// A document: an ordered mapping of field names to values.
///
/// Field order is preserved through encoding and decoding. Fields are
/// addressed either by top-level name or by dotted path (`"address.city"`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a document from a list of fields, keeping their order.
    ///
    /// Later duplicates of a field name replace earlier ones in place.
    #[must_use]
    pub fn from_fields(fields: Vec<(String, Value)>) -> Self {
        let mut doc = Self::new();
        for (name, value) in fields {
            doc.set(name, value);
        }
        doc
    }

    /// Sets a top-level field, replacing it in place if it exists.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    /// Gets a top-level field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Removes a top-level field, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Resolves a dotted path (`"a.b.c"`) through nested documents.
    ///
    /// Array elements are not addressable by path; a path component that
    /// lands on an array resolves against each element's subdocuments is
    /// the caller's concern (see the index layer's multikey extraction).
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let value = current.get(part)?;
            if parts.peek().is_none() {
                return Some(value);
            }
            match value {
                Value::Document(doc) => current = doc,
                _ => return None,
            }
        }
        None
    }

    /// Sets a dotted path, creating intermediate documents as needed.
    ///
    /// Fails silently into a no-op only if an intermediate component exists
    /// and is not a document; the caller validates paths first.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let parts: Vec<&str> = path.split('.').collect();
        Self::set_path_inner(self, &parts, value);
    }

    fn set_path_inner(doc: &mut Document, parts: &[&str], value: Value) {
        match parts {
            [] => {}
            [leaf] => doc.set(*leaf, value),
            [head, rest @ ..] => {
                if !matches!(doc.get(head), Some(Value::Document(_))) {
                    doc.set(*head, Value::Document(Document::new()));
                }
                if let Some(Value::Document(inner)) = doc.get_mut(head) {
                    Self::set_path_inner(inner, rest, value);
                }
            }
        }
    }

    /// Removes a dotted path, returning the removed value.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head)? {
                Value::Document(inner) => inner.remove_path(rest),
                _ => None,
            },
        }
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Returns true if a top-level field exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// Iterates fields in order.
    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.fields.iter()
    }

    /// Returns the number of top-level fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self::from_fields(iter.into_iter().collect())
    }
}

/// Builds a [`Document`] from field literals.
///
/// ```rust
/// use arbordb_codec::{doc, Value};
///
/// let d = doc! { "_id" => 1_i64, "name" => "ada" };
/// assert_eq!(d.get("name"), Some(&Value::Text("ada".into())));
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::Document::new() };
    ( $( $name:expr => $value:expr ),+ $(,)? ) => {{
        let mut d = $crate::Document::new();
        $( d.set($name, $value); )+
        d
    }};
}
