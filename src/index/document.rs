//! Documents and fields as seen by the writer.
//!
//! A document is staged field by field into a private arena. If any field is
//! rejected (a stored value fails to serialize, or an indexed field repeats a
//! name with different [`IndexFeatures`]) the whole document is marked invalid
//! and its arena is dropped instead of being merged into the segment buffer.
//!
//! # Examples
//!
//! ```
//! use tessera::index::document::{Field, IndexFeatures};
//!
//! let title = Field::indexed("title", ["hello", "world"]);
//! let price = Field::stored("price", 42u64);
//! let both = Field::indexed_stored("sku", ["a-100"], "a-100").with_features(IndexFeatures::all());
//! assert_eq!(both.name(), "sku");
//! # let _ = (title, price);
//! ```

use std::fmt;
use std::ops::Range;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Optional per-term data an indexed field records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexFeatures {
    pub frequency: bool,
    pub position: bool,
    pub offset: bool,
    pub payload: bool,
}

impl IndexFeatures {
    pub const NONE: IndexFeatures = IndexFeatures {
        frequency: false,
        position: false,
        offset: false,
        payload: false,
    };

    pub fn all() -> Self {
        IndexFeatures {
            frequency: true,
            position: true,
            offset: true,
            payload: true,
        }
    }

    pub fn union(self, other: IndexFeatures) -> IndexFeatures {
        IndexFeatures {
            frequency: self.frequency || other.frequency,
            position: self.position || other.position,
            offset: self.offset || other.offset,
            payload: self.payload || other.payload,
        }
    }
}

/// How a field participates in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldAction {
    /// Tokens go to the inverted index only.
    Index,
    /// The value goes to the columnstore only.
    Store,
    /// Both.
    IndexAndStore,
}

impl FieldAction {
    pub fn indexes(self) -> bool {
        matches!(self, FieldAction::Index | FieldAction::IndexAndStore)
    }

    pub fn stores(self) -> bool {
        matches!(self, FieldAction::Store | FieldAction::IndexAndStore)
    }
}

/// Serializer for a stored value.
///
/// Returning `false` reports a serialization failure and invalidates the
/// document being staged.
pub trait StoredValue: Send + Sync {
    fn write(&self, out: &mut Vec<u8>) -> bool;
}

impl StoredValue for [u8] {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(self);
        true
    }
}

impl StoredValue for Vec<u8> {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(self);
        true
    }
}

impl StoredValue for str {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(self.as_bytes());
        true
    }
}

impl StoredValue for &str {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(self.as_bytes());
        true
    }
}

impl StoredValue for String {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(self.as_bytes());
        true
    }
}

impl StoredValue for u64 {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(&self.to_le_bytes());
        true
    }
}

impl StoredValue for i64 {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(&self.to_le_bytes());
        true
    }
}

impl StoredValue for f64 {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(&self.to_le_bytes());
        true
    }
}

/// A named field with its action, index features, tokens and stored value.
pub struct Field {
    name: String,
    action: FieldAction,
    features: IndexFeatures,
    tokens: Vec<Vec<u8>>,
    value: Option<Box<dyn StoredValue>>,
}

impl Field {
    /// An index-only field.
    pub fn indexed<I, T>(name: impl Into<String>, tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Field {
            name: name.into(),
            action: FieldAction::Index,
            features: IndexFeatures::NONE,
            tokens: tokens.into_iter().map(|t| t.as_ref().to_vec()).collect(),
            value: None,
        }
    }

    /// A store-only field.
    pub fn stored(name: impl Into<String>, value: impl StoredValue + 'static) -> Self {
        Field {
            name: name.into(),
            action: FieldAction::Store,
            features: IndexFeatures::NONE,
            tokens: Vec::new(),
            value: Some(Box::new(value)),
        }
    }

    /// A field that is both indexed and stored.
    pub fn indexed_stored<I, T>(
        name: impl Into<String>,
        tokens: I,
        value: impl StoredValue + 'static,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Field {
            action: FieldAction::IndexAndStore,
            value: Some(Box::new(value)),
            ..Field::indexed(name, tokens)
        }
    }

    pub fn with_features(mut self, features: IndexFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> FieldAction {
        self.action
    }

    pub fn features(&self) -> IndexFeatures {
        self.features
    }

    pub fn tokens(&self) -> &[Vec<u8>] {
        &self.tokens
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("features", &self.features)
            .field("tokens", &self.tokens.len())
            .field("stored", &self.value.is_some())
            .finish()
    }
}

/// Arena holding one document until it is committed into a segment buffer.
#[derive(Debug, Default)]
pub(crate) struct StagedDocument {
    pub(crate) indexed: Vec<(String, IndexFeatures, Vec<Vec<u8>>)>,
    pub(crate) stored: Vec<(String, Range<usize>)>,
    pub(crate) data: Vec<u8>,
    features: AHashMap<String, IndexFeatures>,
    valid: bool,
}

impl StagedDocument {
    pub(crate) fn clear(&mut self) {
        self.indexed.clear();
        self.stored.clear();
        self.data.clear();
        self.features.clear();
        self.valid = true;
    }

    fn stage_indexed(&mut self, name: &str, features: IndexFeatures, tokens: Vec<Vec<u8>>) -> bool {
        match self.features.get(name) {
            Some(&existing) if existing != features => {
                self.valid = false;
                return false;
            }
            Some(_) => {}
            None => {
                self.features.insert(name.to_string(), features);
            }
        }

        self.indexed.push((name.to_string(), features, tokens));
        true
    }

    fn stage_stored(&mut self, name: &str, value: &dyn StoredValue) -> bool {
        let start = self.data.len();
        if !value.write(&mut self.data) {
            self.data.truncate(start);
            self.valid = false;
            return false;
        }

        self.stored.push((name.to_string(), start..self.data.len()));
        true
    }
}

/// Handle used to fill in one document.
///
/// Every method returns `false` once the document is invalid; an invalid
/// document is discarded as a whole when the handle goes out of scope.
pub struct Document<'a> {
    staged: &'a mut StagedDocument,
}

impl<'a> Document<'a> {
    pub(crate) fn new(staged: &'a mut StagedDocument) -> Self {
        staged.clear();
        Document { staged }
    }

    /// Add a field according to its [`FieldAction`].
    pub fn insert(&mut self, field: &Field) -> bool {
        if !self.staged.valid {
            return false;
        }

        if field.action.indexes()
            && !self
                .staged
                .stage_indexed(&field.name, field.features, field.tokens.clone())
        {
            return false;
        }

        if field.action.stores() {
            let stored = match field.value.as_deref() {
                Some(value) => self.staged.stage_stored(&field.name, value),
                None => {
                    self.staged.valid = false;
                    false
                }
            };
            if !stored {
                return false;
            }
        }

        true
    }

    /// Index `tokens` under `name`.
    pub fn index<I, T>(&mut self, name: &str, features: IndexFeatures, tokens: I) -> bool
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        if !self.staged.valid {
            return false;
        }

        let tokens = tokens.into_iter().map(|t| t.as_ref().to_vec()).collect();
        self.staged.stage_indexed(name, features, tokens)
    }

    /// Store `value` in column `name`.
    pub fn store<V: StoredValue + ?Sized>(&mut self, name: &str, value: &V) -> bool {
        if !self.staged.valid {
            return false;
        }

        self.staged.stage_stored(name, &ValueRef(value))
    }

    /// Index `tokens` under `name` and store `value` in the column of the same name.
    pub fn index_and_store<I, T, V>(
        &mut self,
        name: &str,
        features: IndexFeatures,
        tokens: I,
        value: &V,
    ) -> bool
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
        V: StoredValue + ?Sized,
    {
        self.index(name, features, tokens) && self.store(name, value)
    }

    /// Whether every field added so far was accepted.
    pub fn is_valid(&self) -> bool {
        self.staged.valid
    }

    /// Whether no field was added yet.
    pub fn is_empty(&self) -> bool {
        self.staged.indexed.is_empty() && self.staged.stored.is_empty()
    }
}

struct ValueRef<'v, V: ?Sized>(&'v V);

impl<V: StoredValue + ?Sized> StoredValue for ValueRef<'_, V> {
    fn write(&self, out: &mut Vec<u8>) -> bool {
        self.0.write(out)
    }
}
