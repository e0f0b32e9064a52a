use seine_wire::message::FilterSpec;
use sha2::{Digest, Sha256};

use crate::{Result, SearchError};

/// Content-derived identity of a filter: a hash over its code, arguments,
/// and blob. Stable across sessions, so servers can use it as a cache key;
/// also the filter's name when the author does not supply one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 32]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            // Length-prefix every part so (["ab"], ["a","b"]) cannot collide.
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One named unit of server-side computation.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    name: Option<String>,
    code: Vec<u8>,
    blob: Vec<u8>,
    dependencies: Vec<String>,
    min_score: f64,
    max_score: f64,
    arguments: Vec<String>,
}

impl Filter {
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            name: None,
            code,
            blob: Vec::new(),
            dependencies: Vec::new(),
            min_score: f64::NEG_INFINITY,
            max_score: f64::INFINITY,
            arguments: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = blob;
        self
    }

    /// Filters that must run before this one.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_thresholds(mut self, min_score: f64, max_score: f64) -> Self {
        self.min_score = min_score;
        self.max_score = max_score;
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Hash of code ‖ arguments ‖ blob.
    pub fn signature(&self) -> Signature {
        let mut parts: Vec<&[u8]> = vec![&self.code];
        for arg in &self.arguments {
            parts.push(arg.as_bytes());
        }
        parts.push(&self.blob);
        Signature::of_parts(&parts)
    }

    /// The explicit name, or the signature when none was given.
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.signature().to_string(),
        }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub(crate) fn to_spec(&self) -> FilterSpec {
        FilterSpec {
            name: self.name(),
            dependencies: self.dependencies.clone(),
            code_signature: Signature::of_parts(&[&self.code]).to_string(),
            blob_signature: if self.blob.is_empty() {
                String::new()
            } else {
                Signature::of_parts(&[&self.blob]).to_string()
            },
            min_score: self.min_score,
            max_score: self.max_score,
            arguments: self.arguments.clone(),
        }
    }
}

/// The filters for one search, with unique names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    filters: Vec<Filter>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects a second filter with the same effective name.
    pub fn add(&mut self, filter: Filter) -> Result<()> {
        let name = filter.name();
        if self.filters.iter().any(|f| f.name() == name) {
            return Err(SearchError::DuplicateFilter(name));
        }
        self.filters.push(filter);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter()
    }

    pub(crate) fn to_specs(&self) -> Vec<FilterSpec> {
        self.filters.iter().map(Filter::to_spec).collect()
    }

    /// `(name, bytes)` pairs for `SET_BLOBS`. Each filter contributes its
    /// code first and then, when present, its blob argument under the same
    /// name; the server distinguishes them by order.
    pub(crate) fn blobs(&self) -> Vec<(String, Vec<u8>)> {
        let mut blobs = Vec::new();
        for filter in &self.filters {
            blobs.push((filter.name(), filter.code.clone()));
            if !filter.blob.is_empty() {
                blobs.push((filter.name(), filter.blob.clone()));
            }
        }
        blobs
    }
}
