//! User-supplied extractors that derive scope tags and log fields from an
//! inbound context.
//!
//! Extractors run once per inbound call, after the endpoint seeded the
//! context with its own tags and the inbound headers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{LogField, RequestContext};

/// Derives extra metric tags from a context.
pub type ScopeTagsExtractor =
    Arc<dyn Fn(&RequestContext) -> BTreeMap<String, String> + Send + Sync>;

/// Derives extra log fields from a context.
pub type LogFieldsExtractor = Arc<dyn Fn(&RequestContext) -> Vec<LogField> + Send + Sync>;

/// Ordered collection of extractors.
#[derive(Clone, Default)]
pub struct ContextExtractors {
    scope_tags: Vec<ScopeTagsExtractor>,
    log_fields: Vec<LogFieldsExtractor>,
}

impl fmt::Debug for ContextExtractors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextExtractors")
            .field("scope_tags", &self.scope_tags.len())
            .field("log_fields", &self.log_fields.len())
            .finish()
    }
}

impl ContextExtractors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scope_tags_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.scope_tags.push(Arc::new(f));
        self
    }

    pub fn add_log_fields_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> Vec<LogField> + Send + Sync + 'static,
    {
        self.log_fields.push(Arc::new(f));
        self
    }

    /// Union of every scope-tag extractor's output; later extractors win.
    pub fn extract_scope_tags(&self, ctx: &RequestContext) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        for extractor in &self.scope_tags {
            tags.extend(extractor(ctx));
        }
        tags
    }

    pub fn extract_log_fields(&self, ctx: &RequestContext) -> Vec<LogField> {
        self.log_fields.iter().flat_map(|e| e(ctx)).collect()
    }

    /// Derive a context carrying everything the extractors produce.
    pub fn apply(&self, ctx: &RequestContext) -> RequestContext {
        if self.scope_tags.is_empty() && self.log_fields.is_empty() {
            return ctx.clone();
        }
        let tags = self.extract_scope_tags(ctx);
        let fields = self.extract_log_fields(ctx);
        ctx.with_scope_tags(tags).with_log_fields(fields)
    }
}
