//! Per-entity tracking record

use serde_json::Value;

/// Everything the session knows about one tracked document.
///
/// `document` is the snapshot captured at load/store/save time and serves as
/// the diff baseline; `entity` is the latest state the caller handed us. The
/// two drifting apart is what makes an entity dirty.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    /// Document id
    pub id: String,
    /// Last-known server change vector; `None` until first persisted
    pub change_vector: Option<String>,
    /// Document metadata (`@metadata` block)
    pub metadata: Value,
    /// Snapshot baseline, never mutated between saves
    pub document: Value,
    /// Latest entity state provided by the caller
    pub entity: Value,
    /// True until the first successful save of this document
    pub new_document: bool,
}

impl DocumentInfo {
    /// Track a brand-new entity that has never been persisted
    pub fn new_entity(id: String, entity: Value) -> Self {
        Self {
            id,
            change_vector: None,
            metadata: Value::Null,
            document: Value::Null,
            entity,
            new_document: true,
        }
    }

    /// Track a document as the server returned it
    pub fn from_server(id: String, change_vector: Option<String>, document: Value) -> Self {
        let metadata = document.get("@metadata").cloned().unwrap_or(Value::Null);
        Self {
            id,
            change_vector,
            metadata,
            entity: document.clone(),
            document,
            new_document: false,
        }
    }

    /// Whether the entity diverged from its snapshot baseline.
    ///
    /// Comparison is deep and by value (`serde_json::Value` equality walks
    /// arrays and objects structurally), so reverting a field in memory makes
    /// the entity clean again.
    pub fn is_dirty(&self) -> bool {
        self.new_document || self.entity != self.document
    }

    /// Rebaseline after a successful save
    pub fn on_saved(&mut self, change_vector: Option<String>) {
        self.change_vector = change_vector;
        self.document = self.entity.clone();
        self.new_document = false;
    }
}
