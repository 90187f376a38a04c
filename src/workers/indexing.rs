//! Indexing stage: takes newly recorded changes and marks them indexed once
//! the parser has been through them.

use super::Stage;

pub struct IndexingStage;

impl Stage for IndexingStage {
    fn name(&self) -> &'static str {
        "indexing"
    }

    fn pending_sql(&self) -> &'static str {
        "SELECT id, path FROM file_changes WHERE indexed = 0 ORDER BY id LIMIT ?"
    }

    fn complete_sql(&self) -> &'static str {
        "UPDATE file_changes SET indexed = 1, indexed_at = ? WHERE id = ?"
    }
}
