//! Vectorization stage: picks up indexed rows and marks them vectorized.

use super::Stage;

pub struct VectorizationStage;

impl Stage for VectorizationStage {
    fn name(&self) -> &'static str {
        "vectorization"
    }

    // Deleted files have nothing to embed but still leave the queue this way
    fn pending_sql(&self) -> &'static str {
        "SELECT id, path FROM file_changes WHERE indexed = 1 AND vectorized = 0 ORDER BY id LIMIT ?"
    }

    fn complete_sql(&self) -> &'static str {
        "UPDATE file_changes SET vectorized = 1, vectorized_at = ? WHERE id = ?"
    }
}
