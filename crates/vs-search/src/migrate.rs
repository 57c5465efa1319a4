//! # Mapping Migrator
//!
//! Runs at the top of every scan: declares the scanner-owned detection
//! fields on each indicator index so the write-back and the eligibility
//! range query agree on types. Idempotent, a no-op on already-migrated
//! indices. Failure here is fatal for the scan.

use serde_json::json;

use crate::{SearchBackend, SearchError};

/// Ensure `threat.detection.timestamp` (date, epoch millis) and
/// `threat.detection.matches` (long) exist on every indicator index.
pub async fn ensure_detection_mapping(
    backend: &dyn SearchBackend,
    indices: &[String],
) -> Result<(), SearchError> {
    let properties = json!({
        "properties": {
            "threat": {
                "properties": {
                    "detection": {
                        "properties": {
                            "timestamp": { "type": "date" },
                            "matches": { "type": "long" }
                        }
                    }
                }
            }
        }
    });

    for index in indices {
        backend.put_mapping(index, &properties).await?;
        tracing::debug!(index = %index, "detection mapping ensured");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[tokio::test]
    async fn test_mapping_put_on_every_index() {
        let backend = MemoryBackend::new();
        let indices = vec!["threats-a".to_string(), "threats-b".to_string()];
        ensure_detection_mapping(&backend, &indices).await.unwrap();

        for index in &indices {
            let mappings = backend.mappings_for(index).await;
            assert_eq!(mappings.len(), 1);
            assert_eq!(
                mappings[0].pointer(
                    "/properties/threat/properties/detection/properties/timestamp/type"
                ),
                Some(&serde_json::json!("date"))
            );
        }
    }

    #[tokio::test]
    async fn test_repeat_migration_is_harmless() {
        let backend = MemoryBackend::new();
        let indices = vec!["threats".to_string()];
        ensure_detection_mapping(&backend, &indices).await.unwrap();
        ensure_detection_mapping(&backend, &indices).await.unwrap();
        assert_eq!(backend.mappings_for("threats").await.len(), 2);
    }
}
