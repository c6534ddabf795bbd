//! JSON-lines export and import.
//!
//! One memory per line: the note fields plus `vector` as a base64-encoded
//! little-endian f32 array. Lines are order-independent; import upserts by
//! id, so double-import produces no duplicates.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{BufRead, Write};
use tracing::{debug, warn};
use uuid::Uuid;

use anchor_store::filter::PayloadFilter;
use anchor_store::vector::{Point, VectorIndex};
use anchor_types::error::{AnchorError, AnchorResult};

/// Page size used when scrolling the collection.
const EXPORT_PAGE: usize = 256;

#[derive(Serialize, Deserialize)]
struct ExportLine {
    id: Uuid,
    #[serde(flatten)]
    payload: Map<String, Value>,
    vector: String,
}

/// Encode a vector as base64 little-endian f32 bytes.
fn encode_vector(vector: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode a base64 little-endian f32 array.
fn decode_vector(encoded: &str) -> AnchorResult<Vec<f32>> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| AnchorError::Serialization(format!("bad vector encoding: {e}")))?;
    if bytes.len() % 4 != 0 {
        return Err(AnchorError::Serialization(
            "vector byte length not a multiple of 4".to_string(),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Export every point in the collection as JSON lines.
pub fn export_collection(
    index: &dyn VectorIndex,
    collection: &str,
    writer: &mut dyn Write,
) -> AnchorResult<usize> {
    let mut cursor = None;
    let mut count = 0usize;
    loop {
        let page = index.scroll(collection, &PayloadFilter::all(), cursor, EXPORT_PAGE)?;
        for point in &page.points {
            let line = ExportLine {
                id: point.id,
                payload: point.payload.clone(),
                vector: encode_vector(&point.vector),
            };
            let json = serde_json::to_string(&line)
                .map_err(|e| AnchorError::Serialization(e.to_string()))?;
            writeln!(writer, "{json}")?;
            count += 1;
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    debug!(collection, count, "export finished");
    Ok(count)
}

/// Import JSON lines into the collection. Duplicates upsert by id; blank
/// and malformed lines are skipped with a warning. Returns (imported,
/// skipped).
pub fn import_collection(
    index: &dyn VectorIndex,
    collection: &str,
    reader: &mut dyn BufRead,
) -> AnchorResult<(usize, usize)> {
    let mut imported = 0usize;
    let mut skipped = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ExportLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping malformed export line");
                skipped += 1;
                continue;
            }
        };
        let vector = match decode_vector(&parsed.vector) {
            Ok(vector) => vector,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping line with bad vector");
                skipped += 1;
                continue;
            }
        };
        index.upsert(
            collection,
            Point {
                id: parsed.id,
                vector,
                payload: parsed.payload,
            },
        )?;
        imported += 1;
    }
    debug!(collection, imported, skipped, "import finished");
    Ok((imported, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor_store::local::LocalIndex;
    use serde_json::json;
    use std::io::BufReader;

    fn point(id_byte: u8, x: f32) -> Point {
        let mut payload = Map::new();
        payload.insert("content".into(), json!(format!("note {id_byte}")));
        payload.insert("layer".into(), json!("verified_fact"));
        payload.insert("is_active".into(), json!(true));
        payload.insert("valid_at".into(), Value::Null);
        payload.insert("expires_at".into(), Value::Null);
        Point {
            id: Uuid::from_bytes([id_byte; 16]),
            vector: vec![x, 1.0 - x, 0.0, 0.0],
            payload,
        }
    }

    fn setup() -> LocalIndex {
        let index = LocalIndex::in_memory().unwrap();
        index.ensure_collection("notes", 4).unwrap();
        index
    }

    #[test]
    fn test_vector_codec_round_trip() {
        let v = vec![0.25f32, -1.5, 3.75];
        let decoded = decode_vector(&encode_vector(&v)).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn test_export_import_round_trip() {
        let source = setup();
        source.upsert("notes", point(1, 0.9)).unwrap();
        source.upsert("notes", point(2, 0.1)).unwrap();

        let mut buffer = Vec::new();
        let exported = export_collection(&source, "notes", &mut buffer).unwrap();
        assert_eq!(exported, 2);

        let target = setup();
        let (imported, skipped) =
            import_collection(&target, "notes", &mut BufReader::new(buffer.as_slice())).unwrap();
        assert_eq!((imported, skipped), (2, 0));

        let page = target
            .scroll("notes", &PayloadFilter::all(), None, 10)
            .unwrap();
        assert_eq!(page.points.len(), 2);
        let original = source
            .scroll("notes", &PayloadFilter::all(), None, 10)
            .unwrap();
        for (a, b) in original.points.iter().zip(&page.points) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.vector, b.vector);
            assert_eq!(a.payload, b.payload);
        }
    }

    #[test]
    fn test_double_import_no_duplicates() {
        let source = setup();
        source.upsert("notes", point(1, 0.9)).unwrap();
        let mut buffer = Vec::new();
        export_collection(&source, "notes", &mut buffer).unwrap();

        let target = setup();
        import_collection(&target, "notes", &mut BufReader::new(buffer.as_slice())).unwrap();
        import_collection(&target, "notes", &mut BufReader::new(buffer.as_slice())).unwrap();

        let page = target
            .scroll("notes", &PayloadFilter::all(), None, 10)
            .unwrap();
        assert_eq!(page.points.len(), 1);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let target = setup();
        let data = b"not json at all\n\n".to_vec();
        let (imported, skipped) =
            import_collection(&target, "notes", &mut BufReader::new(data.as_slice())).unwrap();
        assert_eq!((imported, skipped), (0, 1));
    }
}
