/// Key layout for the ledger partitions
///
/// Partition structure:
/// - `queue`: queue:snapshot -> QueueRecord (JSON)
/// - `completed`: done:{job_id} -> CompletedRecord (JSON)

const QUEUE_SNAPSHOT_KEY: &[u8] = b"queue:snapshot";
const DONE_PREFIX: &str = "done:";

/// The single key holding the latest queue record
pub fn queue_snapshot_key() -> &'static [u8] {
    QUEUE_SNAPSHOT_KEY
}

/// Encode a completed-item key: done:{job_id}
pub fn encode_done_key(job_id: &str) -> Vec<u8> {
    format!("{}{}", DONE_PREFIX, job_id).into_bytes()
}

/// Decode a completed-item key: done:{job_id} -> job_id
pub fn decode_done_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix(DONE_PREFIX).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_key_encoding() {
        let key = encode_done_key("job_123");
        assert_eq!(key, b"done:job_123");
        assert_eq!(decode_done_key(&key).as_deref(), Some("job_123"));
    }

    #[test]
    fn test_decode_rejects_foreign_keys() {
        assert_eq!(decode_done_key(b"queue:snapshot"), None);
        assert_eq!(decode_done_key(&[0xff, 0xfe]), None);
    }
}
