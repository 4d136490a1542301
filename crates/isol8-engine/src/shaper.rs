//! Output Shaper (spec §4.7).
//!
//! Applied in a fixed order: UTF-8 decode (lossy, with partial trailing
//! code units deferred across chunks in streaming mode), secret redaction
//! (longest-value-first substring replacement — see the Open Question
//! note in `SPEC_FULL.md` §D), byte-cap enforcement with a one-time
//! truncation marker, and trailing-whitespace trim at final emission.

const TRUNCATION_MARKER: &str = "\n--- OUTPUT TRUNCATED ---";
const REDACTION_MARKER: &str = "***";

/// Redacts every configured secret value from `text`, longest value first so
/// a shorter secret that happens to be a substring of a longer one is never
/// re-redacted as a leftover fragment.
pub fn redact_secrets(text: &str, secrets: &[String]) -> String {
    let mut ordered: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut out = text.to_string();
    for secret in ordered {
        out = out.replace(secret.as_str(), REDACTION_MARKER);
    }
    out
}

/// Decodes a byte chunk as UTF-8, lossily. Used for the non-streaming path
/// where a chunk is the complete, final accumulation of a substream and a
/// replacement character at a boundary is acceptable.
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Incremental UTF-8 decoder for the streaming path: buffers a trailing
/// incomplete code unit across calls instead of emitting a replacement
/// character for it, matching the spec's "deferred to the next chunk"
/// wording for `executeStream`.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next raw chunk, returning the longest valid-UTF-8 prefix
    /// across pending + chunk. The new trailing partial sequence (if any)
    /// is retained for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(valid) => {
                let out = valid.to_string();
                self.pending.clear();
                out
            }
            Err(e) => {
                let valid_len = e.valid_up_to();
                let out = std::str::from_utf8(&self.pending[..valid_len])
                    .expect("valid_up_to prefix is valid UTF-8")
                    .to_string();
                self.pending.drain(..valid_len);
                out
            }
        }
    }

    /// Flush whatever partial bytes remain at stream termination, decoding
    /// lossily (a trailing replacement character is acceptable only here).
    pub fn finish(mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Enforces a byte cap on an already-decoded string, appending the
/// truncation marker exactly once if the cap was exceeded.
///
/// Returns `(shaped, truncated)`.
pub fn enforce_cap(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut cut = max_bytes.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut shaped = text[..cut].to_string();
    shaped.push_str(TRUNCATION_MARKER);
    (shaped, true)
}

/// Applies the full non-streaming pipeline to one accumulated substream:
/// redact, cap, then trim trailing whitespace at final emission.
pub fn shape_final(raw: &[u8], secrets: &[String], max_bytes: usize) -> (String, bool) {
    let decoded = decode_lossy(raw);
    let redacted = redact_secrets(&decoded, secrets);
    let (capped, truncated) = enforce_cap(&redacted, max_bytes);
    (capped.trim_end().to_string(), truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_overlapping_secrets_longest_first() {
        let secrets = vec!["secret".to_string(), "super-secret-key-123".to_string()];
        let text = "token=super-secret-key-123 end";
        let redacted = redact_secrets(text, &secrets);
        assert_eq!(redacted, "token=*** end");
    }

    #[test]
    fn enforce_cap_appends_marker_once() {
        let text = "x".repeat(2000);
        let (shaped, truncated) = enforce_cap(&text, 1024);
        assert!(truncated);
        assert!(shaped.len() < 2048);
        assert_eq!(shaped.matches("--- OUTPUT TRUNCATED ---").count(), 1);
    }

    #[test]
    fn enforce_cap_under_limit_is_untouched() {
        let (shaped, truncated) = enforce_cap("hello", 1024);
        assert!(!truncated);
        assert_eq!(shaped, "hello");
    }

    #[test]
    fn stream_decoder_defers_partial_trailing_sequence() {
        let mut decoder = StreamDecoder::new();
        let full = "héllo".as_bytes();
        let (first, second) = full.split_at(2);
        let mut out = decoder.push(first);
        out.push_str(&decoder.push(second));
        assert_eq!(out, "héllo");
    }
}
