//! Byte-level tokenizer.
//!
//! Token ids `0..=255` are raw bytes; two extra ids mark the start and the end
//! of a sequence. Any UTF-8 string round-trips losslessly.

/// Beginning-of-sequence token id.
pub const BOS: u32 = 256;
/// End-of-sequence token id.
pub const EOS: u32 = 257;
/// Number of distinct token ids.
pub const VOCAB_SIZE: usize = 258;

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    /// Encode `text` as `BOS` followed by its bytes.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        std::iter::once(BOS)
            .chain(text.bytes().map(u32::from))
            .collect()
    }

    /// Encode without the leading `BOS`.
    pub fn encode_raw(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    /// Decode byte tokens; special ids are dropped and invalid UTF-8 is
    /// replaced.
    pub fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| u8::try_from(id).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn is_special(&self, id: u32) -> bool {
        id == BOS || id == EOS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prepends_bos() {
        let ids = ByteTokenizer.encode("ab");
        assert_eq!(ids, vec![BOS, 97, 98]);
    }

    #[test]
    fn test_decode_roundtrip_utf8() {
        let tok = ByteTokenizer;
        let text = "lex: café ✓";
        assert_eq!(tok.decode(&tok.encode(text)), text);
    }

    #[test]
    fn test_decode_skips_special() {
        let tok = ByteTokenizer;
        assert_eq!(tok.decode(&[BOS, 104, 105, EOS]), "hi");
        assert!(tok.is_special(EOS));
        assert!(!tok.is_special(0));
    }
}
