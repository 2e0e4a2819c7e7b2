//! Tokenizer contract used by the engine, plus a byte-level implementation.

/// Fixed token ids known before the model is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vocabulary {
    pub size: usize,
    pub pad_id: usize,
    pub begin_id: usize,
    pub end_id: usize,
}

/// Maps text to token ids and back.
pub trait Tokenizer {
    fn encode(&self, text: &str, add_begin: bool, add_end: bool) -> Vec<usize>;

    fn decode(&self, ids: &[usize]) -> String;

    fn vocabulary(&self) -> Vocabulary;
}

/// Byte-level tokenizer: ids `0..256` are raw bytes, followed by pad, begin
/// and end ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const PAD_ID: usize = 256;
    pub const BEGIN_ID: usize = 257;
    pub const END_ID: usize = 258;
    pub const VOCAB_SIZE: usize = 259;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_begin: bool, add_end: bool) -> Vec<usize> {
        add_begin
            .then_some(Self::BEGIN_ID)
            .into_iter()
            .chain(text.bytes().map(usize::from))
            .chain(add_end.then_some(Self::END_ID))
            .collect()
    }

    fn decode(&self, ids: &[usize]) -> String {
        // Special and out-of-range ids have no text.
        let bytes = ids.iter().filter_map(|&id| u8::try_from(id).ok()).collect::<Vec<_>>();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn vocabulary(&self) -> Vocabulary {
        Vocabulary { size: Self::VOCAB_SIZE, pad_id: Self::PAD_ID, begin_id: Self::BEGIN_ID, end_id: Self::END_ID }
    }
}
