use std::borrow::Cow;
use std::collections::HashMap;

use tracing::debug;

pub type Token = u32;

/// Vocabulary size that identifies a multilingual model file.
const N_VOCAB_MULTILINGUAL: usize = 51865;

/// Token ids are mapped to raw byte strings, not `String`: the on-disk
/// vocabulary stores UTF-8 fragments that may split multibyte sequences
/// across tokens. Text is only rendered lossily at segment boundaries.
#[derive(Debug)]
pub struct Vocab {
    pub n_vocab: usize,
    token_to_id: HashMap<Vec<u8>, Token>,
    id_to_token: Vec<Vec<u8>>,

    pub token_eot: Token,
    pub token_sot: Token,
    // task tokens (used only for multilingual models)
    pub token_translate: Token,
    pub token_transcribe: Token,
    // other special tokens
    pub token_solm: Token, // speaker-turn marker, emitted by tinydiarize models
    pub token_prev: Token,
    pub token_nosp: Token,
    pub token_not: Token, // no timestamps
    pub token_beg: Token, // begin timestamps
}

impl Vocab {
    /// Build the vocabulary from the entries read out of the model file.
    ///
    /// `n_vocab` is the hyperparameter value; when larger than the number
    /// of stored entries the missing ids are synthesized as placeholder
    /// names, exactly mirroring the reserved-token layout.
    pub fn new(n_vocab: usize, entries: Vec<Vec<u8>>) -> Self {
        let mut vocab = Self {
            n_vocab,
            token_to_id: HashMap::with_capacity(n_vocab),
            id_to_token: Vec::with_capacity(n_vocab),
            token_eot: 50256,
            token_sot: 50257,
            token_translate: 50357,
            token_transcribe: 50358,
            token_solm: 50359,
            token_prev: 50360,
            token_nosp: 50361,
            token_not: 50362,
            token_beg: 50363,
        };

        let n_loaded = entries.len();
        for (id, word) in entries.into_iter().enumerate() {
            vocab.token_to_id.insert(word.clone(), id as Token);
            vocab.id_to_token.push(word);
        }

        if vocab.is_multilingual() {
            // one extra language-tag slot shifts every reserved id up
            vocab.token_eot += 1;
            vocab.token_sot += 1;
            vocab.token_translate += 1;
            vocab.token_transcribe += 1;
            vocab.token_solm += 1;
            vocab.token_prev += 1;
            vocab.token_nosp += 1;
            vocab.token_not += 1;
            vocab.token_beg += 1;
        }

        if n_loaded < n_vocab {
            debug!("adding {} extra tokens", n_vocab - n_loaded);
            for id in n_loaded..n_vocab {
                let id = id as Token;
                let word = if id > vocab.token_beg {
                    format!("[_TT_{}]", id - vocab.token_beg)
                } else if id == vocab.token_eot {
                    "[_EOT_]".to_string()
                } else if id == vocab.token_sot {
                    "[_SOT_]".to_string()
                } else if id == vocab.token_solm {
                    "[_SOLM_]".to_string()
                } else if id == vocab.token_prev {
                    "[_PREV_]".to_string()
                } else if id == vocab.token_nosp {
                    "[_NOSP_]".to_string()
                } else if id == vocab.token_not {
                    "[_NOT_]".to_string()
                } else if id == vocab.token_beg {
                    "[_BEG_]".to_string()
                } else {
                    format!("[_extra_token_{id}]")
                };
                vocab.token_to_id.insert(word.clone().into_bytes(), id);
                vocab.id_to_token.push(word.into_bytes());
            }
        }

        vocab
    }

    pub fn is_multilingual(&self) -> bool {
        self.n_vocab == N_VOCAB_MULTILINGUAL
    }

    /// The `<|xx|>` token for a language id.
    pub fn token_lang(&self, lang_id: usize) -> Token {
        self.token_sot + 1 + lang_id as Token
    }

    pub fn id_for(&self, text: &str) -> Option<Token> {
        self.token_to_id.get(text.as_bytes()).copied()
    }

    pub fn token_bytes(&self, id: Token) -> &[u8] {
        static EMPTY: &[u8] = &[];
        self.id_to_token
            .get(id as usize)
            .map_or(EMPTY, Vec::as_slice)
    }

    pub fn token_text(&self, id: Token) -> Cow<'_, str> {
        String::from_utf8_lossy(self.token_bytes(id))
    }

    /// Split text into tokens with greedy longest-match against the
    /// vocabulary, after a GPT-2 style pre-split.
    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        for word in pre_split(text.as_bytes()) {
            let n = word.len();
            let mut i = 0;
            while i < n {
                let mut j = n;
                let mut found = false;
                while j > i {
                    if let Some(&id) = self.token_to_id.get(&word[i..j]) {
                        tokens.push(id);
                        i = j;
                        found = true;
                        break;
                    }
                    j -= 1;
                }
                if !found {
                    debug!("unknown token");
                    i += 1;
                }
            }
        }
        tokens
    }
}

/// GPT-2 pre-tokenization split.
///
/// Equivalent to the pattern
/// `'s|'t|'re|'ve|'m|'ll|'d| ?[[:alpha:]]+| ?[[:digit:]]+| ?[^\s[:alpha:][:digit:]]+|\s+(?!\S)|\s+`
/// over bytes (ASCII classes; non-ASCII bytes fall into the "other" run).
/// The lookahead makes `regex` unsuitable, so the classes are scanned by
/// hand.
fn pre_split(text: &[u8]) -> Vec<&[u8]> {
    fn is_alpha(b: u8) -> bool {
        b.is_ascii_alphabetic()
    }
    fn is_digit(b: u8) -> bool {
        b.is_ascii_digit()
    }
    fn is_space(b: u8) -> bool {
        b.is_ascii_whitespace()
    }
    fn is_other(b: u8) -> bool {
        !is_alpha(b) && !is_digit(b) && !is_space(b)
    }

    let n = text.len();
    let mut words = Vec::new();
    let mut i = 0;

    while i < n {
        let b = text[i];

        // contractions
        if b == b'\'' {
            const CONTRACTIONS: [&[u8]; 7] =
                [b"'re", b"'ve", b"'ll", b"'s", b"'t", b"'m", b"'d"];
            if let Some(c) = CONTRACTIONS.iter().find(|c| text[i..].starts_with(c)) {
                words.push(&text[i..i + c.len()]);
                i += c.len();
                continue;
            }
        }

        // ` ?` + class run for letters, digits and other symbols
        let lead_space = b == b' ' && i + 1 < n && !is_space(text[i + 1]);
        let class_at = if lead_space { i + 1 } else { i };
        if class_at < n && !is_space(text[class_at]) {
            let c = text[class_at];
            let class: fn(u8) -> bool = if is_alpha(c) {
                is_alpha
            } else if is_digit(c) {
                is_digit
            } else {
                is_other
            };
            let mut j = class_at;
            while j < n && class(text[j]) {
                j += 1;
            }
            words.push(&text[i..j]);
            i = j;
            continue;
        }

        // whitespace run; the last space is left to attach to the next word
        let mut j = i;
        while j < n && is_space(text[j]) {
            j += 1;
        }
        if j < n && j - i > 1 {
            words.push(&text[i..j - 1]);
            i = j - 1;
        } else {
            words.push(&text[i..j]);
            i = j;
        }
    }

    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ascii_vocab() -> Vocab {
        // ids 0..256 are single bytes, then a few merged tokens
        let mut entries: Vec<Vec<u8>> = (0u8..=255).map(|b| vec![b]).collect();
        entries.push(b"he".to_vec());
        entries.push(b"llo".to_vec());
        entries.push(b" wor".to_vec());
        entries.push(b"ld".to_vec());
        Vocab::new(entries.len(), entries)
    }

    #[test]
    fn greedy_longest_match() {
        let vocab = ascii_vocab();
        let tokens = vocab.tokenize("hello world");
        let text: Vec<u8> = tokens
            .iter()
            .flat_map(|&t| vocab.token_bytes(t).to_vec())
            .collect();
        assert_eq!(text, b"hello world");
        // "he" + "llo" beat byte-by-byte
        assert_eq!(tokens[0], 256);
        assert_eq!(tokens[1], 257);
    }

    #[test]
    fn pre_split_classes() {
        let expected: Vec<&[u8]> = vec![b"it", b"'s", b" ", b" 42", b"%"];
        assert_eq!(pre_split(b"it's  42%"), expected);
    }

    #[test]
    fn trailing_whitespace_kept() {
        let expected: Vec<&[u8]> = vec![b"a", b" "];
        assert_eq!(pre_split(b"a "), expected);
    }

    #[test]
    fn multilingual_shifts_reserved_ids() {
        let entries: Vec<Vec<u8>> = Vec::new();
        let vocab = Vocab::new(N_VOCAB_MULTILINGUAL, entries);
        assert!(vocab.is_multilingual());
        assert_eq!(vocab.token_eot, 50257);
        assert_eq!(vocab.token_sot, 50258);
        assert_eq!(vocab.token_beg, 50364);
        assert_eq!(vocab.token_lang(0), 50259);
    }

    #[test]
    fn missing_ids_are_synthesized() {
        let vocab = Vocab::new(51864, Vec::new());
        assert!(!vocab.is_multilingual());
        assert_eq!(vocab.token_bytes(50256), b"[_EOT_]");
        assert_eq!(vocab.token_bytes(50363), b"[_BEG_]");
        assert_eq!(vocab.token_bytes(50364), b"[_TT_1]");
        assert_eq!(vocab.token_bytes(0), b"[_extra_token_0]");
        assert_eq!(vocab.n_vocab, 51864);
    }
}
