use std::collections::HashSet;

use sha2::{Digest, Sha256};

pub const DEFAULT_K_GRAM: usize = 5;
pub const DEFAULT_WINDOW: usize = 4;

/// Winnowed token fingerprint of one block of code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub text: String,
    pub digest: u64,
    pub token_count: u32,
}

impl Fingerprint {
    /// The digest as stored in SQLite, which has no unsigned 64-bit integers.
    pub fn stored_digest(&self) -> i64 {
        i64::from_be_bytes(self.digest.to_be_bytes())
    }
}

pub fn fingerprint_text(text: &str) -> Fingerprint {
    let tokens = tokenize(text);
    let features = winnowed_features(&tokens, DEFAULT_K_GRAM, DEFAULT_WINDOW);
    let fingerprint = if features.is_empty() {
        format!("fallback:{}", hash_str(&tokens.join(" ")))
    } else {
        let joined = features
            .iter()
            .map(|h| format!("{h:016x}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("winnow:{joined}")
    };

    Fingerprint {
        digest: hash_str(&fingerprint),
        text: fingerprint,
        token_count: u32::try_from(tokens.len()).unwrap_or(u32::MAX),
    }
}

/// Jaccard similarity of two fingerprints' feature sets.
pub fn fingerprint_similarity(left: &str, right: &str) -> Option<f32> {
    let left_features = parse_fingerprint(left)?;
    let right_features = parse_fingerprint(right)?;

    if left_features.is_empty() || right_features.is_empty() {
        return None;
    }

    let intersection = left_features.intersection(&right_features).count() as f32;
    let union = left_features.union(&right_features).count() as f32;
    if union == 0.0 {
        None
    } else {
        Some(intersection / union)
    }
}

/// Identifiers and literals are kept verbatim; every other non-blank char is
/// its own token. Comments are expected to be stripped by the caller.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.push(ch);
            continue;
        }

        if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        if !ch.is_whitespace() {
            tokens.push(ch.to_string());
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn winnowed_features(tokens: &[String], k: usize, window: usize) -> Vec<u64> {
    if tokens.is_empty() || k == 0 || window == 0 {
        return Vec::new();
    }

    let kgrams = kgram_hashes(tokens, k);
    if kgrams.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    if kgrams.len() <= window {
        for hash in kgrams {
            if seen.insert(hash) {
                out.push(hash);
            }
        }
        return out;
    }

    for window_slice in kgrams.windows(window) {
        // rightmost minimum, so a run of equal hashes selects one feature
        let selected = window_slice
            .iter()
            .copied()
            .enumerate()
            .min_by(|(li, lv), (ri, rv)| lv.cmp(rv).then(ri.cmp(li)))
            .map(|(_, value)| value);
        if let Some(selected) = selected
            && seen.insert(selected)
        {
            out.push(selected);
        }
    }

    out
}

fn kgram_hashes(tokens: &[String], k: usize) -> Vec<u64> {
    if tokens.len() < k {
        return Vec::new();
    }

    tokens
        .windows(k)
        .map(|kgram| hash_str(&kgram.join("\x1f")))
        .collect()
}

fn hash_str(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn parse_fingerprint(raw: &str) -> Option<HashSet<u64>> {
    if let Some(rest) = raw.strip_prefix("winnow:") {
        let values = rest
            .split(',')
            .filter(|value| !value.is_empty())
            .map(|value| u64::from_str_radix(value, 16).ok())
            .collect::<Option<Vec<_>>>()?;
        return Some(values.into_iter().collect());
    }

    if let Some(rest) = raw.strip_prefix("fallback:") {
        return Some([rest.parse::<u64>().ok()?].into_iter().collect());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{fingerprint_similarity, fingerprint_text, tokenize};

    #[test]
    fn fingerprints_are_stable_for_same_input() {
        let a = fingerprint_text("int add(int a, int b) { return a + b; }");
        let b = fingerprint_text("int add(int a, int b) { return a + b; }");
        assert_eq!(a, b);
        assert!(a.text.starts_with("winnow:"));
    }

    #[test]
    fn layout_does_not_change_the_fingerprint() {
        let compact = fingerprint_text("if (x) { y = 1; }");
        let spread = fingerprint_text("if (x)\n{\n    y = 1;\n}\n");
        assert_eq!(compact.digest, spread.digest);
        assert_eq!(compact.token_count, 10);
    }

    #[test]
    fn similarity_survives_small_neighboring_edits() {
        let left = fingerprint_text(
            "for (int i = 0; i < n; i++) {\n    total += values[i];\n    count++;\n}\n",
        );
        let right = fingerprint_text(
            "for (int i = 0; i < n; i++) {\n    total += values[i];\n    count += 2;\n}\n",
        );

        let score = fingerprint_similarity(&left.text, &right.text)
            .expect("similarity should compute");
        assert!(score > 0.3, "score was {score}");
        assert!(score < 1.0);
    }

    #[test]
    fn short_blocks_fall_back_to_a_whole_text_hash() {
        let tiny = fingerprint_text("{ x; }");
        assert!(tiny.text.starts_with("fallback:"));
        assert_eq!(fingerprint_similarity(&tiny.text, &tiny.text), Some(1.0));
        assert_eq!(fingerprint_similarity(&tiny.text, "garbage"), None);
    }

    #[test]
    fn tokenizer_splits_punctuation() {
        assert_eq!(tokenize("a+=b_1;"), vec!["a", "+", "=", "b_1", ";"]);
    }
}
