//! Text helpers shared by turn arbitration and transcript pacing.
//!
//! `normalize_text` backs the preflight-vs-final transcript comparison;
//! `hyphen_count` is the language-neutral syllable proxy used by the
//! transcript synchronizer; `split_sentences` keeps sentence boundaries
//! intact when feeding text into TTS and pacing.

/// Normalize a transcript for equality comparison.
///
/// Trims, case-folds, collapses internal whitespace, and strips trailing
/// sentence punctuation. Idempotent: `normalize_text(normalize_text(x)) ==
/// normalize_text(x)`.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(['.', ',', '!', '?', ';', ':'])
        .trim_end()
        .to_string()
}

/// Estimate the number of hyphenation points (syllables) in a word.
///
/// Counts vowel groups, with a floor of one per word containing any
/// alphanumeric character. Good enough as a speech-rate proxy; the pacing
/// algorithm only needs relative weight, not linguistic accuracy.
pub fn hyphen_count(word: &str) -> usize {
    let mut count = 0usize;
    let mut in_vowel_group = false;
    let mut has_alnum = false;
    for c in word.chars() {
        if c.is_alphanumeric() {
            has_alnum = true;
        }
        let is_vowel = matches!(
            c.to_ascii_lowercase(),
            'a' | 'e' | 'i' | 'o' | 'u' | 'y'
        );
        if is_vowel && !in_vowel_group {
            count += 1;
        }
        in_vowel_group = is_vowel;
    }
    // Silent trailing 'e' ("make", "time") usually doesn't add a syllable.
    if count > 1 && word.len() > 2 {
        let lower: Vec<char> = word.chars().map(|c| c.to_ascii_lowercase()).collect();
        if lower.last() == Some(&'e') {
            let before = lower[lower.len() - 2];
            if !matches!(before, 'a' | 'e' | 'i' | 'o' | 'u' | 'y') {
                count -= 1;
            }
        }
    }
    if has_alnum { count.max(1) } else { count }
}

/// Total hyphen count across all whitespace-separated words.
pub fn hyphen_count_text(text: &str) -> usize {
    text.split_whitespace().map(hyphen_count).sum()
}

/// Split text into sentences, keeping terminal punctuation attached.
///
/// A trailing fragment without terminal punctuation is returned as its own
/// element so no text is ever dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            // Don't split inside decimals ("3.83") or abbreviations glued to
            // the next word; require following whitespace or end of input.
            let boundary = chars.peek().is_none_or(|n| n.is_whitespace());
            if boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── normalize_text ────────────────────────────────────────

    #[test]
    fn normalize_trims_and_casefolds() {
        assert_eq!(
            normalize_text("  What is the Weather in Paris?  "),
            "what is the weather in paris"
        );
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("hello\t  there\nfriend"), "hello there friend");
    }

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "Can I get a Big Mac, no meal?",
            "  multiple   spaces  ",
            "ends with period.",
            "",
        ];
        for input in inputs {
            let once = normalize_text(input);
            assert_eq!(normalize_text(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn normalize_preserves_internal_punctuation() {
        assert_eq!(normalize_text("no, thanks."), "no, thanks");
    }

    // ── hyphen_count ──────────────────────────────────────────

    #[test]
    fn hyphen_count_basic_words() {
        assert_eq!(hyphen_count("cat"), 1);
        assert_eq!(hyphen_count("hello"), 2);
        assert_eq!(hyphen_count("beautiful"), 3);
    }

    #[test]
    fn hyphen_count_silent_e() {
        assert_eq!(hyphen_count("make"), 1);
        assert_eq!(hyphen_count("time"), 1);
    }

    #[test]
    fn hyphen_count_floor_of_one() {
        assert_eq!(hyphen_count("tsk"), 1);
        assert_eq!(hyphen_count("42"), 1);
        assert_eq!(hyphen_count("--"), 0);
    }

    #[test]
    fn hyphen_count_text_sums_words() {
        assert_eq!(
            hyphen_count_text("hello there"),
            hyphen_count("hello") + hyphen_count("there")
        );
    }

    // ── split_sentences ───────────────────────────────────────

    #[test]
    fn splits_on_terminal_punctuation() {
        let out = split_sentences("Sure. I can help with that! Anything else?");
        assert_eq!(
            out,
            vec!["Sure.", "I can help with that!", "Anything else?"]
        );
    }

    #[test]
    fn keeps_trailing_fragment() {
        let out = split_sentences("First sentence. and then some");
        assert_eq!(out, vec!["First sentence.", "and then some"]);
    }

    #[test]
    fn does_not_split_decimals() {
        let out = split_sentences("The rate is 3.83 hyphens per second.");
        assert_eq!(out, vec!["The rate is 3.83 hyphens per second."]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   ").is_empty());
    }
}
