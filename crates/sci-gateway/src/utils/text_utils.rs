//! Text helpers shared by the classifier and the assembler

pub struct TextUtils;

impl TextUtils {
    /// Maximal runs of ASCII letters, with their byte offsets
    pub fn ascii_letter_runs(text: &str) -> Vec<(usize, &str)> {
        let mut runs = Vec::new();
        let mut start = None;
        for (i, c) in text.char_indices() {
            match (c.is_ascii_alphabetic(), start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    runs.push((s, &text[s..i]));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push((s, &text[s..]));
        }
        runs
    }

    /// Rough token count: one token per CJK character, one per four
    /// characters of anything else.
    pub fn estimate_tokens(text: &str) -> u32 {
        let (cjk, other) = text.chars().fold((0u32, 0u32), |(cjk, other), c| {
            if Self::is_cjk(c) {
                (cjk + 1, other)
            } else {
                (cjk, other + 1)
            }
        });
        cjk + other.div_ceil(4)
    }

    pub fn is_cjk(c: char) -> bool {
        matches!(c as u32,
            0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3000..=0x303F | 0xFF00..=0xFFEF | 0xF900..=0xFAFF)
    }
}
