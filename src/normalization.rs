use std::collections::HashMap;

/// Highest UTF-16 code unit still treated as Latin script by the sender check.
pub const NON_LATIN_CODE_UNIT_CUTOFF: u16 = 0xFF;

/// Frequency analysis of the characters of a text that are not on a whitelist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterTally {
    /// Highest frequency of any single disallowed character.
    pub max: usize,
    /// Human readable breakdown, e.g. `5x !, 2x ?`.
    pub details: String,
}

/// Collapses diacritics to their base Latin letters and drops separators so
/// that blacklist entries match regardless of accents, case and spacing.
pub struct AccentFolder {
    fold_map: HashMap<char, &'static str>,
}

impl AccentFolder {
    pub fn new() -> Self {
        let mut fold_map = HashMap::new();

        let groups: &[(&str, &'static str)] = &[
            ("àáâãäåāăą", "a"),
            ("æ", "ae"),
            ("çćĉċč", "c"),
            ("ďđð", "d"),
            ("èéêëēĕėęě", "e"),
            ("ĝğġģ", "g"),
            ("ĥħ", "h"),
            ("ìíîïĩīĭįı", "i"),
            ("ĵ", "j"),
            ("ķ", "k"),
            ("ĺļľŀł", "l"),
            ("ñńņňŉ", "n"),
            ("òóôõöøōŏő", "o"),
            ("œ", "oe"),
            ("ŕŗř", "r"),
            ("śŝşšș", "s"),
            ("ß", "ss"),
            ("ţťŧț", "t"),
            ("þ", "th"),
            ("ùúûüũūŭůűų", "u"),
            ("ŵ", "w"),
            ("ýÿŷ", "y"),
            ("źżž", "z"),
            // Typographic variants of separators and quotes
            ("‐‑‒–—", ""),
            ("‘’‚‛", "'"),
            ("“”„‟", "\""),
            ("…", ""),
        ];

        for &(chars, replacement) in groups {
            for c in chars.chars() {
                fold_map.insert(c, replacement);
            }
        }

        Self { fold_map }
    }

    /// Lower-case, fold accents and remove separators (whitespace, `.`, `-`, `_`).
    pub fn fold(&self, text: &str) -> String {
        let mut result = String::with_capacity(text.len());

        for c in text.chars().flat_map(char::to_lowercase) {
            if c.is_whitespace() || matches!(c, '.' | '-' | '_') {
                continue;
            }
            // Combining diacritical marks and zero-width characters
            if matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF)
                || matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}')
            {
                continue;
            }
            match self.fold_map.get(&c) {
                Some(replacement) => result.push_str(replacement),
                None => result.push(c),
            }
        }

        result
    }

    /// Fold both sides and match `pattern` against `text`.
    pub fn matches(&self, pattern: &str, text: &str) -> bool {
        matches_pattern(&self.fold(pattern), &self.fold(text))
    }

    /// Return the first pattern of `patterns` matching any of `texts`.
    pub fn first_match<'p>(&self, patterns: &'p [String], texts: &[&str]) -> Option<&'p str> {
        let folded_texts: Vec<String> = texts.iter().map(|t| self.fold(t)).collect();

        patterns
            .iter()
            .find(|pattern| {
                let folded = self.fold(pattern);
                folded_texts.iter().any(|t| matches_pattern(&folded, t))
            })
            .map(|p| p.as_str())
    }
}

impl Default for AccentFolder {
    fn default() -> Self {
        Self::new()
    }
}

/// Match an already folded blacklist entry against already folded text.
///
/// Entries of the form `[left*right]` require `left` to occur and `right` to
/// occur after the end of the first occurrence of `left`. Any other entry is
/// a plain substring. Empty and malformed entries never match.
pub fn matches_pattern(pattern: &str, text: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }

    if !pattern.starts_with('[') {
        return text.contains(pattern);
    }

    let inner = match pattern.strip_prefix('[').and_then(|p| p.strip_suffix(']')) {
        Some(inner) => inner,
        None => return false,
    };
    let (left, right) = match inner.split_once('*') {
        Some(parts) => parts,
        None => return false,
    };
    if left.is_empty() && right.is_empty() {
        return false;
    }

    match text.find(left) {
        Some(start) => text[start + left.len()..].contains(right),
        None => false,
    }
}

/// Count how often each character outside `whitelist` occurs and report the
/// highest single-character frequency.
pub fn special_character_tally(text: &str, whitelist: &str) -> CharacterTally {
    let mut counts: Vec<(char, usize)> = Vec::new();

    for c in text.chars().filter(|c| !whitelist.contains(*c)) {
        match counts.iter_mut().find(|(existing, _)| *existing == c) {
            Some((_, count)) => *count += 1,
            None => counts.push((c, 1)),
        }
    }

    CharacterTally {
        max: counts.iter().map(|(_, count)| *count).max().unwrap_or(0),
        details: counts
            .iter()
            .map(|(c, count)| format!("{count}x {c}"))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Number of characters (spaces excluded) that are not part of `alphabet`.
pub fn non_whitelisted_count(text: &str, alphabet: &str) -> usize {
    text.chars()
        .filter(|c| *c != ' ' && !alphabet.contains(*c))
        .count()
}

/// Remove punctuation, spaces and tabs.
pub fn strip_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| !is_punctuation(*c) && *c != ' ' && *c != '\t')
        .collect()
}

fn is_punctuation(c: char) -> bool {
    // ASCII symbols such as $ + < = > ^ ` | ~ are not punctuation
    matches!(
        c,
        '!' | '"' | '#' | '%' | '&' | '\'' | '(' | ')' | '*' | ',' | '-' | '.' | '/' | ':'
            | ';' | '?' | '@' | '[' | '\\' | ']' | '_' | '{' | '}'
            | '¡' | '§' | '«' | '¶' | '·' | '»' | '¿'
    ) || matches!(c as u32, 0x2010..=0x2027 | 0x2030..=0x205E | 0x3000..=0x303F)
}

/// Whether any UTF-16 code unit of `text` is above `cutoff`.
pub fn contains_code_unit_above(text: &str, cutoff: u16) -> bool {
    text.encode_utf16().any(|unit| unit > cutoff)
}
