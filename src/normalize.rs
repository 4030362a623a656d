//! Canonical text form for hashing and storage.
//!
//! [`DocumentNormalizer::normalize`] is pure and idempotent. It collapses
//! whitespace runs, strips boilerplate fragments (site navigation, cookie
//! banners, footer links) and trims the result. The display copy keeps the
//! original casing; the hashable copy is lower-cased so casing variants of
//! the same page fingerprint identically.

/// Fragments stripped from every document unless the configuration
/// supplies its own list.
pub const DEFAULT_BOILERPLATE: &[&str] = &[
    "skip to main content",
    "skip to content",
    "skip to navigation",
    "back to top",
    "toggle navigation",
    "open menu",
    "close menu",
    "we use cookies to improve your experience",
    "accept all cookies",
    "cookie settings",
    "share this page",
    "print this page",
    "was this page helpful?",
];

/// Result of normalizing one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    /// Input was empty, whitespace-only, or only boilerplate.
    Empty,
    Document(NormalizedText),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedText {
    /// Canonical text with original casing, stored and shown to the model.
    pub display_text: String,
    /// Lower-cased canonical text, the input to [`crate::hash::fingerprint`].
    pub hashable_text: String,
}

impl Normalized {
    pub fn is_empty(&self) -> bool {
        matches!(self, Normalized::Empty)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentNormalizer {
    /// Lower-cased, whitespace-collapsed markers.
    markers: Vec<String>,
}

impl Default for DocumentNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_BOILERPLATE.iter().copied())
    }
}

impl DocumentNormalizer {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut markers: Vec<String> = markers
            .into_iter()
            .map(|m| collapse_whitespace(m.as_ref()).to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        // Longest first so a marker containing another is removed whole.
        markers.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        markers.dedup();
        Self { markers }
    }

    pub fn normalize(&self, raw: &str) -> Normalized {
        let mut text = collapse_whitespace(raw);

        // Removing one marker can join the text around it into another
        // marker, so strip until nothing matches.
        loop {
            let stripped = self.strip_markers(&text);
            if stripped == text {
                break;
            }
            text = stripped;
        }

        if text.is_empty() {
            return Normalized::Empty;
        }

        let hashable_text = text.to_lowercase();
        Normalized::Document(NormalizedText {
            display_text: text,
            hashable_text,
        })
    }

    /// One pass over `text`. Markers only match on word boundaries and
    /// never overlap a longer marker already cut.
    fn strip_markers(&self, text: &str) -> String {
        let folded = Folded::new(text);
        let mut cuts: Vec<(usize, usize)> = Vec::new();
        for marker in &self.markers {
            let step = marker.chars().next().map_or(1, char::len_utf8);
            let mut from = 0;
            while let Some(rel) = folded.lower[from..].find(marker.as_str()) {
                let start = from + rel;
                let end = start + marker.len();
                match folded.original_offset(start).zip(folded.original_offset(end)) {
                    Some((s, e))
                        if on_word_boundaries(text, s, e)
                            && !cuts.iter().any(|&(cs, ce)| s < ce && cs < e) =>
                    {
                        cuts.push((s, e));
                        from = end;
                    }
                    _ => from = start + step,
                }
            }
        }
        if cuts.is_empty() {
            return text.to_string();
        }

        cuts.sort_unstable();
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (s, e) in cuts {
            out.push_str(&text[last..s]);
            out.push(' ');
            last = e;
        }
        out.push_str(&text[last..]);
        collapse_whitespace(&out)
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lower-cased copy of a text that can map offsets back to the original.
struct Folded<'a> {
    lower: std::borrow::Cow<'a, str>,
    /// `(lower offset, original offset)` of every char start plus the end.
    /// Empty for ASCII text, where offsets are equal.
    offsets: Vec<(usize, usize)>,
}

impl<'a> Folded<'a> {
    fn new(original: &'a str) -> Self {
        if original.is_ascii() {
            let lower = if original.bytes().any(|b| b.is_ascii_uppercase()) {
                original.to_ascii_lowercase().into()
            } else {
                original.into()
            };
            return Self {
                lower,
                offsets: Vec::new(),
            };
        }
        let mut lower = String::with_capacity(original.len());
        let mut offsets = Vec::new();
        for (i, ch) in original.char_indices() {
            offsets.push((lower.len(), i));
            lower.extend(ch.to_lowercase());
        }
        offsets.push((lower.len(), original.len()));
        Self {
            lower: lower.into(),
            offsets,
        }
    }

    /// `None` when `lower` falls inside the expansion of one original char.
    fn original_offset(&self, lower: usize) -> Option<usize> {
        if self.offsets.is_empty() {
            return Some(lower);
        }
        self.offsets
            .binary_search_by_key(&lower, |&(l, _)| l)
            .ok()
            .map(|i| self.offsets[i].1)
    }
}

/// False when the match at `start..end` runs into a letter or digit on
/// either side.
fn on_word_boundaries(text: &str, start: usize, end: usize) -> bool {
    let joins = |outer: Option<char>, inner: Option<char>| {
        matches!((outer, inner), (Some(o), Some(i)) if o.is_alphanumeric() && i.is_alphanumeric())
    };
    let matched = &text[start..end];
    !joins(text[..start].chars().next_back(), matched.chars().next())
        && !joins(text[end..].chars().next(), matched.chars().next_back())
}
