//! Button label fitting.
//!
//! Length is counted per grapheme cluster; emoji clusters count as 2.

use unicode_segmentation::UnicodeSegmentation;

pub const ELLIPSIS: char = '…';

fn is_emoji_char(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF    // pictographs, regional indicators
        | 0x2600..=0x27BF    // misc symbols, dingbats
        | 0x2B00..=0x2BFF    // arrows, stars
        | 0xFE0F)            // emoji presentation selector
}

/// Display weight of one grapheme cluster.
pub fn cluster_width(cluster: &str) -> usize {
    if cluster.chars().any(is_emoji_char) {
        2
    } else {
        1
    }
}

pub fn display_len(text: &str) -> usize {
    text.graphemes(true).map(cluster_width).sum()
}

/// Collapse whitespace runs and cut to `max_len`, ending with `…` when cut.
/// Never splits a grapheme cluster.
pub fn fit(text: &str, max_len: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if display_len(&normalized) <= max_len {
        return normalized;
    }
    if max_len == 0 {
        return String::new();
    }

    let budget = max_len - 1;
    let mut used = 0;
    let mut out = String::with_capacity(normalized.len());
    for cluster in normalized.graphemes(true) {
        let w = cluster_width(cluster);
        if used + w > budget {
            break;
        }
        used += w;
        out.push_str(cluster);
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    out.push(ELLIPSIS);
    out
}
