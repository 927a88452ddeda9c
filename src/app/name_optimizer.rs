//! Presentation-only shortening of server labels.
//!
//! Subscriptions often label every server `<city>.<provider>.<tld>`; when most
//! labels share such a suffix it only eats button width.

use std::collections::HashMap;

pub const MIN_NAMES: usize = 3;
pub const MIN_REMAINING_CHARS: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct NameOptimization {
    /// Same length and order as the input.
    pub names: Vec<String>,
    pub applied_count: usize,
    /// Stripped suffix including its leading dot.
    pub suffix: Option<String>,
}

impl NameOptimization {
    fn unchanged(names: &[String]) -> Self {
        Self {
            names: names.to_vec(),
            applied_count: 0,
            suffix: None,
        }
    }
}

/// Trailing `.a.b` and `.a.b.c` suffixes of a label. The label must keep at
/// least one component in front of the suffix.
fn candidate_suffixes(name: &str) -> Vec<&str> {
    let dots: Vec<usize> = name.match_indices('.').map(|(i, _)| i).collect();
    let mut out = Vec::with_capacity(2);
    for components in [2usize, 3] {
        if dots.len() < components {
            break;
        }
        let start = dots[dots.len() - components];
        if start == 0 {
            break;
        }
        out.push(&name[start..]);
    }
    out
}

fn remainder<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let rest = name.strip_suffix(suffix)?;
    (rest.trim().chars().count() >= MIN_REMAINING_CHARS).then_some(rest)
}

/// Strip the dominant dotted suffix when it covers at least `threshold` of the
/// names and at least [`MIN_NAMES`] names.
pub fn optimize_names(names: &[String], threshold: f64) -> NameOptimization {
    if names.len() < MIN_NAMES {
        return NameOptimization::unchanged(names);
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for name in names {
        for suffix in candidate_suffixes(name) {
            counts.entry(suffix).or_insert(0);
        }
    }
    for (suffix, count) in counts.iter_mut() {
        *count = names
            .iter()
            .filter(|n| remainder(n, suffix).is_some())
            .count();
    }

    // 覆盖最多者优先；相同覆盖时取更长的后缀，再按字典序保证结果稳定
    let best = counts
        .into_iter()
        .max_by(|(sa, ca), (sb, cb)| {
            ca.cmp(cb)
                .then_with(|| sa.len().cmp(&sb.len()))
                .then_with(|| sb.cmp(sa))
        });

    let Some((suffix, count)) = best else {
        return NameOptimization::unchanged(names);
    };
    let coverage = count as f64 / names.len() as f64;
    if count < MIN_NAMES || coverage < threshold {
        return NameOptimization::unchanged(names);
    }

    let mut applied = 0;
    let optimized = names
        .iter()
        .map(|n| match remainder(n, suffix) {
            Some(rest) => {
                applied += 1;
                rest.trim_end().to_string()
            }
            None => n.clone(),
        })
        .collect();

    tracing::debug!(suffix, applied, total = names.len(), "server names shortened");
    NameOptimization {
        names: optimized,
        applied_count: applied,
        suffix: Some(suffix.to_string()),
    }
}
