//! Levenshtein edit distance, used for validator "did you mean" hints.

/// Computes the Levenshtein edit distance between `a` and `b`.
pub fn distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Finds the closest candidate to `target` within `len(target)/2 + 1` edits,
/// per the validator's "did you mean" threshold.
pub fn closest_match<'a>(target: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let threshold = target.chars().count() / 2 + 1;
    candidates
        .into_iter()
        .map(|c| (c, distance(target, c)))
        .filter(|(_, d)| *d <= threshold)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(distance("postgres", "postgres"), 0);
    }

    #[test]
    fn one_substitution() {
        assert_eq!(distance("databse", "database"), 1);
    }

    #[test]
    fn closest_match_within_threshold() {
        let candidates = ["database", "app", "cache"];
        assert_eq!(closest_match("databse", candidates), Some("database"));
    }

    #[test]
    fn closest_match_rejects_far_candidates() {
        let candidates = ["zzzzzzzz"];
        assert_eq!(closest_match("database", candidates), None);
    }
}
