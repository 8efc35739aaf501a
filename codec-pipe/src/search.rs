//! Exact subsequence search (Knuth-Morris-Pratt) over any
//! equality-comparable element type. Used to locate Annex-B start-code
//! markers in byte chunks, but deliberately not byte-specific.

/// Builds the KMP failure table for `needle`.
///
/// `table[k]` is the length of the longest proper prefix of
/// `needle[..=k]` that is also a suffix of it.
pub fn build_table<T: PartialEq>(needle: &[T]) -> Vec<usize> {
    let mut table = vec![0usize; needle.len()];
    let mut prefix_len = 0;
    let mut i = 1;
    while i < needle.len() {
        if needle[i] == needle[prefix_len] {
            prefix_len += 1;
            table[i] = prefix_len;
            i += 1;
        } else if prefix_len == 0 {
            table[i] = 0;
            i += 1;
        } else {
            prefix_len = table[prefix_len - 1];
        }
    }
    table
}

/// Returns the start offsets of every occurrence of `needle` in
/// `haystack`, strictly increasing, overlapping matches included.
///
/// An empty needle, or one longer than the haystack, matches nowhere.
/// Never panics.
pub fn search<T: PartialEq>(haystack: &[T], needle: &[T]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    let table = build_table(needle);
    let mut matches = Vec::new();
    let mut hay_idx = 0;
    let mut needle_idx = 0;
    while hay_idx < haystack.len() {
        if haystack[hay_idx] == needle[needle_idx] {
            hay_idx += 1;
            needle_idx += 1;
            if needle_idx == needle.len() {
                matches.push(hay_idx - needle_idx);
                // fall back so overlapping occurrences are still found
                needle_idx = table[needle_idx - 1];
            }
        } else if needle_idx == 0 {
            hay_idx += 1;
        } else {
            needle_idx = table[needle_idx - 1];
        }
    }
    matches
}

/// True when `haystack` begins with `prefix`. An empty prefix always
/// matches; a prefix longer than the haystack never does.
pub fn starts_with<T: PartialEq>(haystack: &[T], prefix: &[T]) -> bool {
    if prefix.len() > haystack.len() {
        return false;
    }
    haystack.iter().zip(prefix.iter()).all(|(a, b)| a == b)
}

#[cfg(test)]
#[path = "search_test.rs"]
mod search_test;
