//! Random token generation.

use rand::Rng;
use std::collections::HashSet;

/// Generate `n` distinct random tokens not in `taken`, sorted.
pub fn generate_tokens(n: usize, taken: &HashSet<u32>) -> Vec<u32> {
    let mut rng = rand::rng();
    let mut fresh = HashSet::with_capacity(n);
    while fresh.len() < n {
        let candidate: u32 = rng.random();
        if !taken.contains(&candidate) {
            fresh.insert(candidate);
        }
    }
    let mut tokens: Vec<u32> = fresh.into_iter().collect();
    tokens.sort_unstable();
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_avoid_taken() {
        let taken: HashSet<u32> = generate_tokens(64, &HashSet::new()).into_iter().collect();
        let tokens = generate_tokens(128, &taken);

        assert_eq!(tokens.len(), 128);
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
        assert!(tokens.iter().all(|t| !taken.contains(t)));
    }
}
