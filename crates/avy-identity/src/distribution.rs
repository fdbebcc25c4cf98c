//! Geographic distribution over a fixed country weight table.
//!
//! Downstream reporting sums per-country counts, so the distribution must
//! be exact: integer shares with the remainder assigned to the
//! dominant-weight country, never an approximate rounding.

use avy_config::CountryWeight;
use rand::Rng;

/// Split `total` across the weight table exactly.
///
/// Each country receives `total * weight / weight_sum` rounded down; the
/// remainder goes to the highest-weight country. The returned counts
/// always sum to exactly `total`.
pub fn country_distribution(total: u32, weights: &[CountryWeight]) -> Vec<(String, u32)> {
    if weights.is_empty() || total == 0 {
        return Vec::new();
    }

    let weight_sum: u64 = weights.iter().map(|w| w.weight as u64).sum();
    let mut counts: Vec<(String, u32)> = weights
        .iter()
        .map(|w| {
            let share = (total as u64 * w.weight as u64 / weight_sum) as u32;
            (w.country.clone(), share)
        })
        .collect();

    let assigned: u32 = counts.iter().map(|(_, n)| n).sum();
    let remainder = total - assigned;

    if remainder > 0 {
        let dominant = weights
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| w.weight)
            .map(|(i, _)| i)
            .unwrap_or(0);
        counts[dominant].1 += remainder;
    }

    counts
}

/// Draw one country at random, proportionally to the weights.
pub fn draw_country<R: Rng>(weights: &[CountryWeight], rng: &mut R) -> Option<String> {
    let weight_sum: u64 = weights.iter().map(|w| w.weight as u64).sum();
    if weight_sum == 0 {
        return None;
    }
    let mut roll = rng.gen_range(0..weight_sum);
    for w in weights {
        if roll < w.weight as u64 {
            return Some(w.country.clone());
        }
        roll -= w.weight as u64;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(&str, u32)]) -> Vec<CountryWeight> {
        pairs
            .iter()
            .map(|(country, weight)| CountryWeight {
                country: country.to_string(),
                weight: *weight,
            })
            .collect()
    }

    #[test]
    fn test_distribution_sums_exactly_137() {
        let table = weights(&[
            ("a", 60),
            ("b", 15),
            ("c", 10),
            ("d", 8),
            ("e", 5),
            ("f", 2),
        ]);
        let counts = country_distribution(137, &table);
        let total: u32 = counts.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 137);

        // Remainder lands on the dominant country: floor shares are
        // 82 + 20 + 13 + 10 + 6 + 2 = 133, so "a" absorbs 4 extra.
        assert_eq!(counts[0], ("a".to_string(), 86));
        assert_eq!(counts[1], ("b".to_string(), 20));
        assert_eq!(counts[5], ("f".to_string(), 2));
    }

    #[test]
    fn test_distribution_exact_split_has_no_remainder() {
        let table = weights(&[("a", 50), ("b", 50)]);
        let counts = country_distribution(10, &table);
        assert_eq!(counts, vec![("a".to_string(), 5), ("b".to_string(), 5)]);
    }

    #[test]
    fn test_distribution_total_smaller_than_table() {
        let table = weights(&[("a", 60), ("b", 30), ("c", 10)]);
        let counts = country_distribution(1, &table);
        let total: u32 = counts.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 1);
        // The single unit floors to zero everywhere and lands on "a".
        assert_eq!(counts[0].1, 1);
    }

    #[test]
    fn test_distribution_zero_total() {
        let table = weights(&[("a", 100)]);
        assert!(country_distribution(0, &table).is_empty());
    }

    #[test]
    fn test_distribution_empty_weights() {
        assert!(country_distribution(10, &[]).is_empty());
    }

    #[test]
    fn test_distribution_dominant_not_first() {
        let table = weights(&[("x", 10), ("y", 80), ("z", 10)]);
        let counts = country_distribution(7, &table);
        let total: u32 = counts.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 7);
        // y is dominant and absorbs the remainder.
        assert!(counts[1].1 >= counts[0].1);
        assert!(counts[1].1 >= counts[2].1);
    }

    #[test]
    fn test_draw_country_respects_support() {
        let table = weights(&[("only", 100)]);
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            assert_eq!(draw_country(&table, &mut rng).as_deref(), Some("only"));
        }
    }

    #[test]
    fn test_draw_country_covers_all_entries() {
        let table = weights(&[("a", 1), ("b", 1)]);
        let mut rng = rand::thread_rng();
        let mut seen_a = false;
        let mut seen_b = false;
        for _ in 0..200 {
            match draw_country(&table, &mut rng).as_deref() {
                Some("a") => seen_a = true,
                Some("b") => seen_b = true,
                other => panic!("unexpected draw: {other:?}"),
            }
        }
        assert!(seen_a && seen_b);
    }

    #[test]
    fn test_draw_country_empty() {
        let mut rng = rand::thread_rng();
        assert!(draw_country(&[], &mut rng).is_none());
    }
}
