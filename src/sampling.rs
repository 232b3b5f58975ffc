use rand::Rng;

/// Penalize recently generated token ids in place (spec §4.9): divide
/// `logits[id]` by `penalty` when positive, otherwise multiply. No-op at
/// `penalty == 1.0`. `recent_ids` should already be capped to the last 100
/// generated tokens by the caller (`generate::GenerationLoop`).
pub fn apply_repetition_penalty(logits: &mut [f32], recent_ids: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &id in recent_ids {
        let idx = id as usize;
        if idx < logits.len() {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

/// `sample(logits, T, top_k, top_p) -> id` (spec §4.9).
///
/// `T = 0` is deterministic argmax, with the lowest index winning ties.
/// Otherwise: divide by `T`, softmax, sort descending, truncate to `top_k`
/// (0 means unbounded), accumulate until cumulative probability >= `top_p`
/// (lower index wins the boundary tie), renormalize, draw one index from
/// the renormalized distribution.
pub fn sample(logits: &[f32], temperature: f32, top_k: usize, top_p: f32) -> u32 {
    if temperature == 0.0 {
        return argmax(logits);
    }

    let inv_temp = 1.0 / temperature;
    let mut scaled: Vec<f32> = logits.iter().map(|&v| v * inv_temp).collect();

    let max_val = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in scaled.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in scaled.iter_mut() {
            *v /= sum;
        }
    }

    // Sort (index, prob) descending by prob, lower index first on ties so
    // the subsequent cumulative cut is itself tie-stable.
    let mut ranked: Vec<(usize, f32)> = scaled.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));

    let k = if top_k == 0 { ranked.len() } else { top_k.min(ranked.len()) };
    ranked.truncate(k);

    let mut cumulative = 0.0f32;
    let mut cutoff = ranked.len();
    for (i, &(_, p)) in ranked.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            cutoff = i + 1;
            break;
        }
    }
    ranked.truncate(cutoff.max(1));

    let total: f32 = ranked.iter().map(|&(_, p)| p).sum();
    let mut rng = rand::rng();
    let draw = if total > 0.0 { rng.random::<f32>() * total } else { 0.0 };
    let mut acc = 0.0f32;
    for &(idx, p) in &ranked {
        acc += p;
        if acc >= draw {
            return idx as u32;
        }
    }
    ranked.last().map(|&(idx, _)| idx as u32).unwrap_or(0)
}

/// Lowest-index-wins argmax (spec §4.9, §8 "greedy determinism").
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    best_idx as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetition_penalty_is_noop_at_one() {
        let mut logits = vec![1.0, -2.0, 3.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 2], 1.0);
        assert_eq!(logits, vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn repetition_penalty_divides_positive_multiplies_negative() {
        let mut logits = vec![2.0, -2.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 2.0);
        assert_eq!(logits, vec![1.0, -4.0]);
    }

    #[test]
    fn repetition_penalty_ignores_out_of_range_ids() {
        let mut logits = vec![1.0, 2.0];
        apply_repetition_penalty(&mut logits, &[50], 2.0);
        assert_eq!(logits, vec![1.0, 2.0]);
    }

    #[test]
    fn zero_temperature_is_deterministic_argmax() {
        let logits = vec![0.1, 5.0, 3.0, 5.0];
        // Ties go to the lowest index.
        assert_eq!(sample(&logits, 0.0, 0, 1.0), 1);
        assert_eq!(argmax(&logits), 1);
    }

    #[test]
    fn top_k_one_always_returns_the_argmax_index() {
        let logits = vec![0.1, 9.0, 3.0, 0.2];
        for _ in 0..20 {
            assert_eq!(sample(&logits, 1.0, 1, 1.0), 1);
        }
    }

    #[test]
    fn top_p_near_zero_collapses_to_the_highest_probability_token() {
        let logits = vec![0.0, 10.0, -10.0];
        for _ in 0..20 {
            assert_eq!(sample(&logits, 1.0, 0, 1e-6), 1);
        }
    }
}
