use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use vole_core::{Graph, Shape};

use crate::SessionCache;

// Randomizer — Deterministic random sources
//
// Generation happens on the host and is uploaded; the device has no RNG of
// its own. The seed policy decides which generator serves an op:
//
//   1. graph seed and op seed both set  → fresh generator per call,
//      seeded graph_seed XOR op_seed
//   2. graph seed only                  → session generator keyed by graph
//   3. op seed only                     → session generator keyed by op tag
//   4. neither                          → non-reproducible generator

/// The generator serving one random op invocation.
pub fn randomizer(
    cache: &SessionCache,
    graph: &Graph,
    op_tag: &str,
    op_seed: Option<u64>,
) -> Rc<RefCell<StdRng>> {
    match (graph.seed, op_seed) {
        (Some(g), Some(o)) => Rc::new(RefCell::new(StdRng::seed_from_u64(g ^ o))),
        (Some(g), None) => {
            let key = format!("graph_{}", graph.id());
            cached_rng(cache, &key, g)
        }
        (None, Some(o)) => {
            let key = format!("op_{}", op_tag);
            cached_rng(cache, &key, o)
        }
        (None, None) => Rc::new(RefCell::new(StdRng::from_entropy())),
    }
}

fn cached_rng(cache: &SessionCache, key: &str, seed: u64) -> Rc<RefCell<StdRng>> {
    cache
        .randomizers
        .borrow_mut()
        .entry(key.to_string())
        .or_insert_with(|| Rc::new(RefCell::new(StdRng::seed_from_u64(seed))))
        .clone()
}

/// `n` uniform samples in `[min, max)`.
pub fn uniform_vec(rng: &Rc<RefCell<StdRng>>, n: usize, min: f64, max: f64) -> Vec<f64> {
    let mut rng = rng.borrow_mut();
    (0..n).map(|_| min + (max - min) * rng.gen::<f64>()).collect()
}

/// `n` normal samples with the given mean and standard deviation.
pub fn normal_vec(rng: &Rc<RefCell<StdRng>>, n: usize, mean: f64, std: f64) -> Vec<f64> {
    let mut rng = rng.borrow_mut();
    (0..n)
        .map(|_| mean + std * rng.sample::<f64, _>(StandardNormal))
        .collect()
}

/// `(fan_in, fan_out)` for glorot initialization, derived from the shape:
/// scalar → (1, 1); rank-1 → (1, n); otherwise (first dim, last dim).
pub fn glorot_fans(shape: &Shape) -> (usize, usize) {
    let dims = shape.dims();
    match dims {
        [] => (1, 1),
        [n] => (1, *n),
        _ => (dims[0], dims[dims.len() - 1]),
    }
}

/// Glorot-uniform samples: uniform in `[-limit, limit]` with
/// `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform_vec(rng: &Rc<RefCell<StdRng>>, shape: &Shape) -> Vec<f64> {
    let (fan_in, fan_out) = glorot_fans(shape);
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    uniform_vec(rng, shape.elem_count(), -limit, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(seed: u64) -> Rc<RefCell<StdRng>> {
        Rc::new(RefCell::new(StdRng::seed_from_u64(seed)))
    }

    #[test]
    fn test_seeded_streams_repeat() {
        let a = uniform_vec(&fresh(7), 16, 0.0, 1.0);
        let b = uniform_vec(&fresh(7), 16, 0.0, 1.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_uniform_range() {
        let v = uniform_vec(&fresh(3), 256, -2.0, 5.0);
        assert!(v.iter().all(|&x| (-2.0..5.0).contains(&x)));
    }

    #[test]
    fn test_glorot_fans() {
        assert_eq!(glorot_fans(&Shape::scalar()), (1, 1));
        assert_eq!(glorot_fans(&Shape::from(8)), (1, 8));
        assert_eq!(glorot_fans(&Shape::from((64, 32))), (64, 32));
    }

    #[test]
    fn test_glorot_bounds() {
        let shape = Shape::from((64, 64));
        let v = glorot_uniform_vec(&fresh(1), &shape);
        let limit = (6.0f64 / 128.0).sqrt();
        assert_eq!(v.len(), 64 * 64);
        assert!(v.iter().all(|&x| x > -limit && x < limit));
    }
}
