use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// Caller-supplied override for byte estimation.
pub type SizeFn = dyn Fn(&Value) -> usize + Send + Sync;

/// Number of collection elements measured before extrapolating.
pub const SAMPLE_SIZE: usize = 50;

const BOOL_SIZE: usize = 1;
const NUMBER_SIZE: usize = 8;
const STRING_OVERHEAD: usize = 24;
const ARRAY_OVERHEAD: usize = 32;
const OBJECT_OVERHEAD: usize = 40;
const FIELD_OVERHEAD: usize = 8;

// Nesting deeper than this falls back to serialized length.
const MAX_STRUCTURAL_DEPTH: usize = 8;
const SHAPE_CACHE_LIMIT: usize = 1024;

/// Estimates the bytes a payload occupies in memory.
///
/// Estimation only; accounting does not claim exact heap bytes. Primitives
/// use a fixed table, strings their length, collections are sampled
/// ([`SAMPLE_SIZE`] elements) and extrapolated, and deeply nested values fall
/// back to their serialized length. Object key overhead is memoized in a
/// bounded per-shape cache.
pub struct SizeCalculator {
    shape_cache: Mutex<HashMap<u64, usize>>,
}

impl SizeCalculator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shape_cache: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn estimate(&self, value: &Value) -> usize {
        self.estimate_at_depth(value, 0)
    }

    /// Release the shape cache.
    pub fn clear(&self) {
        self.shape_cache.lock().clear();
    }

    fn estimate_at_depth(&self, value: &Value, depth: usize) -> usize {
        match value {
            Value::Null => 0,
            Value::Bool(_) => BOOL_SIZE,
            Value::Number(_) => NUMBER_SIZE,
            Value::String(s) => s.len() + STRING_OVERHEAD,
            Value::Array(items) => {
                if depth >= MAX_STRUCTURAL_DEPTH {
                    return serialized_size(value);
                }
                let sampled: usize = items
                    .iter()
                    .take(SAMPLE_SIZE)
                    .map(|item| self.estimate_at_depth(item, depth + 1))
                    .sum();
                let total = if items.len() > SAMPLE_SIZE {
                    // extrapolate from the sample average
                    sampled / SAMPLE_SIZE * items.len()
                } else {
                    sampled
                };
                ARRAY_OVERHEAD + total
            }
            Value::Object(map) => {
                if depth >= MAX_STRUCTURAL_DEPTH {
                    return serialized_size(value);
                }
                let values: usize = map
                    .values()
                    .take(SAMPLE_SIZE)
                    .map(|v| self.estimate_at_depth(v, depth + 1))
                    .sum();
                let values = if map.len() > SAMPLE_SIZE {
                    values / SAMPLE_SIZE * map.len()
                } else {
                    values
                };
                OBJECT_OVERHEAD + self.shape_overhead(map) + values
            }
        }
    }

    /// Key-side overhead for an object shape, memoized by the hash of its
    /// field names. The cache is cleared when it reaches its bound.
    fn shape_overhead(&self, map: &serde_json::Map<String, Value>) -> usize {
        let mut hasher = DefaultHasher::new();
        for key in map.keys() {
            key.hash(&mut hasher);
        }
        let shape = hasher.finish();

        let mut cache = self.shape_cache.lock();
        if let Some(&overhead) = cache.get(&shape) {
            return overhead;
        }
        let overhead: usize = map.keys().map(|k| k.len() + FIELD_OVERHEAD).sum();
        if cache.len() >= SHAPE_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(shape, overhead);
        overhead
    }
}

impl Default for SizeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value)
        .map(|s| s.len())
        .unwrap_or(OBJECT_OVERHEAD)
        + OBJECT_OVERHEAD
}

/// Resolve the effective estimator: a caller override wins, otherwise the
/// shared structural calculator is consulted.
pub(crate) fn measure(
    custom: Option<&Arc<SizeFn>>,
    calculator: &SizeCalculator,
    value: &Value,
) -> usize {
    match custom {
        Some(f) => f(value),
        None => calculator.estimate(value),
    }
}

/// Byte estimate for a list payload given its live element values.
pub(crate) fn measure_list<'a>(
    custom: Option<&Arc<SizeFn>>,
    calculator: &SizeCalculator,
    values: impl Iterator<Item = &'a Value>,
) -> usize {
    ARRAY_OVERHEAD
        + values
            .map(|v| measure(custom, calculator, v))
            .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_use_fixed_table() {
        let calc = SizeCalculator::new();
        assert_eq!(calc.estimate(&Value::Null), 0);
        assert_eq!(calc.estimate(&json!(true)), BOOL_SIZE);
        assert_eq!(calc.estimate(&json!(42)), NUMBER_SIZE);
        assert_eq!(calc.estimate(&json!(2.5)), NUMBER_SIZE);
    }

    #[test]
    fn strings_scale_with_length() {
        let calc = SizeCalculator::new();
        let short = calc.estimate(&json!("ab"));
        let long = calc.estimate(&json!("a".repeat(100)));
        assert_eq!(short, 2 + STRING_OVERHEAD);
        assert_eq!(long, 100 + STRING_OVERHEAD);
    }

    #[test]
    fn large_arrays_extrapolate() {
        let calc = SizeCalculator::new();
        let small: Vec<u64> = (0..10).collect();
        let large: Vec<u64> = (0..1000).collect();
        let small_est = calc.estimate(&json!(small));
        let large_est = calc.estimate(&json!(large));
        assert_eq!(small_est, ARRAY_OVERHEAD + 10 * NUMBER_SIZE);
        // 1000 number elements extrapolated from a 50 element sample
        assert_eq!(large_est, ARRAY_OVERHEAD + 1000 * NUMBER_SIZE);
    }

    #[test]
    fn objects_account_for_keys_and_values() {
        let calc = SizeCalculator::new();
        let est = calc.estimate(&json!({"id": 1, "name": "x"}));
        let expected = OBJECT_OVERHEAD
            + (2 + FIELD_OVERHEAD)
            + (4 + FIELD_OVERHEAD)
            + NUMBER_SIZE
            + (1 + STRING_OVERHEAD);
        assert_eq!(est, expected);
    }

    #[test]
    fn shape_cache_is_reused() {
        let calc = SizeCalculator::new();
        let a = calc.estimate(&json!({"id": 1, "name": "x"}));
        let b = calc.estimate(&json!({"id": 2, "name": "y"}));
        assert_eq!(a, b);
        assert_eq!(calc.shape_cache.lock().len(), 1);
    }

    #[test]
    fn custom_override_wins() {
        let calc = SizeCalculator::new();
        let custom: Arc<SizeFn> = Arc::new(|_| 99);
        assert_eq!(measure(Some(&custom), &calc, &json!("anything")), 99);
        assert_eq!(measure(None, &calc, &json!(1)), NUMBER_SIZE);
    }
}
