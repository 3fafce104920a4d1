/// Tri-state result of a cache read.
///
/// Distinguishes a key that was never written (`Missing`) from a key that
/// was deliberately cached as null (`Null`). Expired keys read as `Missing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue<T> {
    /// The key is absent or expired.
    Missing,
    /// The key is present and holds an explicit null.
    Null,
    /// The key is present with a payload.
    Value(T),
}

impl<T> CacheValue<T> {
    /// True when a payload is present (`Null` carries no payload).
    #[must_use]
    pub fn has_value(&self) -> bool {
        matches!(self, CacheValue::Value(_))
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, CacheValue::Missing)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, CacheValue::Null)
    }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            CacheValue::Value(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Option<T> {
        match self {
            CacheValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        match self {
            CacheValue::Value(v) => v,
            _ => default,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CacheValue<U> {
        match self {
            CacheValue::Missing => CacheValue::Missing,
            CacheValue::Null => CacheValue::Null,
            CacheValue::Value(v) => CacheValue::Value(f(v)),
        }
    }
}

impl<T> From<Option<T>> for CacheValue<T> {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => CacheValue::Value(v),
            None => CacheValue::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tri_state() {
        let missing: CacheValue<i32> = CacheValue::Missing;
        let null: CacheValue<i32> = CacheValue::Null;
        let value = CacheValue::Value(7);

        assert!(missing.is_missing());
        assert!(!missing.has_value());
        assert!(null.is_null());
        assert!(!null.has_value());
        assert!(value.has_value());
        assert_eq!(value.value(), Some(&7));
    }

    #[test]
    fn map_preserves_state() {
        let v = CacheValue::Value(2).map(|n| n * 10);
        assert_eq!(v, CacheValue::Value(20));

        let n: CacheValue<i32> = CacheValue::Null;
        assert_eq!(n.map(|x| x * 10), CacheValue::Null);
    }

    #[test]
    fn unwrap_or_defaults() {
        assert_eq!(CacheValue::Value(1).unwrap_or(9), 1);
        assert_eq!(CacheValue::<i32>::Missing.unwrap_or(9), 9);
        assert_eq!(CacheValue::<i32>::Null.unwrap_or(9), 9);
    }
}
