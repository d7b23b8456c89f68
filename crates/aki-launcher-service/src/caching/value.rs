/// The result of a cache read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheValue<T> {
    /// The key holds a value.
    Value(T),
    /// The key exists, but its payload is gone.
    Null,
    /// The key is absent or expired.
    #[default]
    NoValue,
}

impl<T> CacheValue<T> {
    pub fn has_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_no_value(&self) -> bool {
        matches!(self, Self::NoValue)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Maps a function over the contained value, keeping `Null` and `NoValue` as they are.
    pub fn map<U, F>(self, f: F) -> CacheValue<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Value(value) => CacheValue::Value(f(value)),
            Self::Null => CacheValue::Null,
            Self::NoValue => CacheValue::NoValue,
        }
    }
}
