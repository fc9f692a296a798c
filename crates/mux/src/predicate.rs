use std::fmt;
use std::sync::Arc;

/// Cloneable, thread-safe predicate over `T`.
pub struct Predicate<T>(Arc<dyn Fn(&T) -> bool + Send + Sync>);

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate")
    }
}

impl<T: 'static> Predicate<T> {
    pub fn new(f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Matches everything.
    pub fn any() -> Self {
        Self::new(|_| true)
    }

    pub fn matches(&self, value: &T) -> bool {
        (self.0)(value)
    }

    pub fn not(self) -> Self {
        Self::new(move |v| !self.matches(v))
    }

    /// Matches when at least one of `predicates` matches; an empty set never matches.
    pub fn or(predicates: impl IntoIterator<Item = Predicate<T>>) -> Self {
        let predicates: Vec<_> = predicates.into_iter().collect();
        Self::new(move |v| predicates.iter().any(|p| p.matches(v)))
    }

    /// Matches when every one of `predicates` matches; an empty set always matches.
    pub fn and(predicates: impl IntoIterator<Item = Predicate<T>>) -> Self {
        let predicates: Vec<_> = predicates.into_iter().collect();
        Self::new(move |v| predicates.iter().all(|p| p.matches(v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn even() -> Predicate<u32> {
        Predicate::new(|n| n % 2 == 0)
    }

    fn small() -> Predicate<u32> {
        Predicate::new(|n| *n < 10)
    }

    #[test]
    fn combinators() {
        assert!(Predicate::<u32>::any().matches(&7));
        assert!(even().not().matches(&3));
        assert!(Predicate::or([even(), small()]).matches(&3));
        assert!(!Predicate::or([even(), small()]).matches(&13));
        assert!(Predicate::and([even(), small()]).matches(&4));
        assert!(!Predicate::and([even(), small()]).matches(&12));
    }

    #[test]
    fn empty_sets() {
        assert!(!Predicate::<u32>::or([]).matches(&1));
        assert!(Predicate::<u32>::and([]).matches(&1));
    }
}
