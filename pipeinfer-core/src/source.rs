//! Source trait and implementations for pipeline input

use std::sync::Arc;

use crate::error::Result;
use crate::transform::Item;

/// A lazy sequence produced by a source; an `Err` ends the sequence
pub type SourceStream<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// An external origin of items.
///
/// Sources are factories: each call to [`Source::open`] starts a fresh
/// pass, which is what lets a pipeline be executed more than once.
pub trait Source<T>: Send + Sync {
    /// Start a new pass over the source
    fn open(&self) -> Result<SourceStream<T>>;

    /// Provides a hint about the total number of items (if known)
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// A source backed by a generator closure
pub struct GeneratorSource<T> {
    generator: Arc<dyn Fn() -> Box<dyn Iterator<Item = T> + Send> + Send + Sync>,
    size_hint: Option<u64>,
}

impl<T: Item> GeneratorSource<T> {
    /// Wrap a generator; it is called once per pass
    pub fn new<G, I>(generator: G) -> Self
    where
        G: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            generator: Arc::new(move || Box::new(generator().into_iter())),
            size_hint: None,
        }
    }

    /// Attach a known item count, used for progress estimates
    pub fn with_size_hint(mut self, size_hint: u64) -> Self {
        self.size_hint = Some(size_hint);
        self
    }
}

impl<T: Item> Source<T> for GeneratorSource<T> {
    fn open(&self) -> Result<SourceStream<T>> {
        Ok(Box::new((self.generator)().map(Ok)))
    }

    fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }
}

/// A source over an in-memory list, replayed on every pass
pub struct IterSource<T> {
    items: Arc<Vec<T>>,
}

impl<T: Item> IterSource<T> {
    /// Create a source over `items`
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
        }
    }
}

impl<T: Item> Source<T> for IterSource<T> {
    fn open(&self) -> Result<SourceStream<T>> {
        let items = Arc::clone(&self.items);
        Ok(Box::new((0..items.len()).map(move |i| Ok(items[i].clone()))))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.items.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_source_is_replayable() {
        let source = GeneratorSource::new(|| 1..=3_i64).with_size_hint(3);
        let first: Vec<i64> = source.open().unwrap().map(|r| r.unwrap()).collect();
        let second: Vec<i64> = source.open().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(first, second);
        assert_eq!(source.size_hint(), Some(3));
    }

    #[test]
    fn test_iter_source() {
        let source = IterSource::new(vec!["a".to_string(), "b".to_string()]);
        let items: Vec<String> = source.open().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(items, vec!["a", "b"]);
        assert_eq!(source.size_hint(), Some(2));
    }
}
