use std::cell::RefCell;
use std::rc::Rc;

/// A memoizing view over an iterator. Elements are pulled from the underlying
/// iterator only when first needed and kept for later passes, so candidate
/// enumeration that hits the network is short-circuited as soon as the
/// resolver accepts a match.
///
/// Handles are cheap to clone and share their backing storage, which is what
/// lets successive resolver states reference the same candidate view without
/// re-running the enumeration.
pub struct LazySequence<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

struct Inner<T> {
    cached: Vec<T>,
    source: Option<Box<dyn Iterator<Item = T>>>,
}

impl<T: Clone> LazySequence<T> {
    /// Wraps an iterator without consuming any of it yet.
    pub fn new(iter: impl Iterator<Item = T> + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                cached: Vec::new(),
                source: Some(Box::new(iter)),
            })),
        }
    }

    /// A sequence over already-materialized items.
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                cached: items,
                source: None,
            })),
        }
    }

    /// Returns the item at `index`, advancing the underlying iterator as far
    /// as necessary.
    pub fn get(&self, index: usize) -> Option<T> {
        let mut inner = self.inner.borrow_mut();
        while inner.cached.len() <= index {
            let next = match inner.source.as_mut() {
                Some(source) => source.next(),
                None => return None,
            };
            match next {
                Some(item) => inner.cached.push(item),
                None => {
                    inner.source = None;
                    return None;
                }
            }
        }
        Some(inner.cached[index].clone())
    }

    /// Whether the sequence yields at least one item.
    pub fn is_empty(&self) -> bool {
        self.get(0).is_none()
    }

    /// Iterates over the sequence from the start, lazily extending the cache.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        let mut index = 0;
        std::iter::from_fn(move || {
            let item = self.get(index);
            index += 1;
            item
        })
    }

    /// Like [`LazySequence::iter`], but the iterator shares ownership of the
    /// backing storage instead of borrowing it.
    pub fn iter_owned(&self) -> OwnedIter<T> {
        OwnedIter {
            seq: self.clone(),
            index: 0,
        }
    }
}

/// An owning iterator over a shared [`LazySequence`].
pub struct OwnedIter<T> {
    seq: LazySequence<T>,
    index: usize,
}

impl<T: Clone> Iterator for OwnedIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let item = self.seq.get(self.index);
        self.index += 1;
        item
    }
}

impl<T> Clone for LazySequence<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_pulls_lazily() {
        let pulled = Rc::new(Cell::new(0));
        let counter = Rc::clone(&pulled);
        let seq = LazySequence::new((0..5).inspect(move |_| counter.set(counter.get() + 1)));

        assert!(!seq.is_empty());
        assert_eq!(pulled.get(), 1);
        assert_eq!(seq.get(2), Some(2));
        assert_eq!(pulled.get(), 3);

        // a second pass does not re-pull
        assert_eq!(seq.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(pulled.get(), 5);
        assert_eq!(seq.get(7), None);
    }

    #[test]
    fn test_shared_handles() {
        let seq = LazySequence::new(0..3);
        let other = seq.clone();
        assert_eq!(seq.get(1), Some(1));
        assert_eq!(other.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
