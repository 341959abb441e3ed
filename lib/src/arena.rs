//! Index-keyed storage for one simulation run.
//!
//! Parts refer to each other (parent, attach nodes, fuel targets) by id
//! rather than by reference, so removing a part from the active graph is
//! just a matter of clearing ids.
use std::{
    marker::PhantomData,
    ops::{Index, IndexMut},
};

#[derive(Clone, Debug, PartialEq)]
pub struct Arena<Id: IdLike + Copy, T> {
    inner: Vec<T>,
    _phantom: PhantomData<Id>,
}

impl<Id: IdLike + Copy, T> Arena<Id, T> {
    pub fn new() -> Self {
        Self {
            inner: Vec::new(),
            _phantom: PhantomData,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
            _phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The id the next [`Self::push`] will hand out.
    pub fn next_id(&self) -> Id {
        Id::from_raw(self.inner.len())
    }

    pub fn push(&mut self, x: T) -> Id {
        let id = self.next_id();
        self.inner.push(x);
        id
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.inner.get(id.into_raw())
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.inner.get_mut(id.into_raw())
    }

    pub fn contains(&self, id: Id) -> bool {
        id.into_raw() < self.inner.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> {
        (0..self.inner.len()).map(Id::from_raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.inner.iter().enumerate().map(|(i, v)| (Id::from_raw(i), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id, &mut T)> {
        self.inner
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (Id::from_raw(i), v))
    }
}

impl<Id: IdLike + Copy, T> Default for Arena<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: IdLike + Copy, T> Index<Id> for Arena<Id, T> {
    type Output = T;

    fn index(&self, index: Id) -> &Self::Output {
        &self.inner[index.into_raw()]
    }
}

impl<Id: IdLike + Copy, T> IndexMut<Id> for Arena<Id, T> {
    fn index_mut(&mut self, index: Id) -> &mut Self::Output {
        &mut self.inner[index.into_raw()]
    }
}

impl<Id: IdLike + Copy, T> FromIterator<T> for Arena<Id, T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
            _phantom: PhantomData,
        }
    }
}

pub trait IdLike {
    fn from_raw(index: usize) -> Self;
    fn into_raw(self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct TestId(u32);

    impl IdLike for TestId {
        fn from_raw(index: usize) -> Self {
            Self(index as u32)
        }

        fn into_raw(self) -> usize {
            self.0 as usize
        }
    }

    #[test]
    fn ids_are_dense_and_stable() {
        let mut arena: Arena<TestId, &str> = Arena::new();
        let a = arena.push("a");
        let b = arena.push("b");
        assert_eq!(a, TestId(0));
        assert_eq!(b, TestId(1));
        assert_eq!(arena[b], "b");
        arena[a] = "c";
        assert_eq!(arena.iter().map(|(_, v)| *v).collect::<Vec<_>>(), ["c", "b"]);
        assert!(!arena.contains(TestId(2)));
        assert!(arena.get(TestId(2)).is_none());
    }
}
