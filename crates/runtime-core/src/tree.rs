//! Flattened state trees
//!
//! Nested training state is addressed by `/`-joined leaf paths
//! (`target/encoder/layers_0/kernel`). A [`StateDict`] is an ordered map from
//! those paths to leaves, so every per-leaf pass walks leaves in the same
//! order on every host.

use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::{DType, LazyArray, NdArray, Result, Scalar, Step};

/// Ordered map from `/`-joined leaf path to leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict<T>(BTreeMap<String, T>);

impl<T> Default for StateDict<T> {
    fn default() -> Self {
        StateDict(BTreeMap::new())
    }
}

impl<T> StateDict<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: T) -> Option<T> {
        self.0.insert(path.into(), value)
    }

    pub fn get(&self, path: &str) -> Option<&T> {
        self.0.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut T> {
        self.0.get_mut(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<T> {
        self.0.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, T> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, String, T> {
        self.0.iter_mut()
    }

    /// Apply `f` to every leaf, keeping paths
    pub fn map<U>(self, mut f: impl FnMut(&str, T) -> U) -> StateDict<U> {
        StateDict(
            self.0
                .into_iter()
                .map(|(path, value)| {
                    let mapped = f(&path, value);
                    (path, mapped)
                })
                .collect(),
        )
    }

    /// Fallible [`StateDict::map`]
    pub fn try_map<U>(self, mut f: impl FnMut(&str, T) -> Result<U>) -> Result<StateDict<U>> {
        let mut out = BTreeMap::new();
        for (path, value) in self.0 {
            let mapped = f(&path, value)?;
            out.insert(path, mapped);
        }
        Ok(StateDict(out))
    }

    /// Keep only the leaves whose path also appears in `other`
    pub fn intersect<U>(self, other: &StateDict<U>) -> StateDict<T> {
        StateDict(
            self.0
                .into_iter()
                .filter(|(path, _)| other.contains(path))
                .collect(),
        )
    }

    /// Fill paths missing here with leaves from `fallback`
    pub fn merge(mut self, fallback: StateDict<T>) -> StateDict<T> {
        for (path, value) in fallback.0 {
            self.0.entry(path).or_insert(value);
        }
        self
    }

    /// Move the leaf at `from` to `to`, returning whether it existed
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> bool {
        match self.0.remove(from) {
            Some(value) => {
                self.0.insert(to.into(), value);
                true
            }
            None => false,
        }
    }
}

impl<T> FromIterator<(String, T)> for StateDict<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        StateDict(iter.into_iter().collect())
    }
}

impl<T> IntoIterator for StateDict<T> {
    type Item = (String, T);
    type IntoIter = btree_map::IntoIter<String, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a StateDict<T> {
    type Item = (&'a String, &'a T);
    type IntoIter = btree_map::Iter<'a, String, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// One leaf of the training state
#[derive(Debug, Clone)]
pub enum Value {
    /// Materialized array
    Array(NdArray),

    /// Non-array value (counters, flags, names)
    Scalar(Scalar),

    /// Array fetched on demand
    Lazy(LazyArray),

    /// Leaf intentionally not present (e.g. optimizer slot that is not used)
    Absent,
}

impl Value {
    /// Array shape, if this leaf is an array
    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            Value::Array(array) => Some(array.shape()),
            Value::Lazy(lazy) => Some(lazy.shape()),
            Value::Scalar(_) | Value::Absent => None,
        }
    }

    /// Array dtype, if this leaf is an array
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Value::Array(array) => Some(array.dtype()),
            Value::Lazy(lazy) => Some(lazy.dtype()),
            Value::Scalar(_) | Value::Absent => None,
        }
    }

    /// Array data size in bytes (0 for non-arrays)
    pub fn nbytes(&self) -> u64 {
        match self {
            Value::Array(array) => array.nbytes(),
            Value::Lazy(lazy) => lazy.nbytes(),
            Value::Scalar(_) | Value::Absent => 0,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    /// Cast floating point arrays to `dtype`; other leaves pass through
    pub fn cast_float(self, dtype: DType) -> Value {
        match self {
            Value::Array(array) if array.dtype().is_float() => Value::Array(array.cast(dtype)),
            Value::Lazy(lazy) if lazy.dtype().is_float() => Value::Lazy(lazy.cast(dtype)),
            other => other,
        }
    }

    /// Resolve a lazy leaf into an array
    pub async fn materialize(self) -> Result<Value> {
        match self {
            Value::Lazy(lazy) => Ok(Value::Array(lazy.get_async().await?)),
            other => Ok(other),
        }
    }
}

impl From<NdArray> for Value {
    fn from(array: NdArray) -> Self {
        Value::Array(array)
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        Value::Scalar(scalar)
    }
}

impl From<LazyArray> for Value {
    fn from(lazy: LazyArray) -> Self {
        Value::Lazy(lazy)
    }
}

/// Training state handed to save and returned by restore
#[derive(Debug, Clone, Default)]
pub struct TrainState {
    /// Step the state corresponds to
    pub step: Step,

    /// Flattened model and optimizer leaves
    pub state: StateDict<Value>,
}

impl TrainState {
    pub fn new(step: Step, state: StateDict<Value>) -> Self {
        Self { step, state }
    }
}
