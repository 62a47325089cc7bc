use serde::{Deserialize, Serialize};

/// Named observation vectors, kept in insertion order.
///
/// Flattening concatenates the vectors in that order, so two observations with
/// the same keys inserted in the same order always flatten to the same layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    entries: Vec<(String, Vec<f32>)>,
}

impl Observation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: Vec<f32>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces `key`. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: Vec<f32>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[f32]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalars across all keys.
    pub fn flat_dim(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    /// Concatenates every vector in key order.
    pub fn flatten(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.flat_dim());
        for (_, v) in &self.entries {
            out.extend_from_slice(v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_follows_insertion_order() {
        let ob = Observation::new()
            .with("b", vec![3.0, 4.0])
            .with("a", vec![1.0]);
        assert_eq!(ob.flatten(), vec![3.0, 4.0, 1.0]);
        assert_eq!(ob.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut ob = Observation::new().with("x", vec![1.0]).with("y", vec![2.0]);
        ob.insert("x", vec![9.0, 9.0]);
        assert_eq!(ob.flatten(), vec![9.0, 9.0, 2.0]);
        assert_eq!(ob.len(), 2);
        assert_eq!(ob.get("x"), Some(&[9.0, 9.0][..]));
        assert_eq!(ob.flat_dim(), 3);
    }
}
