//! Key ordering shared by every sorted structure in the store.

use std::cmp::Ordering;

/// A total order over opaque key bytes.
///
/// The skip list and the run files both sort by `Vec<u8>`'s own `Ord`, so any
/// comparator handed to the read path has to agree with it; [`Bytewise`] does.
pub trait Comparator: Clone + Send + Sync + 'static {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

/// Lexicographic order over unsigned bytes; a shorter key sorts before any
/// longer key it is a prefix of.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Bytewise;

impl Comparator for Bytewise {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_order() {
        let cmp = Bytewise;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp.compare(b"ab", b"a"), Ordering::Greater);
        assert_eq!(cmp.compare(b"", b"a"), Ordering::Less);
        // Unsigned: 0xff sorts after ASCII
        assert_eq!(cmp.compare(&[0xff], b"z"), Ordering::Greater);
        assert!(cmp.equal(b"key", b"key"));
    }

    #[test]
    fn test_bytewise_agrees_with_vec_ord() {
        let mut keys: Vec<Vec<u8>> = vec![
            b"key_10".to_vec(),
            vec![0x00],
            b"key_1".to_vec(),
            vec![0xff, 0x00],
            b"KEY".to_vec(),
        ];
        let mut by_comparator = keys.clone();
        by_comparator.sort_by(|a, b| Bytewise.compare(a, b));
        keys.sort();
        assert_eq!(keys, by_comparator);
    }
}
