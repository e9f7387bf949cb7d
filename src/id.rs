use std::fmt;

/// Identity of a fiber context.
///
/// Wraps the context's registry slot, so ids compare equal exactly when they
/// name the same registered context and order totally, which makes them
/// usable as keys in ordered maps. The default value is a sentinel naming no
/// fiber at all; it prints as `{not-valid}` and is falsy under
/// [`is_valid`](FiberId::is_valid).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(usize);

const INVALID: usize = usize::MAX;

impl FiberId {
    /// The sentinel id naming no fiber.
    pub const fn invalid() -> FiberId {
        FiberId(INVALID)
    }

    pub(crate) const fn new(slot: usize) -> FiberId {
        FiberId(slot)
    }

    /// Whether this id names a real fiber.
    pub fn is_valid(self) -> bool {
        self.0 != INVALID
    }

    pub(crate) fn slot(self) -> usize {
        debug_assert!(self.is_valid());
        self.0
    }
}

impl Default for FiberId {
    fn default() -> FiberId {
        FiberId::invalid()
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("{not-valid}")
        }
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_falsy() {
        let id = FiberId::default();
        assert!(!id.is_valid());
        assert_eq!(id, FiberId::invalid());
        assert_eq!(format!("{}", id), "{not-valid}");
    }

    #[test]
    fn real_ids_compare_by_slot() {
        let a = FiberId::new(3);
        let b = FiberId::new(3);
        let c = FiberId::new(7);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
        assert_ne!(a, FiberId::invalid());
    }

    #[test]
    fn total_order_is_consistent() {
        let ids: Vec<FiberId> = [4usize, 1, 9, 0, 6].iter().map(|&s| FiberId::new(s)).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        for w in sorted.windows(2) {
            assert!(w[0] <= w[1]);
        }
        // antisymmetry over the set
        for &x in &ids {
            for &y in &ids {
                if x <= y && y <= x {
                    assert_eq!(x, y);
                }
            }
        }
    }
}
