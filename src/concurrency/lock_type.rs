use core::fmt;

/// Lock modes for multigranularity locking: the classic NL / IS / IX /
/// S / SIX / X set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// No lock.
    NL,
    /// Intention shared: S locks will be taken on descendants.
    IS,
    /// Intention exclusive: X locks will be taken on descendants.
    IX,
    /// Shared.
    S,
    /// Shared + intention exclusive: read everything, write some
    /// descendants.
    SIX,
    /// Exclusive.
    X,
}

impl LockType {
    /// May two different transactions hold `self` and `other` on the
    /// same resource at the same time? Symmetric.
    pub fn compatible_with(&self, other: LockType) -> bool {
        use LockType::*;
        match (*self, other) {
            (NL, _) | (_, NL) => true,
            (IS, X) | (X, IS) => false,
            (IS, _) | (_, IS) => true,
            (IX, IX) => true,
            (IX, _) | (_, IX) => false,
            (S, S) => true,
            _ => false,
        }
    }

    /// The weakest lock a parent resource must carry for a child to
    /// take `self` on a descendant.
    pub fn parent_lock(&self) -> LockType {
        use LockType::*;
        match self {
            NL => NL,
            IS => IS,
            IX => IX,
            S => IS,
            SIX => IX,
            X => IX,
        }
    }

    /// Does holding `self` on the parent permit taking `child` on a
    /// child resource?
    pub fn can_be_parent_of(&self, child: LockType) -> bool {
        if child == LockType::NL {
            return true;
        }
        self.substitutes(child.parent_lock())
    }

    /// Can `self` stand in for `required`, i.e. does `self` grant
    /// every capability `required` grants? Used to validate promotions.
    pub fn substitutes(&self, required: LockType) -> bool {
        use LockType::*;
        if *self == required {
            return true;
        }
        match *self {
            X => matches!(required, S | IX | IS),
            SIX => matches!(required, S | IX | IS),
            IX => required == IS,
            S => required == IS,
            _ => false,
        }
    }

    pub fn is_intent(&self) -> bool {
        matches!(self, LockType::IS | LockType::IX | LockType::SIX)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
