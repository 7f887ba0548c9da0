//! Fiber state machine

use core::fmt;

/// State of a fiber
///
/// The only legal transitions are `Ready -> Exec`, `Exec -> Ready`,
/// `Exec -> Term` and `Exec -> Except`. A terminated fiber may be reset
/// back to `Ready`, reusing its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Runnable: freshly created, reset, or suspended by a yield
    Ready = 0,

    /// Currently executing on some OS thread
    Exec = 1,

    /// Callable returned normally
    Term = 2,

    /// Callable panicked; the panic was caught at the fiber entry point
    Except = 3,
}

impl FiberState {
    /// Check if the fiber may be resumed
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber's callable has finished (normally or not)
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// Check whether `self -> next` is one of the legal transitions
    #[inline]
    pub const fn can_transition_to(&self, next: FiberState) -> bool {
        matches!(
            (self, next),
            (FiberState::Ready, FiberState::Exec)
                | (FiberState::Exec, FiberState::Ready)
                | (FiberState::Exec, FiberState::Term)
                | (FiberState::Exec, FiberState::Except)
        )
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Exec,
            2 => FiberState::Term,
            _ => FiberState::Except,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Ready => write!(f, "READY"),
            FiberState::Exec => write!(f, "EXEC"),
            FiberState::Term => write!(f, "TERM"),
            FiberState::Except => write!(f, "EXCEPT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(!FiberState::Exec.is_runnable());
        assert!(FiberState::Term.is_terminated());
        assert!(FiberState::Except.is_terminated());
        assert!(!FiberState::Ready.is_terminated());
    }

    #[test]
    fn test_legal_transitions() {
        let all = [FiberState::Ready, FiberState::Exec, FiberState::Term, FiberState::Except];
        let mut legal = Vec::new();
        for from in all {
            for to in all {
                if from.can_transition_to(to) {
                    legal.push((from, to));
                }
            }
        }
        assert_eq!(legal, vec![
            (FiberState::Ready, FiberState::Exec),
            (FiberState::Exec, FiberState::Ready),
            (FiberState::Exec, FiberState::Term),
            (FiberState::Exec, FiberState::Except),
        ]);
    }

    #[test]
    fn test_u8_roundtrip() {
        for s in [FiberState::Ready, FiberState::Exec, FiberState::Term, FiberState::Except] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }
}
