//! Signals and fiber lifecycle status.
//!
//! A signal is the tagged out-of-band reason the interpreter stopped:
//! normal completion, an error, a debugger trap, a yield, or one of ten
//! user-defined codes. INTERRUPT is the auto-suspend signal; a fiber
//! suspended by it is in the `User9` state and resumes like any other
//! user signal.

/// Reason the interpreter exited.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Ok = 0,
    Error = 1,
    Debug = 2,
    Yield = 3,
    User0 = 4,
    User1 = 5,
    User2 = 6,
    User3 = 7,
    User4 = 8,
    User5 = 9,
    User6 = 10,
    User7 = 11,
    User8 = 12,
    User9 = 13,
    Interrupt = 14,
}

impl Signal {
    pub fn from_u8(byte: u8) -> Option<Signal> {
        match byte {
            0 => Some(Signal::Ok),
            1 => Some(Signal::Error),
            2 => Some(Signal::Debug),
            3 => Some(Signal::Yield),
            4 => Some(Signal::User0),
            5 => Some(Signal::User1),
            6 => Some(Signal::User2),
            7 => Some(Signal::User3),
            8 => Some(Signal::User4),
            9 => Some(Signal::User5),
            10 => Some(Signal::User6),
            11 => Some(Signal::User7),
            12 => Some(Signal::User8),
            13 => Some(Signal::User9),
            14 => Some(Signal::Interrupt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Ok => "ok",
            Signal::Error => "error",
            Signal::Debug => "debug",
            Signal::Yield => "yield",
            Signal::User0 => "user0",
            Signal::User1 => "user1",
            Signal::User2 => "user2",
            Signal::User3 => "user3",
            Signal::User4 => "user4",
            Signal::User5 => "user5",
            Signal::User6 => "user6",
            Signal::User7 => "user7",
            Signal::User8 => "user8",
            Signal::User9 => "user9",
            Signal::Interrupt => "interrupt",
        }
    }

    /// Bit in a fiber's interception mask.
    #[inline(always)]
    pub fn mask_bit(self) -> u32 {
        1u32 << (self as u8)
    }
}

/// Fiber lifecycle state.
///
/// ```text
/// new --resume--> alive --yield-----> pending --resume--> alive
///                       --signal(k)-> user_k  --resume--> alive
///                       --error-----> error  (terminal)
///                       --return----> dead   (terminal)
///                       --debug-----> debug  --step/resume--> alive
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberStatus {
    Dead = 0,
    Error = 1,
    Debug = 2,
    Pending = 3,
    User0 = 4,
    User1 = 5,
    User2 = 6,
    User3 = 7,
    User4 = 8,
    User5 = 9,
    User6 = 10,
    User7 = 11,
    User8 = 12,
    User9 = 13,
    New = 14,
    Alive = 15,
}

impl FiberStatus {
    pub fn name(self) -> &'static str {
        match self {
            FiberStatus::Dead => "dead",
            FiberStatus::Error => "error",
            FiberStatus::Debug => "debug",
            FiberStatus::Pending => "pending",
            FiberStatus::User0 => "user0",
            FiberStatus::User1 => "user1",
            FiberStatus::User2 => "user2",
            FiberStatus::User3 => "user3",
            FiberStatus::User4 => "user4",
            FiberStatus::User5 => "user5",
            FiberStatus::User6 => "user6",
            FiberStatus::User7 => "user7",
            FiberStatus::User8 => "user8",
            FiberStatus::User9 => "user9",
            FiberStatus::New => "new",
            FiberStatus::Alive => "alive",
        }
    }

    /// Status a fiber enters after suspending or finishing with `signal`.
    pub fn from_signal(signal: Signal) -> FiberStatus {
        match signal {
            Signal::Ok => FiberStatus::Dead,
            Signal::Error => FiberStatus::Error,
            Signal::Debug => FiberStatus::Debug,
            Signal::Yield => FiberStatus::Pending,
            Signal::User0 => FiberStatus::User0,
            Signal::User1 => FiberStatus::User1,
            Signal::User2 => FiberStatus::User2,
            Signal::User3 => FiberStatus::User3,
            Signal::User4 => FiberStatus::User4,
            Signal::User5 => FiberStatus::User5,
            Signal::User6 => FiberStatus::User6,
            Signal::User7 => FiberStatus::User7,
            Signal::User8 => FiberStatus::User8,
            Signal::User9 | Signal::Interrupt => FiberStatus::User9,
        }
    }

    /// Signal that a suspended fiber would re-raise if propagated.
    pub fn to_signal(self) -> Option<Signal> {
        match self {
            FiberStatus::Error => Some(Signal::Error),
            FiberStatus::Debug => Some(Signal::Debug),
            FiberStatus::Pending => Some(Signal::Yield),
            FiberStatus::User0 => Some(Signal::User0),
            FiberStatus::User1 => Some(Signal::User1),
            FiberStatus::User2 => Some(Signal::User2),
            FiberStatus::User3 => Some(Signal::User3),
            FiberStatus::User4 => Some(Signal::User4),
            FiberStatus::User5 => Some(Signal::User5),
            FiberStatus::User6 => Some(Signal::User6),
            FiberStatus::User7 => Some(Signal::User7),
            FiberStatus::User8 => Some(Signal::User8),
            FiberStatus::User9 => Some(Signal::User9),
            FiberStatus::Dead | FiberStatus::New | FiberStatus::Alive => None,
        }
    }

    /// True if `continue` may run this fiber.
    pub fn is_resumable(self) -> bool {
        !matches!(self, FiberStatus::Dead | FiberStatus::Error | FiberStatus::Alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_roundtrip() {
        for byte in 0..=14u8 {
            let sig = Signal::from_u8(byte).expect("valid signal");
            assert_eq!(sig as u8, byte);
        }
        assert!(Signal::from_u8(15).is_none());
    }

    #[test]
    fn test_status_transitions() {
        assert_eq!(FiberStatus::from_signal(Signal::Ok), FiberStatus::Dead);
        assert_eq!(FiberStatus::from_signal(Signal::Yield), FiberStatus::Pending);
        assert_eq!(FiberStatus::from_signal(Signal::Error), FiberStatus::Error);
        assert_eq!(FiberStatus::from_signal(Signal::User3), FiberStatus::User3);
        assert_eq!(FiberStatus::from_signal(Signal::Interrupt), FiberStatus::User9);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!FiberStatus::Dead.is_resumable());
        assert!(!FiberStatus::Error.is_resumable());
        assert!(!FiberStatus::Alive.is_resumable());
        assert!(FiberStatus::New.is_resumable());
        assert!(FiberStatus::Pending.is_resumable());
        assert!(FiberStatus::Debug.is_resumable());
        assert!(FiberStatus::User7.is_resumable());
    }

    #[test]
    fn test_status_signal_inverse() {
        for status in [FiberStatus::Pending, FiberStatus::Error, FiberStatus::User4] {
            let sig = status.to_signal().unwrap();
            assert_eq!(FiberStatus::from_signal(sig), status);
        }
        assert_eq!(FiberStatus::Dead.to_signal(), None);
    }

    #[test]
    fn test_mask_bits_distinct() {
        let mut seen = 0u32;
        for byte in 1..=14u8 {
            let bit = Signal::from_u8(byte).unwrap().mask_bit();
            assert_eq!(seen & bit, 0);
            seen |= bit;
        }
    }
}
