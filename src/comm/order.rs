use serde::{Deserialize, Serialize};

/// Control messages broadcast by the master; every slave runs an identical
/// receive loop dispatching on these until [`Order::ProgramFinal`].
///
/// The protocol has no acknowledgment channel for transitions themselves;
/// the blocking collective broadcast is the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Order {
    /// Sweep program begins; slaves answer with a rank handshake.
    ProgramStart = 0,
    /// Environment tensors must be (re)generated before the first sweep.
    InitGrowEnv = 1,
    /// One site-absorption step of the initial environment generation.
    InitGrowEnvGrow = 2,
    /// Initial environment generation finished.
    InitGrowEnvFinish = 3,
    /// A Lanczos solve on the current two-site window begins.
    Lanczos = 4,
    /// A distributed truncated SVD begins.
    Svd = 5,
    /// Matrix-vector product with dynamic task assignment.
    LanczosMatVecDynamic = 6,
    /// Matrix-vector product replaying the previous task assignment.
    LanczosMatVecStatic = 7,
    /// The current Lanczos solve is over.
    LanczosFinish = 8,
    /// Noise-term contraction for a right-moving subspace expansion.
    ContractForRightMovingExpansion = 9,
    /// Noise-term contraction for a left-moving subspace expansion.
    ContractForLeftMovingExpansion = 10,
    /// Extend the left environment by the site just updated.
    GrowingLeftEnv = 11,
    /// Extend the right environment by the site just updated.
    GrowingRightEnv = 12,
    /// Sweep program over; slave loops terminate.
    ProgramFinal = 13,
}

impl Order {
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decodes a wire value. Unknown codes yield `None`; receivers treat them
    /// as ignorable for forward compatibility.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::ProgramStart),
            1 => Some(Self::InitGrowEnv),
            2 => Some(Self::InitGrowEnvGrow),
            3 => Some(Self::InitGrowEnvFinish),
            4 => Some(Self::Lanczos),
            5 => Some(Self::Svd),
            6 => Some(Self::LanczosMatVecDynamic),
            7 => Some(Self::LanczosMatVecStatic),
            8 => Some(Self::LanczosFinish),
            9 => Some(Self::ContractForRightMovingExpansion),
            10 => Some(Self::ContractForLeftMovingExpansion),
            11 => Some(Self::GrowingLeftEnv),
            12 => Some(Self::GrowingRightEnv),
            13 => Some(Self::ProgramFinal),
            _ => None,
        }
    }
}
