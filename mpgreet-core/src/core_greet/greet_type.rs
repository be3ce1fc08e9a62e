//! Greet message types and their flag bits
//!
//! A greet type is a 16-bit tag. The low byte packs the operation class and
//! a handful of flags:
//!
//! ```text
//! bit 0      AUX   auxiliary operation on an established session
//! bit 1      DOWN  downflow (broadcast) rather than upflow (unicast)
//! bit 2      GKA   carries group key agreement material
//! bit 3      SKE   carries authenticated key exchange material
//! bits 4..6  OP    1 START, 2 INCLUDE, 3 EXCLUDE, 4 REFRESH, 5 QUIT
//! bit 7      INIT  sent by the initiator of the operation
//! ```
//!
//! Only twelve combinations are meaningful. Flag changes go through
//! [`GreetType::set_bit`], which refuses to land on a combination that is
//! not one of them.

use super::errors::{GreetError, GreetResult};
use std::fmt;
use tracing::warn;

/// Individual flag bits of a greet type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GreetBit {
    Aux,
    Down,
    Gka,
    Ske,
    Init,
}

impl GreetBit {
    pub fn position(self) -> u16 {
        match self {
            GreetBit::Aux => 0,
            GreetBit::Down => 1,
            GreetBit::Gka => 2,
            GreetBit::Ske => 3,
            GreetBit::Init => 7,
        }
    }

    fn mask(self) -> u16 {
        1 << self.position()
    }
}

const OP_SHIFT: u16 = 4;
const OP_MASK: u16 = 0x7 << OP_SHIFT;

/// Operation class encoded in bits 4..6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Start,
    Include,
    Exclude,
    Refresh,
    Quit,
}

impl Operation {
    fn code(self) -> u16 {
        match self {
            Operation::Start => 1,
            Operation::Include => 2,
            Operation::Exclude => 3,
            Operation::Refresh => 4,
            Operation::Quit => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Include => "include",
            Operation::Exclude => "exclude",
            Operation::Refresh => "refresh",
            Operation::Quit => "quit",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The legal greet message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum GreetType {
    // Initial start sequence
    InitInitiatorUp = 0x09c,
    InitParticipantUp = 0x01c,
    InitParticipantDown = 0x01e,
    InitParticipantConfirmDown = 0x01a,
    // Include sequence
    IncludeAuxInitiatorUp = 0x0ad,
    IncludeAuxParticipantUp = 0x02d,
    IncludeAuxParticipantDown = 0x02f,
    IncludeAuxParticipantConfirmDown = 0x02b,
    // Exclude sequence
    ExcludeAuxInitiatorDown = 0x0bf,
    ExcludeAuxParticipantConfirmDown = 0x03b,
    // Refresh sequence
    RefreshAuxInitiatorDown = 0x0c7,
    // Quit indication
    QuitDown = 0x0d3,
}

impl GreetType {
    /// Every legal greet type, in ascending numeric order
    pub const ALL: [GreetType; 12] = [
        GreetType::InitParticipantConfirmDown,
        GreetType::InitParticipantUp,
        GreetType::InitParticipantDown,
        GreetType::IncludeAuxParticipantConfirmDown,
        GreetType::IncludeAuxParticipantUp,
        GreetType::IncludeAuxParticipantDown,
        GreetType::ExcludeAuxParticipantConfirmDown,
        GreetType::InitInitiatorUp,
        GreetType::IncludeAuxInitiatorUp,
        GreetType::ExcludeAuxInitiatorDown,
        GreetType::RefreshAuxInitiatorDown,
        GreetType::QuitDown,
    ];

    /// Types that open a new operation
    pub const INITIATING: [GreetType; 4] = [
        GreetType::InitInitiatorUp,
        GreetType::IncludeAuxInitiatorUp,
        GreetType::ExcludeAuxInitiatorDown,
        GreetType::RefreshAuxInitiatorDown,
    ];

    pub fn to_number(self) -> u16 {
        self as u16
    }

    pub fn from_number(number: u16) -> GreetResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.to_number() == number)
            .ok_or(GreetError::UnknownGreetType(number))
    }

    /// Wire form, a big-endian u16
    pub fn to_bytes(self) -> [u8; 2] {
        self.to_number().to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> GreetResult<Self> {
        let raw: [u8; 2] = bytes
            .try_into()
            .map_err(|_| {
                GreetError::Decode(format!("greet type must be 2 bytes, got {}", bytes.len()))
            })?;
        Self::from_number(u16::from_be_bytes(raw))
    }

    pub fn name(self) -> &'static str {
        match self {
            GreetType::InitInitiatorUp => "INIT_INITIATOR_UP",
            GreetType::InitParticipantUp => "INIT_PARTICIPANT_UP",
            GreetType::InitParticipantDown => "INIT_PARTICIPANT_DOWN",
            GreetType::InitParticipantConfirmDown => "INIT_PARTICIPANT_CONFIRM_DOWN",
            GreetType::IncludeAuxInitiatorUp => "INCLUDE_AUX_INITIATOR_UP",
            GreetType::IncludeAuxParticipantUp => "INCLUDE_AUX_PARTICIPANT_UP",
            GreetType::IncludeAuxParticipantDown => "INCLUDE_AUX_PARTICIPANT_DOWN",
            GreetType::IncludeAuxParticipantConfirmDown => "INCLUDE_AUX_PARTICIPANT_CONFIRM_DOWN",
            GreetType::ExcludeAuxInitiatorDown => "EXCLUDE_AUX_INITIATOR_DOWN",
            GreetType::ExcludeAuxParticipantConfirmDown => "EXCLUDE_AUX_PARTICIPANT_CONFIRM_DOWN",
            GreetType::RefreshAuxInitiatorDown => "REFRESH_AUX_INITIATOR_DOWN",
            GreetType::QuitDown => "QUIT_DOWN",
        }
    }

    pub fn read_bit(self, bit: GreetBit) -> bool {
        self.to_number() & bit.mask() != 0
    }

    /// Return the greet type with `bit` set to `value`
    ///
    /// # Errors
    ///
    /// Returns `GreetError::IllegalGreetType` if the resulting bits do not
    /// name a legal type. With `silent` set, logs a warning instead and
    /// substitutes the closest legal type that differs from `self`.
    pub fn set_bit(self, bit: GreetBit, value: bool, silent: bool) -> GreetResult<Self> {
        let current = self.to_number();
        let target = if value {
            current | bit.mask()
        } else {
            current & !bit.mask()
        };
        if let Ok(legal) = Self::from_number(target) {
            return Ok(legal);
        }
        if !silent {
            return Err(GreetError::IllegalGreetType(target));
        }
        let substitute = self.nearest_legal(target);
        warn!(
            "Arrived at an illegal message type, but was told to ignore it: {:#05x} -> {}",
            target,
            substitute.name()
        );
        Ok(substitute)
    }

    fn nearest_legal(self, target: u16) -> Self {
        let mut best = self;
        let mut best_distance = u32::MAX;
        for candidate in Self::ALL {
            if candidate == self {
                continue;
            }
            let distance = (candidate.to_number() ^ target).count_ones();
            // ALL is ascending, so strict comparison keeps the lower value on ties
            if distance < best_distance {
                best = candidate;
                best_distance = distance;
            }
        }
        best
    }

    pub fn is_aux(self) -> bool {
        self.read_bit(GreetBit::Aux)
    }

    pub fn is_down(self) -> bool {
        self.read_bit(GreetBit::Down)
    }

    pub fn is_gka(self) -> bool {
        self.read_bit(GreetBit::Gka)
    }

    pub fn is_ske(self) -> bool {
        self.read_bit(GreetBit::Ske)
    }

    pub fn is_init(self) -> bool {
        self.read_bit(GreetBit::Init)
    }

    /// Drop the key agreement flag, e.g. when a downflow only confirms
    pub fn clear_gka(self, silent: bool) -> GreetResult<Self> {
        self.set_bit(GreetBit::Gka, false, silent)
    }

    pub fn operation(self) -> Operation {
        match (self.to_number() & OP_MASK) >> OP_SHIFT {
            1 => Operation::Start,
            2 => Operation::Include,
            3 => Operation::Exclude,
            4 => Operation::Refresh,
            _ => Operation::Quit,
        }
    }

    pub fn is_initiating(self) -> bool {
        Self::INITIATING.contains(&self)
    }

    /// Confirmation types, the only non-initiating packets that can end an operation
    pub fn is_confirm(self) -> bool {
        matches!(
            self,
            GreetType::InitParticipantConfirmDown
                | GreetType::IncludeAuxParticipantConfirmDown
                | GreetType::ExcludeAuxParticipantConfirmDown
        )
    }

    /// The downflow confirmation type that answers messages of `op`
    pub fn confirm_for(op: Operation) -> Option<Self> {
        match op {
            Operation::Start => Some(GreetType::InitParticipantConfirmDown),
            Operation::Include => Some(GreetType::IncludeAuxParticipantConfirmDown),
            Operation::Exclude => Some(GreetType::ExcludeAuxParticipantConfirmDown),
            Operation::Refresh | Operation::Quit => None,
        }
    }

    /// The participant upflow type forwarded along the chain for `op`
    pub fn participant_up_for(op: Operation) -> Option<Self> {
        match op {
            Operation::Start => Some(GreetType::InitParticipantUp),
            Operation::Include => Some(GreetType::IncludeAuxParticipantUp),
            _ => None,
        }
    }

    /// The broadcast type sent by the last member of an upflow chain for `op`
    pub fn participant_down_for(op: Operation) -> Option<Self> {
        match op {
            Operation::Start => Some(GreetType::InitParticipantDown),
            Operation::Include => Some(GreetType::IncludeAuxParticipantDown),
            _ => None,
        }
    }
}

impl fmt::Display for GreetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ({})", self.to_number(), self.name())
    }
}
