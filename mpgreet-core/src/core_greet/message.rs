//! The greet message exchanged between members

use super::errors::GreetResult;
use super::greet_type::{GreetBit, GreetType, Operation};
use super::metadata::GreetingMetadata;
use crate::core_crypto::DhPoint;

/// Random per-session contribution of one member to the session id
pub type Nonce = [u8; 32];

/// One protocol message, combining key agreement and key exchange payloads
///
/// `members`, `int_keys`, `nonces` and `pub_keys` are positionally aligned.
/// An empty `dest` addresses every member (downflow).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetMessage {
    pub source: String,
    pub dest: String,
    pub greet_type: GreetType,
    pub members: Vec<String>,
    /// Intermediate keys; `None` stands for the curve base point
    pub int_keys: Vec<Option<DhPoint>>,
    pub nonces: Vec<Nonce>,
    /// Ephemeral signing public keys
    pub pub_keys: Vec<[u8; 32]>,
    pub session_signature: Option<Vec<u8>>,
    /// Ephemeral signing secret, only disclosed when quitting
    pub signing_key: Option<[u8; 32]>,
    pub metadata: Option<GreetingMetadata>,
}

impl GreetMessage {
    pub fn new(source: impl Into<String>, dest: impl Into<String>, greet_type: GreetType) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            greet_type,
            members: Vec::new(),
            int_keys: Vec::new(),
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
            signing_key: None,
            metadata: None,
        }
    }

    pub fn is_downflow(&self) -> bool {
        self.greet_type.is_down()
    }

    pub fn operation(&self) -> Operation {
        self.greet_type.operation()
    }

    pub fn read_bit(&self, bit: GreetBit) -> bool {
        self.greet_type.read_bit(bit)
    }

    /// Change one flag bit in place; see [`GreetType::set_bit`]
    pub fn set_bit(&mut self, bit: GreetBit, value: bool, silent: bool) -> GreetResult<()> {
        self.greet_type = self.greet_type.set_bit(bit, value, silent)?;
        Ok(())
    }

    pub fn is_gka(&self) -> bool {
        self.greet_type.is_gka()
    }

    pub fn clear_gka(&mut self) -> GreetResult<()> {
        self.set_bit(GreetBit::Gka, false, false)
    }

    pub fn position_of(&self, member: &str) -> Option<usize> {
        self.members.iter().position(|m| m == member)
    }

    pub fn contains(&self, member: &str) -> bool {
        self.position_of(member).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_gka_in_place() {
        let mut msg = GreetMessage::new("1", "", GreetType::InitParticipantDown);
        assert!(msg.is_gka());
        msg.clear_gka().unwrap();
        assert!(!msg.is_gka());
        assert_eq!(msg.greet_type, GreetType::InitParticipantConfirmDown);
    }

    #[test]
    fn test_illegal_bit_leaves_message_untouched() {
        let mut msg = GreetMessage::new("1", "", GreetType::InitParticipantConfirmDown);
        assert!(msg.set_bit(GreetBit::Down, false, false).is_err());
        assert_eq!(msg.greet_type, GreetType::InitParticipantConfirmDown);
    }
}
