//! Signed packet envelope for greet messages
//!
//! Packet layout, every field a TLV record:
//!
//! ```text
//! PROTOCOL_VERSION | MESSAGE_TYPE | MESSAGE_SIGNATURE |
//! GREET_TYPE | SOURCE | DEST | MEMBER* | INT_KEY* | NONCE* | PUB_KEY* |
//! SESSION_SIGNATURE? | SIGNING_KEY? | (PREV_PF | CHAIN_HASH | LATEST_PM*)?
//! ```
//!
//! The signature is made with the sender's long-term key over the version
//! and message type records followed by everything after the signature.

use super::errors::{GreetError, GreetResult};
use super::greet_type::GreetType;
use super::message::{GreetMessage, Nonce};
use super::metadata::GreetingMetadata;
use crate::core_codec::{TlvReader, TlvWriter};
use crate::core_crypto::{sha256, Digest, GreetSigningKey, GreetVerifyingKey};
use crate::metrics::{self as greet_metrics, names};
use tracing::debug;

/// Version byte of the packet format
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Message type byte of greet packets
pub const MESSAGE_TYPE_GREET: u8 = 0x02;

/// TLV record types used in greet packets
pub mod tlv_type {
    pub const PROTOCOL_VERSION: u16 = 0x0001;
    pub const MESSAGE_TYPE: u16 = 0x0002;
    pub const MESSAGE_SIGNATURE: u16 = 0x0003;
    pub const GREET_TYPE: u16 = 0x0100;
    pub const SOURCE: u16 = 0x0101;
    pub const DEST: u16 = 0x0102;
    pub const MEMBER: u16 = 0x0103;
    pub const INT_KEY: u16 = 0x0104;
    pub const NONCE: u16 = 0x0105;
    pub const PUB_KEY: u16 = 0x0106;
    pub const SESSION_SIGNATURE: u16 = 0x0107;
    pub const SIGNING_KEY: u16 = 0x0108;
    pub const PREV_PF: u16 = 0x0109;
    pub const CHAIN_HASH: u16 = 0x010a;
    pub const LATEST_PM: u16 = 0x010b;
}

/// Id of a packet, the hash of its bytes
pub fn packet_id(packet: &[u8]) -> Digest {
    sha256(packet)
}

/// The handful of fields readable without verifying or fully parsing a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketPeek {
    pub greet_type: GreetType,
    pub source: String,
    pub members: Vec<String>,
    pub metadata: Option<GreetingMetadata>,
}

struct Envelope<'a> {
    signature: &'a [u8],
    signed: Vec<u8>,
    payload: &'a [u8],
}

fn envelope_header() -> GreetResult<Vec<u8>> {
    let mut writer = TlvWriter::new();
    writer
        .put(tlv_type::PROTOCOL_VERSION, &[PROTOCOL_VERSION])?
        .put(tlv_type::MESSAGE_TYPE, &[MESSAGE_TYPE_GREET])?;
    Ok(writer.finish())
}

fn open_envelope(packet: &[u8]) -> GreetResult<Envelope<'_>> {
    let mut reader = TlvReader::new(packet);

    let version = reader.pop(tlv_type::PROTOCOL_VERSION)?;
    if version != [PROTOCOL_VERSION] {
        return Err(GreetError::ProtocolVersion {
            expected: PROTOCOL_VERSION,
            actual: version.first().copied().unwrap_or_default(),
        });
    }
    let message_type = reader.pop(tlv_type::MESSAGE_TYPE)?;
    if message_type != [MESSAGE_TYPE_GREET] {
        return Err(GreetError::Decode(format!(
            "not a greet message: type {}",
            hex::encode(message_type)
        )));
    }
    let header_len = packet.len() - reader.remaining().len();

    let signature = reader.pop(tlv_type::MESSAGE_SIGNATURE)?;
    let payload = reader.remaining();

    let mut signed = Vec::with_capacity(header_len + payload.len());
    signed.extend_from_slice(&packet[..header_len]);
    signed.extend_from_slice(payload);

    Ok(Envelope { signature, signed, payload })
}

/// Serialize and sign a message
///
/// # Errors
///
/// `GreetError::Precondition` if the message carries metadata authored by
/// anyone other than its source.
pub fn encode_packet(
    message: &GreetMessage,
    signing_key: &GreetSigningKey,
) -> GreetResult<Vec<u8>> {
    let header = envelope_header()?;
    let payload = encode_payload(message)?;

    let mut signed = header.clone();
    signed.extend_from_slice(&payload);
    let signature = signing_key.sign(&signed);

    let mut writer = TlvWriter::new();
    writer
        .put_raw(&header)
        .put(tlv_type::MESSAGE_SIGNATURE, &signature)?
        .put_raw(&payload);

    greet_metrics::record_counter(names::PACKETS_ENCODED, 1);
    Ok(writer.finish())
}

fn encode_payload(message: &GreetMessage) -> GreetResult<Vec<u8>> {
    let mut writer = TlvWriter::new();
    writer
        .put_u16(tlv_type::GREET_TYPE, message.greet_type.to_number())?
        .put(tlv_type::SOURCE, message.source.as_bytes())?
        .put(tlv_type::DEST, message.dest.as_bytes())?
        .put_all(tlv_type::MEMBER, message.members.iter().map(|m| m.as_bytes()))?
        .put_all(
            tlv_type::INT_KEY,
            message
                .int_keys
                .iter()
                .map(|k| k.as_ref().map(|p| p.as_slice()).unwrap_or_default()),
        )?
        .put_all(tlv_type::NONCE, message.nonces.iter().map(|n| n.as_slice()))?
        .put_all(tlv_type::PUB_KEY, message.pub_keys.iter().map(|k| k.as_slice()))?;

    if let Some(signature) = &message.session_signature {
        writer.put(tlv_type::SESSION_SIGNATURE, signature)?;
    }
    if let Some(key) = &message.signing_key {
        writer.put(tlv_type::SIGNING_KEY, key)?;
    }
    if let Some(meta) = &message.metadata {
        // the author is not on the wire, receivers take it from SOURCE
        if meta.author != message.source {
            return Err(GreetError::Precondition(format!(
                "metadata author {} does not match source {}",
                meta.author, message.source
            )));
        }
        writer
            .put(tlv_type::PREV_PF, &meta.prev_pf)?
            .put(tlv_type::CHAIN_HASH, &meta.prev_ch)?
            .put_all(tlv_type::LATEST_PM, meta.parents.iter().map(|p| p.as_slice()))?;
    }
    Ok(writer.finish())
}

/// Parse a packet and verify it was signed by `sender_key`
///
/// # Errors
///
/// - `GreetError::ProtocolVersion` for an unknown envelope version
/// - `GreetError::SignatureInvalid` if the signature does not verify
/// - `GreetError::Decode` / `GreetError::Codec` for malformed content
pub fn decode_packet(packet: &[u8], sender_key: &GreetVerifyingKey) -> GreetResult<GreetMessage> {
    let envelope = open_envelope(packet)?;
    let message = decode_payload(envelope.payload)?;

    if !sender_key.verify(&envelope.signed, envelope.signature)? {
        return Err(GreetError::SignatureInvalid(message.source));
    }

    log_decoded(&message, envelope.signature);
    greet_metrics::record_counter(names::PACKETS_DECODED, 1);
    Ok(message)
}

/// Read the greet type, source, members and metadata of a packet
///
/// Does not verify the signature and skips the key material.
pub fn peek_packet(packet: &[u8]) -> GreetResult<PacketPeek> {
    let envelope = open_envelope(packet)?;
    let mut reader = TlvReader::new(envelope.payload);

    let greet_type = GreetType::from_number(reader.pop_u16(tlv_type::GREET_TYPE)?)?;
    let source = to_string(reader.pop(tlv_type::SOURCE)?)?;
    reader.pop(tlv_type::DEST)?;
    let members = pop_strings(&mut reader, tlv_type::MEMBER)?;

    let metadata = match reader.seek(tlv_type::PREV_PF)? {
        Some(prev_pf) => Some(read_metadata(&mut reader, prev_pf, &source)?),
        None => None,
    };

    Ok(PacketPeek { greet_type, source, members, metadata })
}

fn decode_payload(payload: &[u8]) -> GreetResult<GreetMessage> {
    let mut reader = TlvReader::new(payload);

    let greet_type = GreetType::from_number(reader.pop_u16(tlv_type::GREET_TYPE)?)?;
    let source = to_string(reader.pop(tlv_type::SOURCE)?)?;
    let dest = to_string(reader.pop(tlv_type::DEST)?)?;
    let mut message = GreetMessage::new(source, dest, greet_type);

    message.members = pop_strings(&mut reader, tlv_type::MEMBER)?;
    message.int_keys = reader
        .pop_all(tlv_type::INT_KEY)?
        .into_iter()
        .map(|v| {
            if v.is_empty() {
                Ok(None)
            } else {
                to_array(v, tlv_type::INT_KEY).map(Some)
            }
        })
        .collect::<GreetResult<_>>()?;
    message.nonces = reader
        .pop_all(tlv_type::NONCE)?
        .into_iter()
        .map(|v| to_array::<32>(v, tlv_type::NONCE))
        .collect::<GreetResult<Vec<Nonce>>>()?;
    message.pub_keys = reader
        .pop_all(tlv_type::PUB_KEY)?
        .into_iter()
        .map(|v| to_array(v, tlv_type::PUB_KEY))
        .collect::<GreetResult<_>>()?;
    message.session_signature = reader
        .pop_maybe(tlv_type::SESSION_SIGNATURE)?
        .map(<[u8]>::to_vec);
    message.signing_key = reader
        .pop_maybe(tlv_type::SIGNING_KEY)?
        .map(|v| to_array(v, tlv_type::SIGNING_KEY))
        .transpose()?;
    if let Some(prev_pf) = reader.pop_maybe(tlv_type::PREV_PF)? {
        message.metadata = Some(read_metadata(&mut reader, prev_pf, &message.source)?);
    }

    if !reader.is_empty() {
        return Err(GreetError::Decode(format!(
            "{} trailing bytes after greet message",
            reader.remaining().len()
        )));
    }
    Ok(message)
}

fn read_metadata(
    reader: &mut TlvReader<'_>,
    prev_pf: &[u8],
    author: &str,
) -> GreetResult<GreetingMetadata> {
    let prev_pf = to_array(prev_pf, tlv_type::PREV_PF)?;
    let prev_ch = to_array(reader.pop(tlv_type::CHAIN_HASH)?, tlv_type::CHAIN_HASH)?;
    let parents = reader
        .pop_all(tlv_type::LATEST_PM)?
        .into_iter()
        .map(|v| to_array(v, tlv_type::LATEST_PM))
        .collect::<GreetResult<Vec<Digest>>>()?;
    Ok(GreetingMetadata::create(prev_pf, prev_ch, author, parents))
}

fn pop_strings(reader: &mut TlvReader<'_>, tlv_type: u16) -> GreetResult<Vec<String>> {
    reader.pop_all(tlv_type)?.into_iter().map(to_string).collect()
}

fn to_string(value: &[u8]) -> GreetResult<String> {
    String::from_utf8(value.to_vec())
        .map_err(|e| GreetError::Decode(format!("invalid utf-8 in member id: {}", e)))
}

fn to_array<const N: usize>(value: &[u8], tlv_type: u16) -> GreetResult<[u8; N]> {
    value.try_into().map_err(|_| {
        GreetError::Decode(format!(
            "record {:#06x} must be {} bytes, got {}",
            tlv_type,
            N,
            value.len()
        ))
    })
}

fn log_decoded(message: &GreetMessage, signature: &[u8]) {
    debug!(
        message_signature = %hex::encode(signature),
        protocol = PROTOCOL_VERSION,
        greet_type = %message.greet_type,
        from = %message.source,
        to = %message.dest,
        members = ?message.members,
        int_keys = message.int_keys.len(),
        nonces = message.nonces.len(),
        pub_keys = message.pub_keys.len(),
        session_signature = message.session_signature.is_some(),
        signing_key = message.signing_key.is_some(),
        "decoded greet message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::DhScalar;
    use crate::core_crypto::scalar_mult;

    fn upflow_message() -> GreetMessage {
        let mut msg = GreetMessage::new("1", "2", GreetType::InitInitiatorUp);
        msg.members = ["1", "2", "3", "4", "5", "6"].iter().map(|s| s.to_string()).collect();
        msg.int_keys = vec![None, Some(scalar_mult(&DhScalar::generate(), None))];
        msg.nonces = vec![[9u8; 32]];
        msg.pub_keys = vec![GreetSigningKey::generate().verifying_key().to_bytes()];
        msg.metadata = Some(GreetingMetadata::create(
            sha256(b"prevPf"),
            sha256(b"chainHash"),
            "1",
            [sha256(b"parents")],
        ));
        msg
    }

    #[test]
    fn test_upflow_round_trip() {
        let key = GreetSigningKey::generate();
        let msg = upflow_message();
        let packet = encode_packet(&msg, &key).unwrap();
        let decoded = decode_packet(&packet, &key.verifying_key()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_quit_downflow_round_trip() {
        let key = GreetSigningKey::generate();
        let mut msg = GreetMessage::new("1", "", GreetType::QuitDown);
        msg.signing_key = Some([5u8; 32]);
        let packet = encode_packet(&msg, &key).unwrap();
        let decoded = decode_packet(&packet, &key.verifying_key()).unwrap();
        assert_eq!(decoded.signing_key, Some([5u8; 32]));
        assert_eq!(decoded.dest, "");
        assert!(decoded.metadata.is_none());
    }

    #[test]
    fn test_metadata_author_must_be_source() {
        let key = GreetSigningKey::generate();
        let mut msg = upflow_message();
        msg.metadata = Some(GreetingMetadata::create(sha256(b"pf"), sha256(b"ch"), "2", []));
        assert!(matches!(encode_packet(&msg, &key), Err(GreetError::Precondition(_))));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let key = GreetSigningKey::generate();
        let other = GreetSigningKey::generate();
        let packet = encode_packet(&upflow_message(), &key).unwrap();
        assert_eq!(
            decode_packet(&packet, &other.verifying_key()).unwrap_err(),
            GreetError::SignatureInvalid("1".to_string())
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let key = GreetSigningKey::generate();
        let mut packet = encode_packet(&upflow_message(), &key).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        assert!(matches!(
            decode_packet(&packet, &key.verifying_key()),
            Err(GreetError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_wrong_protocol_version() {
        let key = GreetSigningKey::generate();
        let mut packet = encode_packet(&upflow_message(), &key).unwrap();
        // value byte of the leading version record
        packet[4] = 77;
        let err = decode_packet(&packet, &key.verifying_key()).unwrap_err();
        assert!(err.to_string().starts_with("decode failed: expected PROTOCOL_VERSION"));
        assert!(peek_packet(&packet).is_err());
    }

    #[test]
    fn test_peek_reads_header_and_metadata() {
        let key = GreetSigningKey::generate();
        let msg = upflow_message();
        let packet = encode_packet(&msg, &key).unwrap();
        let peek = peek_packet(&packet).unwrap();
        assert_eq!(peek.greet_type, GreetType::InitInitiatorUp);
        assert_eq!(peek.source, "1");
        assert_eq!(peek.members, msg.members);
        assert_eq!(peek.metadata, msg.metadata);
    }

    #[test]
    fn test_packet_id_is_hash_of_bytes() {
        let key = GreetSigningKey::generate();
        let packet = encode_packet(&upflow_message(), &key).unwrap();
        assert_eq!(packet_id(&packet), sha256(&packet));
    }
}
