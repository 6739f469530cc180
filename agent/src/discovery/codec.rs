use common::{DiscoveryError, Message, MessageKind, Result, MAX_DATAGRAM_SIZE};

/// Serializes a message into a datagram payload.
///
/// Payloads over the datagram budget are rejected here since the receive
/// side reads at most `MAX_DATAGRAM_SIZE` bytes and would see them truncated.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(DiscoveryError::SerializationError(format!(
            "{} message for '{}' is {} bytes, budget is {}",
            message.kind,
            message.service,
            payload.len(),
            MAX_DATAGRAM_SIZE
        )));
    }
    Ok(payload)
}

/// Parses a received datagram. Never panics on hostile input.
pub fn decode(payload: &[u8]) -> Result<Message> {
    let message: Message = serde_json::from_slice(payload)
        .map_err(|e| DiscoveryError::DecodeError(e.to_string()))?;

    match message.kind {
        MessageKind::Announce | MessageKind::Retract if message.reply.is_none() => {
            Err(DiscoveryError::DecodeError(format!(
                "{} for '{}' carries no reply address",
                message.kind, message.service
            )))
        }
        _ => Ok(message),
    }
}
