use crate::error::ProtocolError;

/// Maximum length of a `shell_id` on the wire, in bytes.
pub const MAX_SHELL_ID_LEN: usize = 255;

/// Encode a binary frame: `uint8 shell_id_len | shell_id | payload`.
///
/// `payload` is uninterpreted bytes - raw PTY output going to browsers, or
/// raw keystrokes going to the agent.
pub fn encode_binary(shell_id: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let id_bytes = shell_id.as_bytes();
    if id_bytes.len() > MAX_SHELL_ID_LEN {
        return Err(ProtocolError::ShellIdTooLong(id_bytes.len()));
    }

    let mut frame = Vec::with_capacity(1 + id_bytes.len() + payload.len());
    frame.push(id_bytes.len() as u8);
    frame.extend_from_slice(id_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a binary frame into `(shell_id, payload)`.
///
/// Rejects frames whose declared length overruns the buffer and frames
/// whose `shell_id` bytes are not valid UTF-8, both as `INVALID_MESSAGE`.
pub fn decode_binary(frame: &[u8]) -> Result<(String, &[u8]), ProtocolError> {
    let Some((&len_byte, rest)) = frame.split_first() else {
        return Err(ProtocolError::InvalidBinaryFrame { reason: "empty frame" });
    };

    let id_len = len_byte as usize;
    if rest.len() < id_len {
        return Err(ProtocolError::InvalidBinaryFrame {
            reason: "declared shell_id length exceeds frame size",
        });
    }

    let (id_bytes, payload) = rest.split_at(id_len);
    let shell_id = std::str::from_utf8(id_bytes)
        .map_err(|_| ProtocolError::InvalidBinaryFrame { reason: "shell_id is not valid UTF-8" })?
        .to_string();

    Ok((shell_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_arbitrary_shell_id_and_payload() {
        let (id, payload) = ("sh1", b"AB\r\n".as_slice());
        let frame = encode_binary(id, payload).unwrap();
        let (decoded_id, decoded_payload) = decode_binary(&frame).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn empty_payload_is_accepted() {
        let frame = encode_binary("sh1", &[]).unwrap();
        let (id, payload) = decode_binary(&frame).unwrap();
        assert_eq!(id, "sh1");
        assert!(payload.is_empty());
    }

    #[test]
    fn shell_id_at_255_bytes_is_accepted() {
        let id = "a".repeat(255);
        let frame = encode_binary(&id, b"x").unwrap();
        let (decoded, payload) = decode_binary(&frame).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(payload, b"x");
    }

    #[test]
    fn shell_id_at_256_bytes_is_rejected_by_encoder() {
        let id = "a".repeat(256);
        let err = encode_binary(&id, b"x").unwrap_err();
        assert!(matches!(err, ProtocolError::ShellIdTooLong(256)));
    }

    #[test]
    fn decode_rejects_length_overrun() {
        // Declares a 10-byte shell_id but only supplies 2.
        let frame = vec![10, b'a', b'b'];
        let err = decode_binary(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidBinaryFrame { .. }));
    }

    #[test]
    fn decode_rejects_non_utf8_shell_id() {
        let frame = vec![2, 0xff, 0xfe, b'x'];
        let err = decode_binary(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidBinaryFrame { .. }));
    }

    #[test]
    fn decode_rejects_empty_frame() {
        let err = decode_binary(&[]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidBinaryFrame { .. }));
    }
}
