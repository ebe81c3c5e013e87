use bytes::Bytes;

use crate::codec::cursor::ReadCursor;
use crate::error::ProtocolError;
use crate::util::buf_ext::BufExt;

/// A decoded (and decrypted) DATA packet as it is handed to application code
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivablePacket {
    pub protocol_code: i16,
    pub command_id: Option<i64>,
    pub body: Bytes,
}

impl ReceivablePacket {
    /// Parses the part of a DATA frame that follows the body length, i.e. protocol code, command
    ///  id (in data transfer mode) and body
    pub fn parse(mut payload: Bytes, data_transfer: bool) -> Result<ReceivablePacket, ProtocolError> {
        let protocol_code = payload.try_get_i16_le()
            .map_err(|_| ProtocolError::Malformed("packet too short for protocol code".to_string()))?;

        let command_id = if data_transfer {
            Some(payload.try_get_i64_le()
                .map_err(|_| ProtocolError::Malformed("packet too short for command id".to_string()))?)
        }
        else {
            None
        };

        Ok(ReceivablePacket {
            protocol_code,
            command_id,
            body: payload,
        })
    }

    pub fn cursor(&self) -> ReadCursor {
        ReadCursor::new(self.body.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain(vec![7,0, 1,2], false, Ok((7, None, vec![1,2])))]
    #[case::empty_body(vec![1,1], false, Ok((0x101, None, vec![])))]
    #[case::command_id(vec![7,0, 3,0,0,0,0,0,0,0, 9], true, Ok((7, Some(3), vec![9])))]
    #[case::too_short(vec![7], false, Err(()))]
    #[case::no_command_id(vec![7,0, 1,2], true, Err(()))]
    fn test_parse(#[case] raw: Vec<u8>, #[case] data_transfer: bool, #[case] expected: Result<(i16, Option<i64>, Vec<u8>), ()>) {
        let parsed = ReceivablePacket::parse(Bytes::from(raw), data_transfer);
        match expected {
            Ok((protocol_code, command_id, body)) => {
                let parsed = parsed.unwrap();
                assert_eq!(parsed.protocol_code, protocol_code);
                assert_eq!(parsed.command_id, command_id);
                assert_eq!(parsed.body.as_ref(), body.as_slice());
            }
            Err(_) => {
                assert!(matches!(parsed, Err(ProtocolError::Malformed(_))));
            }
        }
    }

    #[test]
    fn test_cursor() {
        let packet = ReceivablePacket::parse(Bytes::from_static(&[1,0, 5,0,0,0]), false).unwrap();
        assert_eq!(packet.cursor().read_i32(), Ok(5));
        // every cursor starts at the beginning of the body
        assert_eq!(packet.cursor().read_u8(), Ok(5));
    }
}
