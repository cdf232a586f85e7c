//! The wire boundary between a bot's socket and the session handler (C6).
//! Framing and field-level encoding of the upstream session-manager
//! protocol are out of scope; `SessionCodec` is the seam a real codec
//! plugs into, matching how `neutronium::net::frame` separates framing
//! from the application's own message interpretation.

use crate::model::Item;
use inspectgw_common::error::GwResult;

/// A decoded unit of session-manager traffic, matching the message classes
/// dispatched in §4.6.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    EncryptionRequest { nonce: Vec<u8> },

    LoginOk {
        refresh_token: Option<String>,
        heartbeat_interval_secs: i32,
    },
    LoginFailed(LoginFailure),

    FreeLicenseResponse,
    GameConnectTokens,

    /// A batching frame wrapping zero or more inner messages (§4.6's
    /// "message batching frame", recursively dispatched).
    Batch(Vec<SessionMessage>),

    LoggedOff { min_reconnect_secs: i32 },

    /// A frame addressed to the game coordinator rather than the session
    /// manager proper.
    GcFrame(GcMessage),

    /// Anything the handler doesn't recognize — logged and dropped per
    /// §4.6's final bullet.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    Expired,
    TryAnotherCm,
    Other,
}

#[derive(Debug, Clone)]
pub enum GcMessage {
    ClientWelcome,
    InspectionResponse(InspectionResult),
    Other,
}

/// One resolved item as reported by the upstream inspection response,
/// ready to be merged into the correlation table's `Item` record.
#[derive(Debug, Clone)]
pub struct InspectionResult {
    pub asset: u64,
    pub wear: Option<f32>,
    pub seed: Option<u16>,
    pub stickers: Vec<crate::model::Sticker>,
    pub keychain: Option<crate::model::Keychain>,
}

/// Encodes and decodes session-manager frames over a bot's socket.
/// Implementors own the actual wire format; this crate only needs to be
/// able to ask for the handful of outbound messages the handler issues
/// and to receive decoded inbound messages back.
pub trait SessionCodec: Send {
    /// Attempts to decode one complete frame from `buf`, returning the
    /// message and how many bytes it consumed. Returns `Ok(None)` if `buf`
    /// doesn't yet hold a complete frame.
    fn decode(&mut self, buf: &[u8]) -> GwResult<Option<(SessionMessage, usize)>>;

    fn encode_encryption_result(&mut self) -> Vec<u8>;
    fn encode_login(&mut self, account_name: &str, password: &str, code: Option<&str>, refresh_token: Option<&str>) -> Vec<u8>;
    fn encode_free_license_request(&mut self) -> Vec<u8>;
    fn encode_set_games_played(&mut self, game_id: u64) -> Vec<u8>;
    fn encode_client_hello(&mut self, client_version: u32) -> Vec<u8>;
    fn encode_heartbeat(&mut self) -> Vec<u8>;
    fn encode_inspect_request(&mut self, items: &[Item]) -> Vec<u8>;
}

mod default_codec {
    use super::{GcMessage, InspectionResult, LoginFailure, SessionMessage};
    use crate::model::{Item, Keychain, Sticker};
    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
    use inspectgw_common::error::{FaultKind, GwError, GwResult};
    use std::io::Cursor;

    const TAG_ENCRYPTION_REQUEST: u8 = 0x01;
    const TAG_ENCRYPTION_RESULT: u8 = 0x02;
    const TAG_LOGIN_REQUEST: u8 = 0x03;
    const TAG_LOGIN_OK: u8 = 0x04;
    const TAG_LOGIN_FAILED: u8 = 0x05;
    const TAG_FREE_LICENSE_RESPONSE: u8 = 0x06;
    const TAG_SET_GAMES_PLAYED: u8 = 0x07;
    const TAG_GAME_CONNECT_TOKENS: u8 = 0x08;
    const TAG_CLIENT_HELLO: u8 = 0x09;
    const TAG_BATCH: u8 = 0x0A;
    const TAG_LOGGED_OFF: u8 = 0x0B;
    const TAG_HEARTBEAT: u8 = 0x0C;
    const TAG_GC_CLIENT_WELCOME: u8 = 0x0D;
    const TAG_GC_INSPECTION_RESPONSE: u8 = 0x0E;
    const TAG_INSPECT_REQUEST: u8 = 0x0F;
    const TAG_FREE_LICENSE_REQUEST: u8 = 0x10;

    /// A self-contained length-framed wire format: `[u32 frame_len LE][tag
    /// u8][payload]`, `frame_len` covering the tag byte and payload. Good
    /// enough to run the gateway standalone and exercise it end-to-end
    /// against an in-memory peer; the real upstream session-manager wire
    /// format is out of scope (§10.5).
    pub struct DefaultSessionCodec;

    impl DefaultSessionCodec {
        pub fn new() -> DefaultSessionCodec {
            DefaultSessionCodec
        }
    }

    impl Default for DefaultSessionCodec {
        fn default() -> DefaultSessionCodec {
            DefaultSessionCodec::new()
        }
    }

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + payload.len());
        out.write_u32::<LittleEndian>((payload.len() + 1) as u32).unwrap();
        out.push(tag);
        out.extend_from_slice(payload);
        out
    }

    fn write_string(out: &mut Vec<u8>, s: &str) {
        out.write_u16::<LittleEndian>(s.len() as u16).unwrap();
        out.extend_from_slice(s.as_bytes());
    }

    fn write_option_string(out: &mut Vec<u8>, s: Option<&str>) {
        match s {
            Some(s) => {
                out.push(1);
                write_string(out, s);
            }
            None => out.push(0),
        }
    }

    fn read_string(cursor: &mut Cursor<&[u8]>) -> GwResult<String> {
        let len = cursor.read_u16::<LittleEndian>().map_err(frame_err)? as usize;
        let start = cursor.position() as usize;
        let bytes = cursor.get_ref();
        if start + len > bytes.len() {
            return Err(GwError::fatal(FaultKind::Protocol, "truncated string in frame"));
        }
        let s = String::from_utf8_lossy(&bytes[start..start + len]).into_owned();
        cursor.set_position((start + len) as u64);
        Ok(s)
    }

    fn read_option_string(cursor: &mut Cursor<&[u8]>) -> GwResult<Option<String>> {
        match cursor.read_u8().map_err(frame_err)? {
            0 => Ok(None),
            _ => Ok(Some(read_string(cursor)?)),
        }
    }

    fn frame_err(_: std::io::Error) -> GwError {
        GwError::fatal(FaultKind::Protocol, "truncated frame")
    }

    /// Decodes one frame from `buf`. Shared between the top-level call and
    /// the recursive unpacking of a batch's inner frames.
    fn decode_frame(buf: &[u8]) -> GwResult<Option<(SessionMessage, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        let total = 4 + len;
        if buf.len() < total {
            return Ok(None);
        }
        if len == 0 {
            return Err(GwError::fatal(FaultKind::Protocol, "empty frame has no tag"));
        }
        let tag = buf[4];
        let payload = &buf[5..total];

        let message = match tag {
            TAG_ENCRYPTION_REQUEST => SessionMessage::EncryptionRequest { nonce: payload.to_vec() },
            TAG_LOGIN_OK => {
                let mut cursor = Cursor::new(payload);
                let refresh_token = read_option_string(&mut cursor)?;
                let heartbeat_interval_secs = cursor.read_i32::<LittleEndian>().map_err(frame_err)?;
                SessionMessage::LoginOk { refresh_token, heartbeat_interval_secs }
            }
            TAG_LOGIN_FAILED => {
                let failure = match payload.first() {
                    Some(0) => LoginFailure::Expired,
                    Some(1) => LoginFailure::TryAnotherCm,
                    _ => LoginFailure::Other,
                };
                SessionMessage::LoginFailed(failure)
            }
            TAG_FREE_LICENSE_RESPONSE => SessionMessage::FreeLicenseResponse,
            TAG_GAME_CONNECT_TOKENS => SessionMessage::GameConnectTokens,
            TAG_BATCH => SessionMessage::Batch(decode_batch(payload)?),
            TAG_LOGGED_OFF => {
                let mut cursor = Cursor::new(payload);
                let min_reconnect_secs = cursor.read_i32::<LittleEndian>().map_err(frame_err)?;
                SessionMessage::LoggedOff { min_reconnect_secs }
            }
            TAG_GC_CLIENT_WELCOME => SessionMessage::GcFrame(GcMessage::ClientWelcome),
            TAG_GC_INSPECTION_RESPONSE => SessionMessage::GcFrame(GcMessage::InspectionResponse(decode_inspection_result(payload)?)),
            _ => SessionMessage::Unknown,
        };
        Ok(Some((message, total)))
    }

    fn decode_batch(payload: &[u8]) -> GwResult<Vec<SessionMessage>> {
        let mut cursor = Cursor::new(payload);
        let count = cursor.read_u16::<LittleEndian>().map_err(frame_err)?;
        let mut inner = Vec::with_capacity(count as usize);
        let mut remaining = &payload[cursor.position() as usize..];
        for _ in 0..count {
            match decode_frame(remaining)? {
                Some((message, consumed)) => {
                    inner.push(message);
                    remaining = &remaining[consumed..];
                }
                None => return Err(GwError::fatal(FaultKind::Protocol, "batch frame truncated its inner messages")),
            }
        }
        Ok(inner)
    }

    fn decode_inspection_result(payload: &[u8]) -> GwResult<InspectionResult> {
        let mut cursor = Cursor::new(payload);
        let asset = cursor.read_u64::<LittleEndian>().map_err(frame_err)?;

        let wear = match cursor.read_u8().map_err(frame_err)? {
            0 => None,
            _ => Some(cursor.read_f32::<LittleEndian>().map_err(frame_err)?),
        };
        let seed = match cursor.read_u8().map_err(frame_err)? {
            0 => None,
            _ => Some(cursor.read_u16::<LittleEndian>().map_err(frame_err)?),
        };

        let sticker_count = cursor.read_u16::<LittleEndian>().map_err(frame_err)?;
        let mut stickers = Vec::with_capacity(sticker_count as usize);
        for _ in 0..sticker_count {
            let id = cursor.read_u32::<LittleEndian>().map_err(frame_err)?;
            let wear = match cursor.read_u8().map_err(frame_err)? {
                0 => None,
                _ => Some(cursor.read_f32::<LittleEndian>().map_err(frame_err)?),
            };
            let x = match cursor.read_u8().map_err(frame_err)? {
                0 => None,
                _ => Some(cursor.read_f32::<LittleEndian>().map_err(frame_err)?),
            };
            let y = match cursor.read_u8().map_err(frame_err)? {
                0 => None,
                _ => Some(cursor.read_f32::<LittleEndian>().map_err(frame_err)?),
            };
            stickers.push(Sticker { id, wear, x, y });
        }

        let keychain = match cursor.read_u8().map_err(frame_err)? {
            0 => None,
            _ => Some(Keychain {
                id: cursor.read_u32::<LittleEndian>().map_err(frame_err)?,
                pattern: cursor.read_u32::<LittleEndian>().map_err(frame_err)?,
                x: cursor.read_f32::<LittleEndian>().map_err(frame_err)?,
                y: cursor.read_f32::<LittleEndian>().map_err(frame_err)?,
                z: cursor.read_f32::<LittleEndian>().map_err(frame_err)?,
            }),
        };

        Ok(InspectionResult { asset, wear, seed, stickers, keychain })
    }

    impl super::SessionCodec for DefaultSessionCodec {
        fn decode(&mut self, buf: &[u8]) -> GwResult<Option<(SessionMessage, usize)>> {
            decode_frame(buf)
        }

        fn encode_encryption_result(&mut self) -> Vec<u8> {
            frame(TAG_ENCRYPTION_RESULT, &[])
        }

        fn encode_login(&mut self, account_name: &str, password: &str, code: Option<&str>, refresh_token: Option<&str>) -> Vec<u8> {
            let mut payload = Vec::new();
            write_string(&mut payload, account_name);
            write_string(&mut payload, password);
            write_option_string(&mut payload, code);
            write_option_string(&mut payload, refresh_token);
            frame(TAG_LOGIN_REQUEST, &payload)
        }

        fn encode_free_license_request(&mut self) -> Vec<u8> {
            frame(TAG_FREE_LICENSE_REQUEST, &[])
        }

        fn encode_set_games_played(&mut self, game_id: u64) -> Vec<u8> {
            let mut payload = Vec::new();
            payload.write_u64::<LittleEndian>(game_id).unwrap();
            frame(TAG_SET_GAMES_PLAYED, &payload)
        }

        fn encode_client_hello(&mut self, client_version: u32) -> Vec<u8> {
            let mut payload = Vec::new();
            payload.write_u32::<LittleEndian>(client_version).unwrap();
            frame(TAG_CLIENT_HELLO, &payload)
        }

        fn encode_heartbeat(&mut self) -> Vec<u8> {
            frame(TAG_HEARTBEAT, &[])
        }

        fn encode_inspect_request(&mut self, items: &[Item]) -> Vec<u8> {
            let mut payload = Vec::new();
            payload.write_u16::<LittleEndian>(items.len() as u16).unwrap();
            for item in items {
                payload.write_u64::<LittleEndian>(item.scope).unwrap();
                payload.write_u64::<LittleEndian>(item.asset).unwrap();
                payload.write_u64::<LittleEndian>(item.owner).unwrap();
                payload.write_u64::<LittleEndian>(item.moniker).unwrap();
            }
            frame(TAG_INSPECT_REQUEST, &payload)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::net::codec::SessionCodec;

        #[test]
        fn decode_reports_incomplete_frame_as_none() {
            let mut codec = DefaultSessionCodec::new();
            let partial = frame(TAG_HEARTBEAT, &[]);
            assert!(codec.decode(&partial[..2]).unwrap().is_none());
        }

        #[test]
        fn decode_login_ok_reads_token_and_interval() {
            let mut payload = Vec::new();
            write_option_string(&mut payload, Some("refresh-token"));
            payload.write_i32::<LittleEndian>(9).unwrap();
            let bytes = frame(TAG_LOGIN_OK, &payload);

            let mut codec = DefaultSessionCodec::new();
            let (message, consumed) = codec.decode(&bytes).unwrap().unwrap();
            assert_eq!(consumed, bytes.len());
            match message {
                SessionMessage::LoginOk { refresh_token, heartbeat_interval_secs } => {
                    assert_eq!(refresh_token.as_deref(), Some("refresh-token"));
                    assert_eq!(heartbeat_interval_secs, 9);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }

        #[test]
        fn decode_batch_unpacks_inner_messages_in_order() {
            let inner_a = frame(TAG_FREE_LICENSE_RESPONSE, &[]);
            let inner_b = frame(TAG_GAME_CONNECT_TOKENS, &[]);
            let mut payload = Vec::new();
            payload.write_u16::<LittleEndian>(2).unwrap();
            payload.extend_from_slice(&inner_a);
            payload.extend_from_slice(&inner_b);
            let bytes = frame(TAG_BATCH, &payload);

            let mut codec = DefaultSessionCodec::new();
            let (message, _consumed) = codec.decode(&bytes).unwrap().unwrap();
            match message {
                SessionMessage::Batch(inner) => {
                    assert_eq!(inner.len(), 2);
                    assert!(matches!(inner[0], SessionMessage::FreeLicenseResponse));
                    assert!(matches!(inner[1], SessionMessage::GameConnectTokens));
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }

        #[test]
        fn decode_unknown_tag_falls_back_without_erroring() {
            let bytes = frame(0xEE, &[1, 2, 3]);
            let mut codec = DefaultSessionCodec::new();
            let (message, _consumed) = codec.decode(&bytes).unwrap().unwrap();
            assert!(matches!(message, SessionMessage::Unknown));
        }

        #[test]
        fn encode_inspect_request_round_trips_item_count() {
            let mut codec = DefaultSessionCodec::new();
            let items = vec![Item::new(0, 1, 2, 3), Item::new(0, 4, 5, 6)];
            let bytes = codec.encode_inspect_request(&items);
            assert_eq!(LittleEndian::read_u32(&bytes[0..4]) as usize + 4, bytes.len());
            assert_eq!(bytes[4], TAG_INSPECT_REQUEST);
        }
    }
}

pub use default_codec::DefaultSessionCodec;
