//! RESP2 framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::BusError;

/// Largest bulk string accepted from the server (Redis' own limit).
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// One RESP2 value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RespFrame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR ...\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`, or `$-1\r\n` for nil.
    Bulk(Option<Bytes>),
    /// `*2\r\n...`, or `*-1\r\n` for nil.
    Array(Option<Vec<RespFrame>>),
}

impl RespFrame {
    /// A command: an array of bulk strings.
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self::Array(Some(
            parts.into_iter().map(|p| Self::Bulk(Some(p.into()))).collect(),
        ))
    }

    /// Bytes of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bulk(Some(b)) => Some(b),
            Self::Simple(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// UTF-8 text of a bulk or simple string.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Encodes [`RespFrame`]s and decodes them from a byte stream.
#[derive(Debug, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespFrame;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespFrame>, BusError> {
        match parse(src, 0)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespFrame> for RespCodec {
    type Error = BusError;

    fn encode(&mut self, frame: RespFrame, dst: &mut BytesMut) -> Result<(), BusError> {
        write_frame(&frame, dst);
        Ok(())
    }
}

fn write_frame(frame: &RespFrame, dst: &mut BytesMut) {
    match frame {
        RespFrame::Simple(s) => write_line(dst, b'+', s.as_bytes()),
        RespFrame::Error(s) => write_line(dst, b'-', s.as_bytes()),
        RespFrame::Integer(n) => write_line(dst, b':', n.to_string().as_bytes()),
        RespFrame::Bulk(None) => dst.put_slice(b"$-1\r\n"),
        RespFrame::Bulk(Some(data)) => {
            write_line(dst, b'$', data.len().to_string().as_bytes());
            dst.put_slice(data);
            dst.put_slice(b"\r\n");
        }
        RespFrame::Array(None) => dst.put_slice(b"*-1\r\n"),
        RespFrame::Array(Some(items)) => {
            write_line(dst, b'*', items.len().to_string().as_bytes());
            for item in items {
                write_frame(item, dst);
            }
        }
    }
}

fn write_line(dst: &mut BytesMut, kind: u8, body: &[u8]) {
    dst.reserve(body.len() + 3);
    dst.put_u8(kind);
    dst.put_slice(body);
    dst.put_slice(b"\r\n");
}

/// Parse one frame starting at `pos`. `None` means more input is needed.
fn parse(buf: &[u8], pos: usize) -> Result<Option<(RespFrame, usize)>, BusError> {
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    let frame = match kind {
        b'+' => RespFrame::Simple(utf8(line)?),
        b'-' => RespFrame::Error(utf8(line)?),
        b':' => RespFrame::Integer(integer(line)?),
        b'$' => {
            let len = integer(line)?;
            if len < 0 {
                return Ok(Some((RespFrame::Bulk(None), next)));
            }
            let len = usize::try_from(len).map_err(|_| protocol("bulk length overflow"))?;
            if len > MAX_BULK_LEN {
                return Err(protocol(format!("bulk string of {len} bytes exceeds limit")));
            }
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(protocol("bulk string not terminated by CRLF"));
            }
            return Ok(Some((
                RespFrame::Bulk(Some(Bytes::copy_from_slice(&buf[next..end]))),
                end + 2,
            )));
        }
        b'*' => {
            let count = integer(line)?;
            if count < 0 {
                return Ok(Some((RespFrame::Array(None), next)));
            }
            let count = usize::try_from(count).map_err(|_| protocol("array length overflow"))?;
            let mut items = Vec::with_capacity(count.min(1024));
            let mut cursor = next;
            for _ in 0..count {
                match parse(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            return Ok(Some((RespFrame::Array(Some(items)), cursor)));
        }
        other => return Err(protocol(format!("unexpected type byte 0x{other:02x}"))),
    };
    Ok(Some((frame, next)))
}

/// The line starting at `start` (without CRLF) and the index just past its CRLF.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], start + end + 2))
}

fn utf8(line: &[u8]) -> Result<String, BusError> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|_| protocol("non UTF-8 status line"))
}

fn integer(line: &[u8]) -> Result<i64, BusError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| protocol(format!("invalid integer {:?}", String::from_utf8_lossy(line))))
}

fn protocol(msg: impl Into<String>) -> BusError {
    BusError::Protocol(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn decode_all(input: &[u8]) -> Vec<RespFrame> {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty(), "trailing bytes: {buf:?}");
        frames
    }

    #[test]
    fn encodes_command() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(RespFrame::command(["PUBLISH", "/to/user/u1", "hello"]), &mut buf)
            .unwrap();
        assert_eq!(
            &buf[..],
            b"*3\r\n$7\r\nPUBLISH\r\n$11\r\n/to/user/u1\r\n$5\r\nhello\r\n"
        );
    }

    #[test]
    fn decodes_scalars() {
        let frames = decode_all(b"+OK\r\n-ERR bad\r\n:3\r\n$-1\r\n");
        assert_eq!(
            frames,
            vec![
                RespFrame::Simple("OK".into()),
                RespFrame::Error("ERR bad".into()),
                RespFrame::Integer(3),
                RespFrame::Bulk(None),
            ]
        );
    }

    #[test]
    fn decodes_pmessage_push() {
        let frames = decode_all(
            b"*4\r\n$8\r\npmessage\r\n$10\r\n/to/user/*\r\n$11\r\n/to/user/u1\r\n$2\r\nhi\r\n",
        );
        let RespFrame::Array(Some(items)) = &frames[0] else {
            panic!("expected array, got {frames:?}");
        };
        assert_eq!(items[0].as_str(), Some("pmessage"));
        assert_eq!(items[2].as_str(), Some("/to/user/u1"));
        assert_eq!(items[3].as_bytes(), Some(&b"hi"[..]));
    }

    #[test]
    fn bulk_may_contain_crlf() {
        let frames = decode_all(b"$4\r\na\r\nb\r\n");
        assert_eq!(frames, vec![RespFrame::Bulk(Some(Bytes::from_static(b"a\r\nb")))]);
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut codec = RespCodec;
        let full = b"*3\r\n$7\r\nmessage\r\n$1\r\nt\r\n$5\r\nhello\r\n";
        for split in 1..full.len() {
            let mut buf = BytesMut::from(&full[..split]);
            assert_eq!(codec.decode(&mut buf).unwrap(), None, "split at {split}");
            assert_eq!(buf.len(), split, "nothing consumed on partial input");
            buf.extend_from_slice(&full[split..]);
            assert!(codec.decode(&mut buf).unwrap().is_some());
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn unknown_type_byte_is_protocol_error() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"!oops\r\n"[..]);
        assert_matches!(codec.decode(&mut buf), Err(BusError::Protocol(_)));
    }

    #[test]
    fn unterminated_bulk_is_protocol_error() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$2\r\nabXY"[..]);
        assert_matches!(codec.decode(&mut buf), Err(BusError::Protocol(_)));
    }

    #[test]
    fn bad_integer_is_protocol_error() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b":12a\r\n"[..]);
        assert_matches!(codec.decode(&mut buf), Err(BusError::Protocol(_)));
    }
}
