//! Wire protocol.
//!
//! Every frame is one line of UTF-8 text terminated by `\n`:
//!
//! ```text
//! TAG[|field]*\n
//! ```
//!
//! Field text is escaped so that a `|` or a newline typed by a resident can
//! never be mistaken for structure:
//!
//! | raw  | escaped |
//! |------|---------|
//! | `\`  | `\\`    |
//! | `|`  | `\p`    |
//! | LF   | `\n`    |
//! | CR   | `\r`    |
//!
//! [`encode`] and [`decode`] are pure functions over a single frame.
//! [`FrameDecoder`] sits between the socket and [`decode`]: it buffers
//! partial reads and splits coalesced ones, so the caller only ever sees
//! whole frames.

use crate::errors::{FrameError, RequestError};

use std::fmt;

/// Register: `REG|name|apartment` from the client, `REG|id` as the reply.
pub const TAG_REGISTER: &str = "REG";
/// Subscribe to the chat channel.
pub const TAG_SUBSCRIBE: &str = "SUB";
/// Unsubscribe from the chat channel.
pub const TAG_UNSUBSCRIBE: &str = "USB";
/// Chat text, both directions.
pub const TAG_CHAT: &str = "MSG";
/// Weather query and weather reply.
pub const TAG_WEATHER: &str = "WTH";
/// Currency query and currency reply.
pub const TAG_CURRENCY: &str = "CUR";
/// Success reply.
pub const TAG_OK: &str = "OK";
/// Failure reply, carries a reason.
pub const TAG_ERR: &str = "ERR";
/// Unsolicited greeting sent after accept.
pub const TAG_GREETING: &str = "HEY";

const FIELD_SEPARATOR: char = '|';
const MAX_TAG_LEN: usize = 16;

/// One decoded frame: a command tag and its unescaped fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Command tag as sent, ASCII alphanumeric. Matched case-insensitively.
    pub tag: String,
    /// Unescaped argument fields.
    pub fields: Vec<String>,
}

impl Frame {
    /// Builds a frame from a tag and its fields.
    pub fn new<S: Into<String>>(tag: &str, fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            tag: tag.to_string(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a frame without fields.
    pub fn bare(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            fields: Vec::new(),
        }
    }

    /// Encodes this frame, including the trailing newline.
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.tag, &self.fields)
    }
}

/// Shows the frame as it travels on the wire, escapes included, without
/// the trailing newline.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut line = self.tag.clone();
        for field in &self.fields {
            line.push(FIELD_SEPARATOR);
            escape_into(field, &mut line);
        }
        f.write_str(&line)
    }
}

/// Encodes a tag and fields into one newline-terminated frame.
pub fn encode<S: AsRef<str>>(tag: &str, fields: &[S]) -> Vec<u8> {
    let payload_len: usize = fields.iter().map(|f| f.as_ref().len() + 1).sum();
    let mut out = String::with_capacity(tag.len() + payload_len + 1);
    out.push_str(tag);
    for field in fields {
        out.push(FIELD_SEPARATOR);
        escape_into(field.as_ref(), &mut out);
    }
    out.push('\n');
    out.into_bytes()
}

/// Decodes a single frame.
///
/// `line` is the frame body without its terminating `\n`; a trailing `\r`
/// is tolerated and dropped.
///
/// # Errors
/// Returns a [`FrameError`] when the line is empty, not UTF-8, carries an
/// invalid tag or contains a bad escape.
pub fn decode(line: &[u8]) -> Result<Frame, FrameError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
        return Err(FrameError::Empty);
    }

    let text = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
    let mut parts = text.split(FIELD_SEPARATOR);

    // split always yields at least one item
    let tag = parts.next().unwrap_or_default();
    let tag_ok = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag.bytes().all(|b| b.is_ascii_alphanumeric());
    if !tag_ok {
        return Err(FrameError::InvalidTag(tag.chars().take(MAX_TAG_LEN).collect()));
    }

    let fields = parts.map(unescape).collect::<Result<Vec<_>, _>>()?;

    Ok(Frame {
        tag: tag.to_string(),
        fields,
    })
}

fn escape_into(field: &str, out: &mut String) {
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\p"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

fn unescape(field: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('p') => out.push('|'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(FrameError::InvalidEscape(other)),
            None => return Err(FrameError::DanglingEscape),
        }
    }
    Ok(out)
}

/// Reassembles frames from arbitrary chunks of a byte stream.
///
/// Feed every chunk read from the socket to [`push`](Self::push), then
/// drain [`next_frame`](Self::next_frame) until it returns `None`. Blank
/// lines are skipped. A line longer than the limit yields one
/// [`FrameError::TooLong`] and the rest of it is discarded up to the next
/// newline.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl FrameDecoder {
    /// Creates a decoder accepting frames of at most `max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Appends freshly read bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if !self.discarding && self.buf.len() > self.max_len {
                    self.buf.clear();
                    self.discarding = true;
                    return Some(Err(FrameError::TooLong(self.max_len)));
                }
                if self.discarding {
                    self.buf.clear();
                }
                return None;
            };

            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_len {
                return Some(Err(FrameError::TooLong(self.max_len)));
            }
            if line.is_empty() || line == b"\r" {
                continue;
            }
            return Some(decode(line));
        }
    }
}

/// A client request, validated for shape but not yet for content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// `REG|name|apartment`
    Register {
        /// Raw name field.
        name: String,
        /// Raw apartment number field.
        apartment_no: String,
    },
    /// `SUB`
    Subscribe,
    /// `USB`
    Unsubscribe,
    /// `MSG|text`
    Chat(String),
    /// `WTH`
    WeatherQuery,
    /// `CUR`
    CurrencyQuery,
}

impl Request {
    /// Maps a decoded frame onto a request.
    ///
    /// # Errors
    /// [`RequestError::UnknownCommand`] for unrecognised tags and
    /// [`RequestError::Validation`] when the field count does not match.
    pub fn from_frame(frame: Frame) -> Result<Self, RequestError> {
        let arity = |expected: usize, usage: &str| {
            if frame.fields.len() == expected {
                Ok(())
            } else {
                Err(RequestError::Validation(format!("usage: {}", usage)))
            }
        };

        let tag = frame.tag.to_ascii_uppercase();
        match tag.as_str() {
            TAG_REGISTER => {
                arity(2, "REG|name|apartment")?;
                let mut fields = frame.fields.into_iter();
                Ok(Request::Register {
                    name: fields.next().unwrap_or_default(),
                    apartment_no: fields.next().unwrap_or_default(),
                })
            }
            TAG_SUBSCRIBE => arity(0, "SUB").map(|_| Request::Subscribe),
            TAG_UNSUBSCRIBE => arity(0, "USB").map(|_| Request::Unsubscribe),
            TAG_CHAT => {
                arity(1, "MSG|text")?;
                Ok(Request::Chat(frame.fields.into_iter().next().unwrap_or_default()))
            }
            TAG_WEATHER => arity(0, "WTH").map(|_| Request::WeatherQuery),
            TAG_CURRENCY => arity(0, "CUR").map(|_| Request::CurrencyQuery),
            _ => Err(RequestError::UnknownCommand(frame.to_string())),
        }
    }

    /// Encodes the request as a client would send it.
    pub fn to_frame(&self) -> Frame {
        match self {
            Request::Register { name, apartment_no } => {
                Frame::new(TAG_REGISTER, [name.as_str(), apartment_no.as_str()])
            }
            Request::Subscribe => Frame::bare(TAG_SUBSCRIBE),
            Request::Unsubscribe => Frame::bare(TAG_UNSUBSCRIBE),
            Request::Chat(text) => Frame::new(TAG_CHAT, [text.as_str()]),
            Request::WeatherQuery => Frame::bare(TAG_WEATHER),
            Request::CurrencyQuery => Frame::bare(TAG_CURRENCY),
        }
    }
}

/// A frame sent by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Unsolicited greeting.
    Greeting(String),
    /// Successful registration, carries the card id.
    Registered(String),
    /// Generic success.
    Ok,
    /// Failure with a reason.
    Err(String),
    /// Relayed chat line.
    Chat(String),
    /// Weather snapshot as JSON.
    Weather(String),
    /// Currency snapshot as JSON.
    Currency(String),
}

impl Reply {
    /// Builds the frame for this reply.
    pub fn to_frame(&self) -> Frame {
        match self {
            Reply::Greeting(text) => Frame::new(TAG_GREETING, [text.as_str()]),
            Reply::Registered(id) => Frame::new(TAG_REGISTER, [id.as_str()]),
            Reply::Ok => Frame::bare(TAG_OK),
            Reply::Err(reason) => Frame::new(TAG_ERR, [reason.as_str()]),
            Reply::Chat(line) => Frame::new(TAG_CHAT, [line.as_str()]),
            Reply::Weather(json) => Frame::new(TAG_WEATHER, [json.as_str()]),
            Reply::Currency(json) => Frame::new(TAG_CURRENCY, [json.as_str()]),
        }
    }

    /// Encodes this reply, including the trailing newline.
    pub fn encode(&self) -> Vec<u8> {
        self.to_frame().encode()
    }

    /// Interprets a frame received from the server.
    ///
    /// Returns `None` for frames a client does not understand.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let tag = frame.tag.to_ascii_uppercase();
        let mut fields = frame.fields.into_iter();
        let mut single = || match (fields.next(), fields.next()) {
            (Some(value), None) => Some(value),
            _ => None,
        };

        match tag.as_str() {
            TAG_GREETING => single().map(Reply::Greeting),
            TAG_REGISTER => single().map(Reply::Registered),
            TAG_OK => Some(Reply::Ok),
            TAG_ERR => single().map(Reply::Err),
            TAG_CHAT => single().map(Reply::Chat),
            TAG_WEATHER => single().map(Reply::Weather),
            TAG_CURRENCY => single().map(Reply::Currency),
            _ => None,
        }
    }
}

impl From<&RequestError> for Reply {
    fn from(err: &RequestError) -> Self {
        Reply::Err(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_register() {
        let frame = decode(b"REG|Ada|101").unwrap();
        assert_eq!(frame.tag, "REG");
        assert_eq!(frame.fields, vec!["Ada", "101"]);
    }

    #[test]
    fn test_decode_bare_tag_and_crlf() {
        let frame = decode(b"SUB\r").unwrap();
        assert_eq!(frame, Frame::bare("SUB"));
    }

    #[test]
    fn test_tag_is_case_insensitive() {
        assert_eq!(
            Request::from_frame(decode(b"sub").unwrap()),
            Ok(Request::Subscribe)
        );
        assert_eq!(
            Reply::from_frame(decode(b"ok").unwrap()),
            Some(Reply::Ok)
        );
    }

    #[test]
    fn test_separator_inside_chat_text_survives() {
        let text = "a|b \\ c\nnext line";
        let bytes = encode(TAG_CHAT, &[text]);

        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(bytes.iter().filter(|b| **b == b'|').count(), 1);

        let frame = decode(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(frame.fields, vec![text]);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(b""), Err(FrameError::Empty));
        assert_eq!(decode(&[0xff, 0xfe]), Err(FrameError::InvalidUtf8));
        assert_eq!(decode(b"MSG|bad\\x"), Err(FrameError::InvalidEscape('x')));
        assert_eq!(decode(b"MSG|bad\\"), Err(FrameError::DanglingEscape));
        assert!(matches!(decode(b"hello world"), Err(FrameError::InvalidTag(_))));
        assert!(matches!(decode(b"|Ada"), Err(FrameError::InvalidTag(_))));
    }

    #[test]
    fn test_decoder_reassembles_split_frames() {
        let mut decoder = FrameDecoder::new(64);
        decoder.push(b"REG|Ad");
        assert!(decoder.next_frame().is_none());

        decoder.push(b"a|101\nS");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.fields, vec!["Ada", "101"]);
        assert!(decoder.next_frame().is_none());

        decoder.push(b"UB\n");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Frame::bare("SUB"));
    }

    #[test]
    fn test_decoder_splits_coalesced_frames() {
        let mut decoder = FrameDecoder::new(64);
        decoder.push(b"SUB\n\nMSG|hi\r\nWTH\n");

        let tags: Vec<String> = std::iter::from_fn(|| decoder.next_frame())
            .map(|f| f.unwrap().tag)
            .collect();
        assert_eq!(tags, vec!["SUB", "MSG", "WTH"]);
    }

    #[test]
    fn test_decoder_discards_oversized_line_once() {
        let mut decoder = FrameDecoder::new(8);
        decoder.push(b"MSG|0123456789");
        assert_eq!(decoder.next_frame(), Some(Err(FrameError::TooLong(8))));
        assert!(decoder.next_frame().is_none());

        decoder.push(b"abcdef\nSUB\n");
        assert_eq!(decoder.next_frame(), Some(Ok(Frame::bare("SUB"))));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_decoder_rejects_long_complete_line() {
        let mut decoder = FrameDecoder::new(4);
        decoder.push(b"MSG|hello\nOK\n");
        assert_eq!(decoder.next_frame(), Some(Err(FrameError::TooLong(4))));
        assert_eq!(decoder.next_frame(), Some(Ok(Frame::bare("OK"))));
    }

    #[test]
    fn test_request_from_frame() {
        let req = Request::from_frame(decode(b"REG|Ada|101").unwrap()).unwrap();
        assert_eq!(
            req,
            Request::Register {
                name: "Ada".into(),
                apartment_no: "101".into()
            }
        );
        assert_eq!(
            Request::from_frame(decode(b"MSG|hello").unwrap()).unwrap(),
            Request::Chat("hello".into())
        );
    }

    #[test]
    fn test_request_arity_and_unknown() {
        assert!(matches!(
            Request::from_frame(decode(b"REG|Ada").unwrap()),
            Err(RequestError::Validation(_))
        ));
        assert!(matches!(
            Request::from_frame(decode(b"SUB|now").unwrap()),
            Err(RequestError::Validation(_))
        ));
        assert_eq!(
            Request::from_frame(decode(b"PING|x").unwrap()),
            Err(RequestError::UnknownCommand("PING|x".into()))
        );
    }

    #[test]
    fn test_unknown_command_echoes_line_as_sent() {
        assert_eq!(
            Request::from_frame(decode(b"foo|a\\pb|c\\\\d\r").unwrap()),
            Err(RequestError::UnknownCommand("foo|a\\pb|c\\\\d".into()))
        );
    }

    #[test]
    fn test_reply_frames() {
        assert_eq!(Reply::Registered("Ada_101".into()).encode(), b"REG|Ada_101\n");
        assert_eq!(Reply::Ok.encode(), b"OK\n");
        assert_eq!(
            Reply::from(&RequestError::NotRegistered).encode(),
            b"ERR|not registered\n"
        );
    }

    #[test]
    fn test_reply_from_frame() {
        let frame = decode(b"MSG|[10:00:00][101] Ada: hi \\p there").unwrap();
        assert_eq!(
            Reply::from_frame(frame),
            Some(Reply::Chat("[10:00:00][101] Ada: hi | there".into()))
        );
        assert_eq!(Reply::from_frame(Frame::bare("ZZZ")), None);
        assert_eq!(Reply::from_frame(Frame::bare("ERR")), None);
    }
}
