// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use std::string::FromUtf8Error;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    /// Invalid message encoding.
    #[error("{0}")]
    Invalid(String),
}

/// A single RESP value, covering both protocol revisions. RESP2 servers only
/// ever produce the first six variants; the rest appear once `HELLO 3`
/// succeeds.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
    Double(f64),
    Boolean(bool),
    BigNumber(String),
    Verbatim {
        format: String,
        content: Bytes,
    },
    // Keys are not required to be unique on the wire; `into_map` applies
    // duplicate-last-wins.
    Map(Vec<(Frame, Frame)>),
    Set(Vec<Frame>),
    Push(Vec<Frame>),
    Attribute {
        attributes: Vec<(Frame, Frame)>,
        value: Box<Frame>,
    },
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Parses one complete frame from `src`, leaving the cursor just past it.
    ///
    /// Returns `Error::Incomplete` when the buffer ends mid-frame; the caller
    /// re-parses from the frame start once more bytes arrive, so only whole
    /// top-level values are ever produced.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                let bytes = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes)?;
                Ok(Frame::Simple(string))
            }
            DataType::SimpleError => {
                let bytes = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes)?;
                Ok(Frame::Error(string))
            }
            DataType::Integer => {
                let integer = parse_int(get_line(src)?)?;
                Ok(Frame::Integer(integer))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => match get_length(src)? {
                None => Ok(Frame::Null),
                // A bulk payload may itself contain CRLF, so the length
                // prefix is authoritative: exactly `length` bytes, then a
                // terminator.
                Some(length) => {
                    let data = get_exact(src, length)?;
                    Ok(Frame::Bulk(Bytes::copy_from_slice(data)))
                }
            },
            // !<length>\r\n<error>\r\n
            DataType::BulkError => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => {
                    let msg = get_exact(src, length)?.to_vec();
                    let msg = String::from_utf8(msg)?;
                    Ok(Frame::Error(msg))
                }
            },
            // =<length>\r\n<3-byte format>:<content>\r\n
            DataType::VerbatimString => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => {
                    let payload = get_exact(src, length)?;
                    if length < 4 || payload[3] != b':' {
                        return Err(Error::Invalid(
                            "verbatim string is missing its format tag".to_string(),
                        ));
                    }
                    let format = String::from_utf8(payload[..3].to_vec())?;
                    let content = Bytes::copy_from_slice(&payload[4..]);
                    Ok(Frame::Verbatim { format, content })
                }
            },
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => Ok(Frame::Array(parse_elements(src, length)?)),
            },
            DataType::Set => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => Ok(Frame::Set(parse_elements(src, length)?)),
            },
            DataType::Push => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => Ok(Frame::Push(parse_elements(src, length)?)),
            },
            // %<number-of-pairs>\r\n<key-1><value-1>...
            DataType::Map => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => Ok(Frame::Map(parse_pairs(src, length)?)),
            },
            // |<number-of-pairs>\r\n<pairs...><value>, metadata attached to
            // the value that follows it.
            DataType::Attribute => match get_length(src)? {
                None => Err(Error::Invalid(
                    "attribute length cannot be nil".to_string(),
                )),
                Some(length) => {
                    let attributes = parse_pairs(src, length)?;
                    let value = Box::new(Self::parse(src)?);
                    Ok(Frame::Attribute { attributes, value })
                }
            },
            DataType::Null => {
                // Advance the cursor to the end of the frame.
                let _ = get_line(src)?;
                Ok(Frame::Null)
            }
            DataType::Boolean => match get_line(src)? {
                b"t" => Ok(Frame::Boolean(true)),
                b"f" => Ok(Frame::Boolean(false)),
                other => Err(Error::Invalid(format!(
                    "invalid boolean payload: {:?}",
                    String::from_utf8_lossy(other)
                ))),
            },
            DataType::Double => {
                let double = parse_double(get_line(src)?)?;
                Ok(Frame::Double(double))
            }
            DataType::BigNumber => {
                let bytes = get_line(src)?;
                let text = String::from_utf8(bytes.to_vec())?;
                let digits = text.strip_prefix(['+', '-']).unwrap_or(&text);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::Invalid(format!("invalid big number: {:?}", text)));
                }
                Ok(Frame::BigNumber(text))
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    fn write_to(&self, bytes: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => write_line(bytes, DataType::SimpleString, s.as_bytes()),
            Frame::Error(s) => write_line(bytes, DataType::SimpleError, s.as_bytes()),
            Frame::Integer(i) => write_line(bytes, DataType::Integer, i.to_string().as_bytes()),
            Frame::Bulk(data) => {
                write_line(bytes, DataType::BulkString, data.len().to_string().as_bytes());
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
            }
            Frame::Null => write_line(bytes, DataType::Null, b""),
            Frame::Boolean(b) => write_line(bytes, DataType::Boolean, if *b { b"t" } else { b"f" }),
            Frame::Double(d) => write_line(bytes, DataType::Double, format_double(*d).as_bytes()),
            Frame::BigNumber(n) => write_line(bytes, DataType::BigNumber, n.as_bytes()),
            Frame::Verbatim { format, content } => {
                let length = format.len() + 1 + content.len();
                write_line(bytes, DataType::VerbatimString, length.to_string().as_bytes());
                bytes.extend_from_slice(format.as_bytes());
                bytes.push(b':');
                bytes.extend_from_slice(content);
                bytes.extend_from_slice(CRLF);
            }
            Frame::Array(items) => write_aggregate(bytes, DataType::Array, items),
            Frame::Set(items) => write_aggregate(bytes, DataType::Set, items),
            Frame::Push(items) => write_aggregate(bytes, DataType::Push, items),
            Frame::Map(pairs) => {
                write_line(bytes, DataType::Map, pairs.len().to_string().as_bytes());
                for (key, value) in pairs {
                    key.write_to(bytes);
                    value.write_to(bytes);
                }
            }
            Frame::Attribute { attributes, value } => {
                write_line(bytes, DataType::Attribute, attributes.len().to_string().as_bytes());
                for (key, attr_value) in attributes {
                    key.write_to(bytes);
                    attr_value.write_to(bytes);
                }
                value.write_to(bytes);
            }
        }
    }

    /// The payload bytes of a bulk, simple or verbatim string.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Frame::Bulk(data) => Some(data),
            Frame::Simple(s) => Some(Bytes::from(s)),
            Frame::Verbatim { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        let bytes = self.into_bytes()?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    pub fn into_integer(self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(i),
            _ => None,
        }
    }

    /// Map conversion with duplicate-last-wins semantics. RESP2 servers send
    /// map-shaped data as flat arrays, so even-length arrays convert too.
    pub fn into_map(self) -> Option<Vec<(Frame, Frame)>> {
        match self {
            Frame::Map(pairs) => {
                let mut out: Vec<(Frame, Frame)> = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    match out.iter().position(|(k, _)| *k == key) {
                        Some(index) => out[index].1 = value,
                        None => out.push((key, value)),
                    }
                }
                Some(out)
            }
            Frame::Array(items) if items.len() % 2 == 0 => {
                let mut items = items.into_iter();
                let mut pairs = Vec::with_capacity(items.len() / 2);
                while let (Some(k), Some(v)) = (items.next(), items.next()) {
                    pairs.push((k, v));
                }
                Frame::Map(pairs).into_map()
            }
            _ => None,
        }
    }

    /// First element of an aggregate as text. Identifies pub/sub events and
    /// push frame kinds during dispatch.
    pub fn event_name(&self) -> Option<&str> {
        let items = match self {
            Frame::Array(items) | Frame::Push(items) => items,
            _ => return None,
        };
        match items.first() {
            Some(Frame::Simple(s)) => Some(s),
            Some(Frame::Bulk(data)) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "_"),
            Frame::Double(d) => write!(f, ",{}", format_double(*d)),
            Frame::Boolean(b) => write!(f, "#{}", if *b { 't' } else { 'f' }),
            Frame::BigNumber(n) => write!(f, "({}", n),
            Frame::Verbatim { format, content } => {
                write!(f, "={}:{}", format, String::from_utf8_lossy(content))
            }
            Frame::Array(items) => write_items(f, '*', items),
            Frame::Set(items) => write_items(f, '~', items),
            Frame::Push(items) => write_items(f, '>', items),
            Frame::Map(pairs) => {
                write!(f, "%{}", pairs.len())?;
                for (key, value) in pairs {
                    write!(f, " {}={}", key, value)?;
                }
                Ok(())
            }
            Frame::Attribute { value, .. } => write!(f, "|{}", value),
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, prefix: char, items: &[Frame]) -> fmt::Result {
    write!(f, "{}{}", prefix, items.len())?;
    for item in items {
        write!(f, " {}", item)?;
    }
    Ok(())
}

fn write_line(bytes: &mut Vec<u8>, data_type: DataType, payload: &[u8]) {
    bytes.push(u8::from(data_type));
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(CRLF);
}

fn write_aggregate(bytes: &mut Vec<u8>, data_type: DataType, items: &[Frame]) {
    write_line(bytes, data_type, items.len().to_string().as_bytes());
    for item in items {
        item.write_to(bytes);
    }
}

fn parse_elements(src: &mut Cursor<&[u8]>, length: usize) -> Result<Vec<Frame>, Error> {
    let mut frames = Vec::with_capacity(length);
    for _ in 0..length {
        frames.push(Frame::parse(src)?);
    }
    Ok(frames)
}

// A map of N pairs is 2N sub-values on the wire.
fn parse_pairs(src: &mut Cursor<&[u8]>, length: usize) -> Result<Vec<(Frame, Frame)>, Error> {
    let mut pairs = Vec::with_capacity(length);
    for _ in 0..length {
        let key = Frame::parse(src)?;
        let value = Frame::parse(src)?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn parse_int(bytes: &[u8]) -> Result<i64, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::Invalid("integer payload is not valid UTF-8".to_string()))?;
    text.parse::<i64>()
        .map_err(|_| Error::Invalid(format!("invalid integer: {:?}", text)))
}

fn parse_double(bytes: &[u8]) -> Result<f64, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::Invalid("double payload is not valid UTF-8".to_string()))?;
    match text {
        "inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" => Ok(f64::NAN),
        _ => text
            .parse::<f64>()
            .map_err(|_| Error::Invalid(format!("invalid double: {:?}", text))),
    }
}

fn format_double(d: f64) -> String {
    if d == f64::INFINITY {
        "inf".to_string()
    } else if d == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if d.is_nan() {
        "nan".to_string()
    } else {
        d.to_string()
    }
}

/// Length prefix of a bulk or aggregate frame. `-1` denotes nil.
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    let line = get_line(src)?;
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::Invalid("length prefix is not valid UTF-8".to_string()))?;
    let length = text
        .parse::<isize>()
        .map_err(|_| Error::Invalid(format!("invalid length prefix: {:?}", text)))?;
    match length {
        -1 => Ok(None),
        n if n < 0 => Err(Error::Invalid(format!("invalid length prefix: {}", n))),
        n => Ok(Some(n as usize)),
    }
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    let line_end = src.get_ref()[start..end]
        .windows(2)
        .position(|window| window == CRLF)
        .ok_or(Error::Incomplete)
        .map(|index| start + index)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&src.get_ref()[start..line_end])
}

/// Exactly `length` payload bytes followed by CRLF.
fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, length: usize) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buffer = *src.get_ref();

    if buffer.len() < start + length + CRLF.len() {
        return Err(Error::Incomplete);
    }
    if &buffer[start + length..start + length + CRLF.len()] != CRLF {
        return Err(Error::Invalid(
            "bulk payload is not terminated by CRLF".to_string(),
        ));
    }

    src.set_position((start + length + CRLF.len()) as u64);

    Ok(&buffer[start..start + length])
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

#[derive(Debug)]
enum DataType {
    SimpleString,   // '+'
    BulkString,     // '$'
    VerbatimString, // '='
    SimpleError,    // '-'
    BulkError,      // '!'
    Boolean,        // '#'
    Integer,        // ':'
    Double,         // ','
    BigNumber,      // '('
    Array,          // '*'
    Map,            // '%'
    Set,            // '~'
    Push,           // '>'
    Attribute,      // '|'
    // Due to historical reasons, RESP2 features two specially crafted values for representing null
    // values of bulk strings and arrays. This duality has always been a redundancy that added zero
    // semantical value to the protocol itself. The null type, introduced in RESP3, aims to fix
    // this wrong.
    Null, // '_'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'!' => Ok(Self::BulkError),
            b'*' => Ok(Self::Array),
            b'_' => Ok(Self::Null),
            b'#' => Ok(Self::Boolean),
            b',' => Ok(Self::Double),
            b'(' => Ok(Self::BigNumber),
            b'=' => Ok(Self::VerbatimString),
            b'%' => Ok(Self::Map),
            b'~' => Ok(Self::Set),
            b'>' => Ok(Self::Push),
            b'|' => Ok(Self::Attribute),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::BulkError => b'!',
            DataType::Array => b'*',
            DataType::Null => b'_',
            DataType::Boolean => b'#',
            DataType::Double => b',',
            DataType::BigNumber => b'(',
            DataType::VerbatimString => b'=',
            DataType::Map => b'%',
            DataType::Set => b'~',
            DataType::Push => b'>',
            DataType::Attribute => b'|',
        }
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        Error::Invalid("invalid frame format".to_string())
    }
}
