//! Frontend message decoding (client → gateway).

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::MAX_MESSAGE_SIZE;
use crate::errors::Error;

pub const PROTOCOL_VERSION_NUMBER: i32 = 196608; // v3.0
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

/// Startup messages carry no type byte, only a length and a version-like
/// code. Everything a client may open a connection with lands here.
#[derive(Debug)]
pub enum StartupRequest {
    Startup(HashMap<String, String>),
    SslRequest,
    CancelRequest { process_id: i32, secret_key: i32 },
    GssEncRequest,
}

/// One decoded frontend frame from the ordinary (tagged) message stream.
#[derive(Debug, PartialEq, Eq)]
pub enum FrontendMessage {
    Query {
        sql: String,
    },
    Parse {
        name: String,
        sql: String,
        param_oids: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Describe {
        target: u8,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Close {
        target: u8,
        name: String,
    },
    Sync,
    Flush,
    Terminate,
    Password {
        password: String,
    },
    FunctionCall,
    CopyData,
    CopyDone,
    CopyFail,
    /// Untagged `SSLRequest` probe observed mid-session (lazy upgrade).
    SslRequest,
    /// Untagged `GSSENCRequest` probe observed mid-session.
    GssEncRequest,
    /// Untagged `CancelRequest` observed mid-session.
    CancelRequest,
    /// A startup message out of sequence.
    Startup,
}

/// What arrived while the session was waiting for a password. Clients are
/// allowed to slip an untagged `SSLRequest` probe in here.
#[derive(Debug, PartialEq, Eq)]
pub enum PasswordRead {
    Password(String),
    SslProbe,
}

/// Read the startup message. Its length field comes first and includes
/// itself; the body must fit the usual startup bounds.
pub async fn read_startup<S>(stream: &mut S) -> Result<StartupRequest, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let len = stream
        .read_i32()
        .await
        .map_err(|_| Error::Protocol("client hung up before startup".into()))?;
    if !(8..=8 * 1024).contains(&len) {
        return Err(Error::Protocol(format!("bad startup message length {len}")));
    }
    let mut body = vec![0u8; (len - 4) as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|_| Error::Protocol("truncated startup message".into()))?;

    let mut bytes = BytesMut::from(&body[..]);
    let code = bytes.get_i32();
    match code {
        SSL_REQUEST_CODE => Ok(StartupRequest::SslRequest),
        GSSENC_REQUEST_CODE => Ok(StartupRequest::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            if bytes.remaining() < 8 {
                return Err(Error::Protocol("truncated cancel request".into()));
            }
            Ok(StartupRequest::CancelRequest {
                process_id: bytes.get_i32(),
                secret_key: bytes.get_i32(),
            })
        }
        PROTOCOL_VERSION_NUMBER => Ok(StartupRequest::Startup(parse_startup_params(bytes)?)),
        other => Err(Error::Protocol(format!(
            "unsupported protocol version {other}"
        ))),
    }
}

/// Parse the null-terminated key/value pairs of a startup message body.
fn parse_startup_params(mut bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let mut strings = Vec::new();
    let mut current = String::new();
    while bytes.has_remaining() {
        let c = bytes.get_u8();
        if c != 0 {
            current.push(c as char);
        } else if !current.is_empty() {
            strings.push(std::mem::take(&mut current));
        }
    }

    if strings.len() < 2 || strings.len() % 2 != 0 {
        return Err(Error::Protocol(format!(
            "startup message carries {} parameter strings, expected key-value pairs",
            strings.len()
        )));
    }

    let mut params = HashMap::new();
    let mut iter = strings.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        params.insert(key, value);
    }
    Ok(params)
}

/// Read one tagged frontend frame. Returns `None` on a clean EOF before the
/// first byte: the client simply went away.
pub async fn read_message<S>(stream: &mut S) -> Result<Option<FrontendMessage>, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let tag = match stream.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::Transport(err)),
    };
    // No tagged message starts with a zero byte; this is the leading length
    // byte of an untagged control message (SSLRequest, GSSENCRequest,
    // CancelRequest, or a startup message out of sequence).
    if tag == 0 {
        return read_untagged(stream).await.map(Some);
    }
    let body = read_body(stream).await?;
    decode(tag, body).map(Some)
}

async fn read_untagged<S>(stream: &mut S) -> Result<FrontendMessage, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let mut rest = [0u8; 3];
    stream.read_exact(&mut rest).await.map_err(Error::Transport)?;
    let len = i32::from_be_bytes([0, rest[0], rest[1], rest[2]]);
    if !(8..=8 * 1024).contains(&len) {
        return Err(Error::Protocol(format!("bad control message length {len}")));
    }
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await.map_err(Error::Transport)?;
    let mut bytes = BytesMut::from(&body[..]);
    let code = bytes.get_i32();
    match code {
        SSL_REQUEST_CODE => Ok(FrontendMessage::SslRequest),
        GSSENC_REQUEST_CODE => Ok(FrontendMessage::GssEncRequest),
        CANCEL_REQUEST_CODE => Ok(FrontendMessage::CancelRequest),
        PROTOCOL_VERSION_NUMBER => Ok(FrontendMessage::Startup),
        other => Err(Error::Protocol(format!(
            "unknown control message code {other}"
        ))),
    }
}

async fn read_body<S>(stream: &mut S) -> Result<BytesMut, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let len = stream.read_i32().await.map_err(Error::Transport)?;
    if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
        return Err(Error::Protocol(format!("malformed message length {len}")));
    }
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await.map_err(Error::Transport)?;
    Ok(BytesMut::from(&body[..]))
}

fn decode(tag: u8, mut bytes: BytesMut) -> Result<FrontendMessage, Error> {
    match tag {
        b'Q' => Ok(FrontendMessage::Query {
            sql: bytes.read_cstring()?,
        }),
        b'P' => {
            let name = bytes.read_cstring()?;
            let sql = bytes.read_cstring()?;
            let count = read_i16(&mut bytes)?;
            let mut param_oids = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                param_oids.push(read_u32(&mut bytes)?);
            }
            Ok(FrontendMessage::Parse {
                name,
                sql,
                param_oids,
            })
        }
        b'B' => {
            let portal = bytes.read_cstring()?;
            let statement = bytes.read_cstring()?;
            let format_count = read_i16(&mut bytes)?;
            let mut param_formats = Vec::with_capacity(format_count.max(0) as usize);
            for _ in 0..format_count {
                param_formats.push(read_i16(&mut bytes)?);
            }
            let param_count = read_i16(&mut bytes)?;
            let mut params = Vec::with_capacity(param_count.max(0) as usize);
            for _ in 0..param_count {
                let len = read_i32(&mut bytes)?;
                if len < 0 {
                    params.push(None);
                } else {
                    let len = len as usize;
                    if bytes.remaining() < len {
                        return Err(Error::Protocol("truncated bind parameter".into()));
                    }
                    params.push(Some(bytes.split_to(len).to_vec()));
                }
            }
            let result_count = read_i16(&mut bytes)?;
            let mut result_formats = Vec::with_capacity(result_count.max(0) as usize);
            for _ in 0..result_count {
                result_formats.push(read_i16(&mut bytes)?);
            }
            Ok(FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            })
        }
        b'D' => {
            let target = read_u8(&mut bytes)?;
            let name = bytes.read_cstring()?;
            Ok(FrontendMessage::Describe { target, name })
        }
        b'E' => {
            let portal = bytes.read_cstring()?;
            let max_rows = read_i32(&mut bytes)?;
            Ok(FrontendMessage::Execute { portal, max_rows })
        }
        b'C' => {
            let target = read_u8(&mut bytes)?;
            let name = bytes.read_cstring()?;
            Ok(FrontendMessage::Close { target, name })
        }
        b'S' => Ok(FrontendMessage::Sync),
        b'H' => Ok(FrontendMessage::Flush),
        b'X' => Ok(FrontendMessage::Terminate),
        b'p' => Ok(FrontendMessage::Password {
            password: bytes.read_cstring()?,
        }),
        b'F' => Ok(FrontendMessage::FunctionCall),
        b'd' => Ok(FrontendMessage::CopyData),
        b'c' => Ok(FrontendMessage::CopyDone),
        b'f' => Ok(FrontendMessage::CopyFail),
        other => Err(Error::Protocol(format!(
            "unknown message type {:?}",
            other as char
        ))),
    }
}

/// Read the password response. The first byte disambiguates: a zero byte can
/// only start an untagged 8-byte `SSLRequest` probe, a `p` starts the
/// `PasswordMessage` proper.
pub async fn read_password_message<S>(stream: &mut S) -> Result<PasswordRead, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let first = stream.read_u8().await.map_err(Error::Transport)?;
    if first == 0 {
        let mut rest = [0u8; 7];
        stream.read_exact(&mut rest).await.map_err(Error::Transport)?;
        let len = i32::from_be_bytes([first, rest[0], rest[1], rest[2]]);
        let code = i32::from_be_bytes([rest[3], rest[4], rest[5], rest[6]]);
        if len == 8 && code == SSL_REQUEST_CODE {
            return Ok(PasswordRead::SslProbe);
        }
        return Err(Error::Protocol(format!(
            "unexpected untagged message (len {len}, code {code}) while waiting for password"
        )));
    }
    if first != b'p' {
        return Err(Error::Protocol(format!(
            "expected password message, got {:?}",
            first as char
        )));
    }
    let mut bytes = read_body(stream).await?;
    Ok(PasswordRead::Password(bytes.read_cstring()?))
}

/// Cursor-style reads over a frame body.
pub trait BytesMutReader {
    fn read_cstring(&mut self) -> Result<String, Error>;
}

impl BytesMutReader for BytesMut {
    fn read_cstring(&mut self) -> Result<String, Error> {
        let end = self
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("string is not null-terminated".into()))?;
        let raw = self.split_to(end);
        self.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Protocol("string is not valid UTF-8".into()))
    }
}

fn read_u8(bytes: &mut BytesMut) -> Result<u8, Error> {
    if bytes.remaining() < 1 {
        return Err(Error::Protocol("truncated message".into()));
    }
    Ok(bytes.get_u8())
}

fn read_i16(bytes: &mut BytesMut) -> Result<i16, Error> {
    if bytes.remaining() < 2 {
        return Err(Error::Protocol("truncated message".into()));
    }
    Ok(bytes.get_i16())
}

fn read_i32(bytes: &mut BytesMut) -> Result<i32, Error> {
    if bytes.remaining() < 4 {
        return Err(Error::Protocol("truncated message".into()));
    }
    Ok(bytes.get_i32())
}

fn read_u32(bytes: &mut BytesMut) -> Result<u32, Error> {
    if bytes.remaining() < 4 {
        return Err(Error::Protocol("truncated message".into()));
    }
    Ok(bytes.get_u32())
}
