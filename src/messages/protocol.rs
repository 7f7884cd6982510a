//! Backend message encoders (gateway → client).
//!
//! Every function builds one complete v3 frame into a `BytesMut`; handlers
//! concatenate frames and flush a logically atomic response in one write.

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWrite;

use super::socket::write_all_flush;
use super::types::FieldDescription;
use crate::errors::Error;

/// Transaction status reported in `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    Failed,
}

impl TransactionStatus {
    fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// `AuthenticationCleartextPassword`: ask for the password in the clear.
pub fn authentication_cleartext_password() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(3);
    bytes
}

/// `AuthenticationOk`.
pub fn authentication_ok() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(0);
    bytes
}

/// `ParameterStatus`: report a server parameter to the client.
pub fn server_parameter_message(key: &str, value: &str) -> BytesMut {
    let mut server_info = BytesMut::new();
    server_info.put_u8(b'S');
    server_info.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    server_info.put_slice(key.as_bytes());
    server_info.put_u8(0);
    server_info.put_slice(value.as_bytes());
    server_info.put_u8(0);
    server_info
}

/// `ReadyForQuery` with the given transaction status.
pub fn ready_for_query(status: TransactionStatus) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(6);
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(status.as_byte());
    bytes
}

pub fn parse_complete() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'1');
    bytes.put_i32(4);
    bytes
}

pub fn bind_complete() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'2');
    bytes.put_i32(4);
    bytes
}

pub fn close_complete() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'3');
    bytes.put_i32(4);
    bytes
}

pub fn no_data() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'n');
    bytes.put_i32(4);
    bytes
}

/// `ParameterDescription`: the parameter OIDs a prepared statement declared.
pub fn parameter_description(parameter_oids: &[u32]) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b't');
    bytes.put_i32(4 + 2 + 4 * parameter_oids.len() as i32);
    bytes.put_i16(parameter_oids.len() as i16);
    for oid in parameter_oids {
        bytes.put_u32(*oid);
    }
    bytes
}

/// `RowDescription` from synthesised field descriptions.
pub fn row_description(fields: &[FieldDescription]) -> BytesMut {
    let mut row_desc = BytesMut::new();
    row_desc.put_i16(fields.len() as i16);
    for field in fields {
        row_desc.put_slice(field.name.as_bytes());
        row_desc.put_u8(0);
        row_desc.put_u32(field.table_oid);
        row_desc.put_i16(field.column_attr);
        row_desc.put_u32(field.type_oid);
        row_desc.put_i16(field.type_size);
        row_desc.put_i32(field.type_modifier);
        row_desc.put_i16(field.format);
    }

    let mut res = BytesMut::with_capacity(row_desc.len() + 5);
    res.put_u8(b'T');
    res.put_i32(row_desc.len() as i32 + 4);
    res.put(row_desc);
    res
}

/// `DataRow`. A `None` cell is encoded as the -1 null length.
pub fn data_row(values: &[Option<Vec<u8>>]) -> BytesMut {
    let mut data_row = BytesMut::new();
    data_row.put_i16(values.len() as i16);
    for value in values {
        match value {
            Some(value) => {
                data_row.put_i32(value.len() as i32);
                data_row.put_slice(value);
            }
            None => data_row.put_i32(-1),
        }
    }

    let mut res = BytesMut::with_capacity(data_row.len() + 5);
    res.put_u8(b'D');
    res.put_i32(data_row.len() as i32 + 4);
    res.put(data_row);
    res
}

/// `CommandComplete` with the given tag.
pub fn command_complete(command: &str) -> BytesMut {
    let mut res = BytesMut::new();
    res.put_u8(b'C');
    res.put_i32(command.len() as i32 + 4 + 1);
    res.put_slice(command.as_bytes());
    res.put_u8(0);
    res
}

/// `ErrorResponse` with severity, SQLSTATE code and message fields.
pub fn error_message(severity: &str, code: &str, message: &str) -> BytesMut {
    let mut error = BytesMut::new();
    // Severity, twice: localizable and not.
    error.put_u8(b'S');
    error.put_slice(severity.as_bytes());
    error.put_u8(0);
    error.put_u8(b'V');
    error.put_slice(severity.as_bytes());
    error.put_u8(0);
    // SQLSTATE code.
    error.put_u8(b'C');
    error.put_slice(code.as_bytes());
    error.put_u8(0);
    // The short message.
    error.put_u8(b'M');
    error.put_slice(message.as_bytes());
    error.put_u8(0);
    // No more fields follow.
    error.put_u8(0);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// Send a fatal `ErrorResponse` with no `ReadyForQuery`; the session is
/// expected to terminate right after.
pub async fn error_response_terminal<S>(
    stream: &mut S,
    message: &str,
    code: &str,
) -> Result<(), Error>
where
    S: AsyncWrite + std::marker::Unpin,
{
    let res = error_message("FATAL", code, message);
    write_all_flush(stream, &res).await
}
