// PostgreSQL v3 wire protocol: frame builders for the backend side and a
// decoder for everything a client may send.

pub mod frontend;
pub mod protocol;
pub mod socket;
pub mod types;

pub use frontend::{
    read_message, read_password_message, read_startup, BytesMutReader, FrontendMessage,
    PasswordRead, StartupRequest, CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE,
    PROTOCOL_VERSION_NUMBER, SSL_REQUEST_CODE,
};
pub use protocol::{
    authentication_cleartext_password, authentication_ok, bind_complete, close_complete,
    command_complete, data_row, error_message, error_response_terminal, no_data,
    parameter_description, parse_complete, ready_for_query, row_description,
    server_parameter_message, TransactionStatus,
};
pub use socket::{write_all, write_all_flush};
pub use types::{encode_value, field_description, oid, type_oid_for, FieldDescription};

/// Upper bound on any single frame a client may send.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;
