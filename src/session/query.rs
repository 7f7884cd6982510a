//! The simple query flow.

use log::{debug, info};

use super::metaddl;
use super::Session;
use crate::errors::Error;
use crate::messages::{
    command_complete, data_row, encode_value, error_message, field_description, ready_for_query,
    row_description, FieldDescription, TransactionStatus,
};

impl Session {
    /// `Query`: run the SQL, stream the translated result set, finish the
    /// batch with `CommandComplete` and `ReadyForQuery`. Engine errors are
    /// recoverable; the session stays up.
    pub(crate) async fn handle_query(&mut self, sql: &str) -> Result<(), Error> {
        if self.config.log_messages {
            debug!("session {}: query {sql:?}", self.id);
        }

        if let Some(command) = metaddl::recognize(sql) {
            info!(
                "session {}: meta command {command:?} acknowledged (administrative routing is not wired up)",
                self.id
            );
            self.push(ready_for_query(TransactionStatus::Failed));
            return self.flush_response().await;
        }

        let mark = self.buffer.len();
        let mut rows = match self.db.query(sql, &[]) {
            Ok(rows) => rows,
            Err(err) => return self.query_error(mark, &err.to_string()).await,
        };

        let fields: Vec<FieldDescription> =
            rows.columns().iter().map(field_description).collect();
        let type_oids: Vec<u32> = fields.iter().map(|f| f.type_oid).collect();
        self.push(row_description(&fields));

        loop {
            match rows.next_row() {
                Ok(Some(row)) => {
                    let values: Vec<Option<Vec<u8>>> = row
                        .iter()
                        .zip(&type_oids)
                        .map(|(value, oid)| encode_value(*oid, value))
                        .collect();
                    self.push(data_row(&values));
                }
                Ok(None) => break,
                Err(err) => return self.query_error(mark, &err.to_string()).await,
            }
        }

        self.push(command_complete("SELECT 1"));
        self.push(ready_for_query(TransactionStatus::Idle));
        self.flush_response().await
    }

    /// Replace whatever this query queued with an `ErrorResponse` and the
    /// idle `ReadyForQuery` that keeps the session alive.
    async fn query_error(&mut self, mark: usize, message: &str) -> Result<(), Error> {
        self.buffer.truncate(mark);
        self.push(error_message("ERROR", "XX000", message));
        self.push(ready_for_query(TransactionStatus::Idle));
        self.flush_response().await
    }
}
