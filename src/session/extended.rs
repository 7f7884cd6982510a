//! The extended query flow: Parse, Bind, Describe, Execute, Close.
//!
//! Completions queue on the session buffer and leave with the next frame
//! that carries a `ReadyForQuery` (or with an error). Errors here do not
//! emit a `ReadyForQuery` of their own: the client's Sync produces one.

use log::debug;

use super::{Portal, PreparedStatement, Session};
use crate::engine::Value;
use crate::errors::Error;
use crate::messages::{
    bind_complete, close_complete, command_complete, data_row, encode_value, no_data,
    parameter_description, parse_complete, ready_for_query, type_oid_for, TransactionStatus,
};

impl Session {
    /// `Parse`: prepare on the engine, remember the statement under its
    /// name. A pre-existing statement with the same non-empty name must be
    /// closed first; the unnamed statement is silently replaced.
    pub(crate) async fn handle_parse(
        &mut self,
        name: String,
        sql: &str,
        param_oids: Vec<u32>,
    ) -> Result<(), Error> {
        if self.config.log_messages {
            debug!("session {}: parse {name:?} {sql:?}", self.id);
        }
        if !name.is_empty() && self.statements.contains_key(&name) {
            return self
                .error(
                    &format!("prepared statement {name:?} already exists"),
                    "42P05",
                )
                .await;
        }
        let statement = match self.db.prepare(sql) {
            Ok(statement) => statement,
            Err(err) => return self.error(&err.to_string(), "XX000").await,
        };
        self.statements.insert(
            name,
            PreparedStatement {
                sql: sql.to_string(),
                statement,
                param_oids,
            },
        );
        self.push(parse_complete());
        Ok(())
    }

    /// `Bind`: build a portal over an existing statement. Parameter bytes
    /// pass through untouched; nonzero format codes mean binary.
    pub(crate) async fn handle_bind(
        &mut self,
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    ) -> Result<(), Error> {
        if !self.statements.contains_key(&statement) {
            return self
                .error(
                    &format!("prepared statement {statement:?} does not exist"),
                    "26000",
                )
                .await;
        }
        self.portals.insert(
            portal,
            Portal {
                statement,
                param_formats,
                params,
                result_formats,
            },
        );
        self.push(bind_complete());
        Ok(())
    }

    /// `Describe`: portals answer `NoData`, statements answer their declared
    /// parameter OIDs, anything else answers `NoData`.
    pub(crate) async fn handle_describe(&mut self, target: u8, name: &str) -> Result<(), Error> {
        match target {
            b'P' | b'p' => {
                if self.portals.contains_key(name) {
                    self.push(no_data());
                    Ok(())
                } else {
                    self.error(&format!("portal {name:?} does not exist"), "34000")
                        .await
                }
            }
            b'S' | b's' => {
                let param_oids = self
                    .statements
                    .get(name)
                    .map(|statement| statement.param_oids.clone());
                match param_oids {
                    Some(param_oids) => {
                        self.push(parameter_description(&param_oids));
                        Ok(())
                    }
                    None => {
                        self.error(
                            &format!("prepared statement {name:?} does not exist"),
                            "26000",
                        )
                        .await
                    }
                }
            }
            _ => {
                self.push(no_data());
                Ok(())
            }
        }
    }

    /// `Execute`: resolve portal and statement, run with the bound
    /// parameters, stream rows. Row metadata is not re-sent; Describe is
    /// the client's responsibility.
    pub(crate) async fn handle_execute(
        &mut self,
        portal: &str,
        _max_rows: i32,
    ) -> Result<(), Error> {
        let (statement_name, raw_params, param_formats, result_formats) =
            match self.portals.get(portal) {
                Some(p) => (
                    p.statement.clone(),
                    p.params.clone(),
                    p.param_formats.clone(),
                    p.result_formats.clone(),
                ),
                None => {
                    let message = format!("portal {portal:?} does not exist");
                    return self.error(&message, "34000").await;
                }
            };
        if !self.statements.contains_key(&statement_name) {
            let message = format!("prepared statement {statement_name:?} does not exist");
            return self.error(&message, "26000").await;
        }

        let params = match decode_parameters(&raw_params, &param_formats) {
            Ok(params) => params,
            Err(message) => return self.error(&message, "22021").await,
        };
        if result_formats.iter().any(|format| *format != 0) {
            debug!(
                "session {}: binary result formats requested; results keep the declared column formats",
                self.id
            );
        }
        if self.config.log_messages {
            let sql = self
                .statements
                .get(&statement_name)
                .map(|statement| statement.sql.clone())
                .unwrap_or_default();
            debug!("session {}: execute portal {portal:?} ({sql:?})", self.id);
        }

        let query_result = match self.statements.get(&statement_name) {
            Some(statement) => statement.statement.query(&params),
            None => {
                let message =
                    format!("prepared statement {statement_name:?} does not exist");
                return self.error(&message, "26000").await;
            }
        };
        let mut rows = match query_result {
            Ok(rows) => rows,
            Err(err) => {
                let message = err.to_string();
                return self.error(&message, "XX000").await;
            }
        };

        let type_oids: Vec<u32> = rows
            .columns()
            .iter()
            .map(|column| type_oid_for(&column.decl_type))
            .collect();
        let mark = self.buffer.len();
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
                Err(err) => {
                    self.buffer.truncate(mark);
                    let message = err.to_string();
                    return self.error(&message, "XX000").await;
                }
            }
        }
        self.push(command_complete("SELECT 1"));
        self.push(ready_for_query(TransactionStatus::Idle));
        self.flush_response().await
    }

    /// `Close`: forget the named statement or portal. `CloseComplete` is
    /// emitted whether or not anything existed under the name.
    pub(crate) async fn handle_close(&mut self, target: u8, name: &str) -> Result<(), Error> {
        match target {
            b'S' | b's' => {
                self.statements.remove(name);
            }
            b'P' | b'p' => {
                self.portals.remove(name);
            }
            _ => {}
        }
        self.push(close_complete());
        Ok(())
    }
}

/// Turn bound parameter bytes into engine values. Text parameters must be
/// UTF-8; binary parameters pass through as blobs.
fn decode_parameters(params: &[Option<Vec<u8>>], formats: &[i16]) -> Result<Vec<Value>, String> {
    let format_for = |index: usize| -> i16 {
        match formats.len() {
            0 => 0,
            1 => formats[0],
            _ => formats.get(index).copied().unwrap_or(0),
        }
    };
    params
        .iter()
        .enumerate()
        .map(|(index, param)| match param {
            None => Ok(Value::Null),
            Some(bytes) if format_for(index) != 0 => Ok(Value::Blob(bytes.clone())),
            Some(bytes) => String::from_utf8(bytes.clone())
                .map(Value::Text)
                .map_err(|_| format!("parameter {} is not valid UTF-8", index + 1)),
        })
        .collect()
}
