//! File-backed in-memory reference engine.
//!
//! The gateway does not ship a native SQL engine; deployments register their
//! own [`Engine`]. This module is the engine behind the binary's default
//! wiring and the test-suite: each database file on disk maps to an in-memory
//! table store shared by every connection to that path, and a deliberately
//! small evaluator covers the statement surface the gateway needs to be
//! driven end-to-end.
//!
//! Supported statements: `SELECT` over a list of literals, parameters and
//! zero-argument registered scalar functions; `SELECT * FROM <table>`;
//! `CREATE TABLE`; `INSERT INTO … VALUES`; `DROP TABLE`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    Column, Engine, EngineConnection, EngineError, EngineHooks, EngineResult, ExecOutcome, Rows,
    Statement, Value,
};
use crate::engine::hooks::UpdateOp;

pub const DRIVER_NAME: &str = "warren-memory";

pub struct MemoryEngine {
    hooks: EngineHooks,
    databases: Mutex<HashMap<PathBuf, Arc<MemoryDatabase>>>,
}

impl MemoryEngine {
    pub fn new(hooks: EngineHooks) -> MemoryEngine {
        MemoryEngine {
            hooks,
            databases: Mutex::new(HashMap::new()),
        }
    }
}

impl Engine for MemoryEngine {
    fn open(&self, conn_str: &str) -> EngineResult<Box<dyn EngineConnection>> {
        let (path, mode) = parse_conn_str(conn_str)?;
        if mode == "memory" {
            return Ok(Box::new(MemoryConnection {
                db: Arc::new(MemoryDatabase::default()),
                hooks: self.hooks.clone(),
                closed: AtomicBool::new(false),
                read_only: false,
            }));
        }
        match mode.as_str() {
            "ro" | "rw" => {
                let meta = std::fs::metadata(&path)
                    .map_err(|err| EngineError::new(format!("unable to open database file: {err}")))?;
                if !meta.is_file() {
                    return Err(EngineError::new("unable to open database file"));
                }
            }
            "rwc" => {
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|err| {
                        EngineError::new(format!("unable to create database file: {err}"))
                    })?;
                file.sync_all()
                    .map_err(|err| EngineError::new(format!("unable to flush database file: {err}")))?;
            }
            other => return Err(EngineError::new(format!("unknown open mode {other:?}"))),
        }
        let db = {
            let mut databases = self.databases.lock();
            databases.entry(path).or_default().clone()
        };
        Ok(Box::new(MemoryConnection {
            db,
            hooks: self.hooks.clone(),
            closed: AtomicBool::new(false),
            read_only: mode == "ro",
        }))
    }
}

fn parse_conn_str(conn_str: &str) -> EngineResult<(PathBuf, String)> {
    let rest = conn_str
        .strip_prefix("file:")
        .ok_or_else(|| EngineError::new("open-string must start with file:"))?;
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    };
    if path.is_empty() {
        return Err(EngineError::new("open-string has no path"));
    }
    let mut mode = "rw".to_string();
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("mode=") {
            mode = value.to_string();
        }
    }
    Ok((Path::new(path).to_path_buf(), mode))
}

#[derive(Default)]
struct MemoryDatabase {
    tables: Mutex<HashMap<String, Table>>,
}

struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    hooks: EngineHooks,
    closed: AtomicBool,
    read_only: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::new("connection is closed"));
        }
        Ok(())
    }

    fn run(&self, sql: &str, params: &[Value]) -> EngineResult<StatementOutput> {
        self.check_open()?;
        let sql = sql.trim().trim_end_matches(';').trim();
        if sql.is_empty() {
            return Err(EngineError::new("empty statement"));
        }
        let lowered = sql.to_ascii_lowercase();
        if let Some(rest) = lowered.strip_prefix("select ") {
            if let Some(table) = rest.trim().strip_prefix("* from ") {
                return self.select_table(table.trim());
            }
            return self.select_items(&sql["select ".len()..], params);
        }
        if lowered.starts_with("create table ") {
            self.check_writable()?;
            return self.create_table(&sql["create table ".len()..]);
        }
        if lowered.starts_with("insert into ") {
            self.check_writable()?;
            return self.insert(&sql["insert into ".len()..], params);
        }
        if lowered.starts_with("drop table ") {
            self.check_writable()?;
            return self.drop_table(sql["drop table ".len()..].trim());
        }
        Err(EngineError::new(format!(
            "unsupported statement: {}",
            sql.split_whitespace().next().unwrap_or("")
        )))
    }

    fn check_writable(&self) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::new("attempt to write a readonly database"));
        }
        Ok(())
    }

    fn select_table(&self, name: &str) -> EngineResult<StatementOutput> {
        let tables = self.db.tables.lock();
        let table = tables
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| EngineError::new(format!("no such table: {name}")))?;
        Ok(StatementOutput::Rows {
            columns: table.columns.clone(),
            rows: table.rows.clone(),
        })
    }

    fn select_items(&self, items: &str, params: &[Value]) -> EngineResult<StatementOutput> {
        let mut columns = Vec::new();
        let mut row = Vec::new();
        let mut next_param = 0usize;
        for item in split_list(items)? {
            let item = item.trim();
            let value = self.eval_item(item, params, &mut next_param)?;
            columns.push(Column::new(item, decl_type_of(&value)));
            row.push(value);
        }
        if columns.is_empty() {
            return Err(EngineError::new("empty select list"));
        }
        Ok(StatementOutput::Rows {
            columns,
            rows: vec![row],
        })
    }

    fn eval_item(
        &self,
        item: &str,
        params: &[Value],
        next_param: &mut usize,
    ) -> EngineResult<Value> {
        if item == "?" {
            let value = params
                .get(*next_param)
                .cloned()
                .ok_or_else(|| EngineError::new("not enough bound parameters"))?;
            *next_param += 1;
            return Ok(value);
        }
        if let Some(value) = parse_literal(item) {
            return Ok(value);
        }
        if let Some(name) = item.strip_suffix("()") {
            let func = self
                .hooks
                .scalar(name)
                .ok_or_else(|| EngineError::new(format!("no such function: {name}")))?;
            return (func.func)(&[]);
        }
        Err(EngineError::new(format!("no such column: {item}")))
    }

    fn create_table(&self, rest: &str) -> EngineResult<StatementOutput> {
        let (name, body) = rest
            .split_once('(')
            .ok_or_else(|| EngineError::new("malformed CREATE TABLE"))?;
        let name = name.trim().to_ascii_lowercase();
        let body = body
            .trim_end()
            .strip_suffix(')')
            .ok_or_else(|| EngineError::new("malformed CREATE TABLE"))?;
        let mut columns = Vec::new();
        for column in split_list(body)? {
            let column = column.trim();
            let (col_name, decl) = match column.split_once(char::is_whitespace) {
                Some((col_name, decl)) => (col_name, decl.trim()),
                None => (column, "text"),
            };
            columns.push(Column::new(col_name, decl));
        }
        let mut tables = self.db.tables.lock();
        if tables.contains_key(&name) {
            return Err(EngineError::new(format!("table {name} already exists")));
        }
        tables.insert(
            name,
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        drop(tables);
        self.committed();
        Ok(StatementOutput::Exec(ExecOutcome::default()))
    }

    fn insert(&self, rest: &str, params: &[Value]) -> EngineResult<StatementOutput> {
        let (name, tail) = rest
            .split_once('(')
            .map(|(name, tail)| (name, format!("({tail}")))
            .ok_or_else(|| EngineError::new("malformed INSERT"))?;
        let name = name
            .trim()
            .trim_end_matches(|c: char| c.is_ascii_whitespace())
            .to_ascii_lowercase();
        let name = name
            .strip_suffix("values")
            .map(|n| n.trim_end().to_string())
            .unwrap_or(name);
        let lowered = tail.to_ascii_lowercase();
        let values = match lowered.find("values") {
            Some(at) => &tail[at + "values".len()..],
            None => tail.as_str(),
        };
        let values = values
            .trim()
            .strip_prefix('(')
            .and_then(|v| v.trim_end().strip_suffix(')'))
            .ok_or_else(|| EngineError::new("malformed INSERT"))?;
        let mut next_param = 0usize;
        let mut row = Vec::new();
        for item in split_list(values)? {
            row.push(self.eval_item(item.trim(), params, &mut next_param)?);
        }

        if let Some(hook) = &self.hooks.commit_hook {
            if !hook() {
                if let Some(rollback) = &self.hooks.rollback_hook {
                    rollback();
                }
                return Err(EngineError::new("commit aborted by hook"));
            }
        }

        let mut tables = self.db.tables.lock();
        let table = tables
            .get_mut(&name)
            .ok_or_else(|| EngineError::new(format!("no such table: {name}")))?;
        if row.len() != table.columns.len() {
            return Err(EngineError::new(format!(
                "table {name} has {} columns but {} values were supplied",
                table.columns.len(),
                row.len()
            )));
        }
        table.rows.push(row);
        let row_id = table.rows.len() as i64;
        drop(tables);
        if let Some(hook) = &self.hooks.update_hook {
            hook(UpdateOp::Insert, "main", &name, row_id);
        }
        Ok(StatementOutput::Exec(ExecOutcome {
            rows_affected: 1,
            last_insert_id: row_id,
        }))
    }

    fn drop_table(&self, name: &str) -> EngineResult<StatementOutput> {
        let mut tables = self.db.tables.lock();
        if tables.remove(&name.to_ascii_lowercase()).is_none() {
            return Err(EngineError::new(format!("no such table: {name}")));
        }
        drop(tables);
        self.committed();
        Ok(StatementOutput::Exec(ExecOutcome::default()))
    }

    fn committed(&self) {
        if let Some(hook) = &self.hooks.commit_hook {
            let _ = hook();
        }
    }
}

enum StatementOutput {
    Rows {
        columns: Vec<Column>,
        rows: Vec<Vec<Value>>,
    },
    Exec(ExecOutcome),
}

impl StatementOutput {
    fn into_rows(self) -> Box<dyn Rows> {
        match self {
            StatementOutput::Rows { columns, rows } => Box::new(MemoryRows {
                columns,
                rows: rows.into_iter(),
            }),
            StatementOutput::Exec(_) => Box::new(MemoryRows {
                columns: Vec::new(),
                rows: Vec::new().into_iter(),
            }),
        }
    }

    fn into_outcome(self) -> ExecOutcome {
        match self {
            StatementOutput::Exec(outcome) => outcome,
            StatementOutput::Rows { rows, .. } => ExecOutcome {
                rows_affected: rows.len() as u64,
                last_insert_id: 0,
            },
        }
    }
}

impl EngineConnection for MemoryConnection {
    fn ping(&self) -> EngineResult<()> {
        self.check_open()
    }

    fn exec(&self, sql: &str, params: &[Value]) -> EngineResult<ExecOutcome> {
        Ok(self.run(sql, params)?.into_outcome())
    }

    fn query(&self, sql: &str, params: &[Value]) -> EngineResult<Box<dyn Rows>> {
        Ok(self.run(sql, params)?.into_rows())
    }

    fn prepare(&self, sql: &str) -> EngineResult<Box<dyn Statement>> {
        self.check_open()?;
        // Validate eagerly so Parse surfaces malformed SQL, but defer
        // parameter-dependent failures to execution.
        let probe: Vec<Value> = (0..count_placeholders(sql))
            .map(|_| Value::Null)
            .collect();
        self.run(sql, &probe)?;
        Ok(Box::new(MemoryStatement {
            sql: sql.to_string(),
            db: self.db.clone(),
            hooks: self.hooks.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            read_only: self.read_only,
        }))
    }

    fn auth_enabled(&self) -> EngineResult<bool> {
        self.check_open()?;
        Ok(self.hooks.authorizer.is_some())
    }

    fn checkpoint(&self) -> EngineResult<()> {
        self.check_open()
    }

    fn close(&self) -> EngineResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryStatement {
    sql: String,
    db: Arc<MemoryDatabase>,
    hooks: EngineHooks,
    closed: Arc<AtomicBool>,
    read_only: bool,
}

impl Statement for MemoryStatement {
    fn query(&self, params: &[Value]) -> EngineResult<Box<dyn Rows>> {
        let conn = MemoryConnection {
            db: self.db.clone(),
            hooks: self.hooks.clone(),
            closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
            read_only: self.read_only,
        };
        Ok(conn.run(&self.sql, params)?.into_rows())
    }

    fn parameter_count(&self) -> usize {
        count_placeholders(&self.sql)
    }
}

struct MemoryRows {
    columns: Vec<Column>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl Rows for MemoryRows {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn next_row(&mut self) -> EngineResult<Option<Vec<Value>>> {
        Ok(self.rows.next())
    }
}

/// Split a comma-separated list, honoring single-quoted strings.
fn split_list(input: &str) -> EngineResult<Vec<String>> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    for c in input.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                current.push(c);
            }
            ',' if !in_string => {
                items.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if in_string {
        return Err(EngineError::new("unterminated string literal"));
    }
    if !current.trim().is_empty() {
        items.push(current);
    }
    Ok(items)
}

fn parse_literal(item: &str) -> Option<Value> {
    if item.eq_ignore_ascii_case("null") {
        return Some(Value::Null);
    }
    if item.len() >= 2 && item.starts_with('\'') && item.ends_with('\'') {
        return Some(Value::Text(item[1..item.len() - 1].to_string()));
    }
    if let Ok(v) = item.parse::<i64>() {
        return Some(Value::Integer(v));
    }
    if let Ok(v) = item.parse::<f64>() {
        return Some(Value::Real(v));
    }
    None
}

fn decl_type_of(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "integer",
        Value::Real(_) => "real",
        Value::Blob(_) => "blob",
        Value::Null | Value::Text(_) => "text",
    }
}

fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut in_string = false;
    for c in sql.chars() {
        match c {
            '\'' => in_string = !in_string,
            '?' if !in_string => count += 1,
            _ => {}
        }
    }
    count
}
