//! Recognition of gateway administrative statements.
//!
//! Meta-DDL travels inside ordinary `Query` messages, delimited by `[[ … ]]`:
//!
//! ```text
//! [[CREATE DATABASE 'crm']]
//! [[CREATE USER 'bob@example.com' WITH PWD 'secret']]
//! [[ADD USER 'bob@example.com' TO DB 'crm']]
//! ```
//!
//! Commands are classified and logged; the administrative routing behind
//! them is not wired up yet, and the session acknowledges every meta-DDL
//! with a single failed-transaction `ReadyForQuery` so clients do not
//! mistake it for a successful query.

/// A classified administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaCommand {
    CreateDatabase(String),
    DropDatabase(String),
    CreateUser(String),
    DeleteUser(String),
    AddUserToDb { user: String, database: String },
    RemoveUserFromDb { user: String, database: String },
    AddRight { right: String, user: String },
    RemoveRight { right: String, user: String },
    Unknown(String),
}

/// Returns the recognized command when `sql` is meta-DDL, `None` otherwise.
/// Anything starting with `[[` after leading whitespace counts, even when
/// malformed: the delimiter alone routes it away from the engine.
pub fn recognize(sql: &str) -> Option<MetaCommand> {
    let trimmed = sql.trim_start();
    let body = trimmed.strip_prefix("[[")?;
    let body = body
        .trim_end()
        .trim_end_matches("]]")
        .trim()
        .trim_end_matches(';')
        .trim();
    Some(classify(body))
}

fn classify(body: &str) -> MetaCommand {
    let upper = body.to_ascii_uppercase();
    let mut quoted = body.split('\'').skip(1).step_by(2).map(str::to_string);

    if upper.starts_with("CREATE DATABASE") {
        if let Some(name) = quoted.next() {
            return MetaCommand::CreateDatabase(name);
        }
    } else if upper.starts_with("DROP DATABASE") {
        if let Some(name) = quoted.next() {
            return MetaCommand::DropDatabase(name);
        }
    } else if upper.starts_with("CREATE USER") {
        if let Some(user) = quoted.next() {
            return MetaCommand::CreateUser(user);
        }
    } else if upper.starts_with("DELETE USER") {
        if let Some(user) = quoted.next() {
            return MetaCommand::DeleteUser(user);
        }
    } else if upper.starts_with("ADD USER") {
        if let (Some(user), Some(database)) = (quoted.next(), quoted.next()) {
            return MetaCommand::AddUserToDb { user, database };
        }
    } else if upper.starts_with("REMOVE USER") {
        if let (Some(user), Some(database)) = (quoted.next(), quoted.next()) {
            return MetaCommand::RemoveUserFromDb { user, database };
        }
    } else if upper.starts_with("ADD RIGHT") {
        if let (Some(right), Some(user)) = (quoted.next(), quoted.next()) {
            return MetaCommand::AddRight { right, user };
        }
    } else if upper.starts_with("REMOVE RIGHT") {
        if let (Some(right), Some(user)) = (quoted.next(), quoted.next()) {
            return MetaCommand::RemoveRight { right, user };
        }
    }
    MetaCommand::Unknown(body.to_string())
}
