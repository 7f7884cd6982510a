//! Per-connection engine extension hooks.
//!
//! Hooks are supplied once, at driver registration, and applied by the engine
//! implementation to every connection it opens. Registration is immutable
//! after first use, so hook sets never change under a live connection.

use std::cmp::Ordering;
use std::sync::Arc;

use super::{EngineResult, Value};

pub type ScalarFn = Arc<dyn Fn(&[Value]) -> EngineResult<Value> + Send + Sync>;

/// A custom scalar SQL function.
#[derive(Clone)]
pub struct CustomFunction {
    pub name: String,
    pub func: ScalarFn,
    /// Pure functions always return the same output for the same input and
    /// may be folded by the engine.
    pub pure: bool,
}

/// Incremental state of a custom aggregate.
pub trait Aggregate: Send {
    fn step(&mut self, args: &[Value]) -> EngineResult<()>;
    fn finish(self: Box<Self>) -> EngineResult<Value>;
}

pub type AggregateFactory = Arc<dyn Fn() -> Box<dyn Aggregate> + Send + Sync>;

#[derive(Clone)]
pub struct CustomAggregator {
    pub name: String,
    pub factory: AggregateFactory,
    pub pure: bool,
}

pub type CollatorFn = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

#[derive(Clone)]
pub struct CustomCollator {
    pub name: String,
    pub func: CollatorFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Insert,
    Update,
    Delete,
}

/// Outcome of the authorizer callback for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
    Ignore,
}

/// Returns whether the commit may proceed; `false` turns it into a rollback.
pub type CommitHook = Arc<dyn Fn() -> bool + Send + Sync>;
pub type RollbackHook = Arc<dyn Fn() + Send + Sync>;
/// Called per changed row with (op, database, table, rowid).
pub type UpdateHook = Arc<dyn Fn(UpdateOp, &str, &str, i64) + Send + Sync>;
pub type PreUpdateHook = Arc<dyn Fn(&PreUpdateData) + Send + Sync>;
/// Called per action with (action code, arg1, arg2, database).
pub type AuthorizerFn = Arc<dyn Fn(i32, &str, &str, &str) -> Access + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PreUpdateData {
    pub op: UpdateOp,
    pub database: String,
    pub table: String,
    pub old_row_id: i64,
    pub new_row_id: i64,
}

/// Everything an engine implementation is asked to wire into each new
/// connection. All fields are optional; `EngineHooks::default()` is inert.
#[derive(Clone, Default)]
pub struct EngineHooks {
    pub functions: Vec<CustomFunction>,
    pub aggregators: Vec<CustomAggregator>,
    pub collators: Vec<CustomCollator>,
    pub commit_hook: Option<CommitHook>,
    pub rollback_hook: Option<RollbackHook>,
    pub update_hook: Option<UpdateHook>,
    pub pre_update_hook: Option<PreUpdateHook>,
    pub authorizer: Option<AuthorizerFn>,
}

impl EngineHooks {
    /// The hook set installed by the default driver registration: a
    /// zero-argument `version()` scalar reporting the gateway version.
    pub fn with_version(version: &str) -> EngineHooks {
        let version = version.to_string();
        EngineHooks {
            functions: vec![CustomFunction {
                name: "version".to_string(),
                func: Arc::new(move |_args| Ok(Value::Text(version.clone()))),
                pure: true,
            }],
            ..EngineHooks::default()
        }
    }

    pub fn scalar(&self, name: &str) -> Option<&CustomFunction> {
        self.functions
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }
}
