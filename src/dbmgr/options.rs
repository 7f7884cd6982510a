//! Engine open-string options.
//!
//! Options are serialised into the `?k=v&…` suffix of the open-string. The
//! emission order is fixed so logs and tests are deterministic: `_mutex`
//! first, then `mode`, then one value for every mutually exclusive group.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    #[default]
    Delete,
    Wal,
    Truncate,
    Persist,
    Memory,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecureDelete {
    #[default]
    Off,
    On,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionLock {
    /// No `_txlock` pair is emitted.
    #[default]
    None,
    Deferred,
    Immediate,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoVacuum {
    #[default]
    None,
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Synchronous {
    #[default]
    Normal,
    Full,
    Extra,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingMode {
    #[default]
    Normal,
    Exclusive,
}

/// Flags recognized by the engine open-string.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub journal_mode: JournalMode,
    pub shared_cache: bool,
    pub secure_delete: SecureDelete,
    pub tx_lock: TransactionLock,
    pub auto_vacuum: AutoVacuum,
    pub synchronous: Synchronous,
    pub locking_mode: LockingMode,
    pub case_sensitive_like: bool,
    pub foreign_keys: bool,
    pub ignore_check_constraints: bool,
    pub immutable: bool,
    /// Emitted only when positive.
    pub cache_size: i32,
}

impl ConnectionOptions {
    /// Serialise into the open-string query suffix. `mode` is sanitised to
    /// one of `ro`/`rw`/`rwc`/`memory`; anything else falls back to `rw`.
    pub fn conn_str_opts(&self, mode: &str) -> String {
        let mut opts: Vec<String> = Vec::with_capacity(16);
        opts.push("_mutex=full".to_string());

        let mode = match mode {
            "ro" | "rw" | "rwc" | "memory" => mode,
            _ => "rw",
        };
        opts.push(format!("mode={mode}"));

        opts.push(
            match self.journal_mode {
                JournalMode::Off => "_journal=OFF",
                JournalMode::Wal => "_journal=WAL",
                JournalMode::Memory => "_journal=MEMORY",
                JournalMode::Persist => "_journal=PERSIST",
                JournalMode::Truncate => "_journal=TRUNCATE",
                JournalMode::Delete => "_journal=DELETE",
            }
            .to_string(),
        );

        opts.push(
            if self.shared_cache {
                "cache=shared"
            } else {
                "cache=private"
            }
            .to_string(),
        );

        opts.push(
            match self.secure_delete {
                SecureDelete::On => "_secure_delete=true",
                SecureDelete::Fast => "_secure_delete=FAST",
                SecureDelete::Off => "_secure_delete=false",
            }
            .to_string(),
        );

        match self.tx_lock {
            TransactionLock::None => {}
            TransactionLock::Exclusive => opts.push("_txlock=exclusive".to_string()),
            TransactionLock::Immediate => opts.push("_txlock=immediate".to_string()),
            TransactionLock::Deferred => opts.push("_txlock=deferred".to_string()),
        }

        opts.push(
            match self.auto_vacuum {
                AutoVacuum::Incremental => "_vacuum=incremental",
                AutoVacuum::Full => "_vacuum=full",
                AutoVacuum::None => "_vacuum=none",
            }
            .to_string(),
        );

        opts.push(
            match self.synchronous {
                Synchronous::Extra => "_sync=extra",
                Synchronous::Full => "_sync=full",
                Synchronous::Off => "_sync=off",
                Synchronous::Normal => "_sync=normal",
            }
            .to_string(),
        );

        opts.push(
            match self.locking_mode {
                LockingMode::Exclusive => "_locking=exclusive",
                LockingMode::Normal => "_locking=normal",
            }
            .to_string(),
        );

        opts.push(format!("_cslike={}", self.case_sensitive_like));
        opts.push(format!("_fk={}", self.foreign_keys));
        opts.push(format!(
            "_ignore_check_constraints={}",
            self.ignore_check_constraints
        ));

        if self.immutable {
            opts.push("immutable=true".to_string());
        }
        if self.cache_size > 0 {
            opts.push(format!("_cache_size={}", self.cache_size));
        }

        format!("?{}", opts.join("&"))
    }
}
