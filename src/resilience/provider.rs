//! Supervised provider integrations.
//!
//! External data providers implement [`Provider`], a small capability
//! interface; the [`ResilientWrapper`] composes the safe-mode guard, the
//! retry policy, and the per-provider circuit breaker around every call.
//! Method classification is a compile-time property of [`ProviderMethod`]:
//! destructive methods are never retried, monitored methods execute inside
//! the named breaker, and capability queries bypass wrapping entirely.
//! Provider failures carry an explicit [`ErrorKind`] (or an HTTP status to
//! map through the taxonomy); the wrapper never inspects message text.

use crate::core::cancel::CancelToken;
use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::health::{Guard, HealthMesh};
use crate::resilience::breaker::BreakerRegistry;
use crate::resilience::dlq::{DeadLetterQueue, DlqOperation};
use crate::resilience::retry::{RetryConfig, with_retry};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

/// A failure reported by a provider implementation.
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// Explicit taxonomy kind, when the provider knows it.
    pub kind: Option<ErrorKind>,
    /// HTTP status observed by wrappers that talk to REST backends.
    pub http_status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            http_status: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: None,
            http_status: Some(status),
            message: message.into(),
        }
    }

    /// Resolve to a taxonomy error: explicit kind first, then the HTTP
    /// mapping, else a transient server fault.
    pub fn into_error(self) -> ForgeFlowError {
        let kind = self
            .kind
            .or(self.http_status.map(ErrorKind::from_http_status))
            .unwrap_or(ErrorKind::Transient5xx);
        ForgeFlowError::fault(kind, self.message)
    }
}

/// Declared provider capabilities, returned by the capability query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub features: Vec<String>,
}

impl ProviderCapabilities {
    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// The operations the core actually calls on a provider.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> Result<(), ProviderError>;
    fn ping(&self) -> Result<(), ProviderError>;
    fn close(&self) -> Result<(), ProviderError>;

    fn query(&self, table: &str, filter: &Value, opts: &Value) -> Result<Value, ProviderError>;
    fn insert(&self, table: &str, rows: &Value) -> Result<Value, ProviderError>;
    fn update(&self, table: &str, filter: &Value, changes: &Value)
    -> Result<Value, ProviderError>;
    fn delete(&self, table: &str, filter: &Value) -> Result<Value, ProviderError>;

    fn create_table(&self, table: &str, schema: &Value) -> Result<(), ProviderError>;
    fn drop_table(&self, table: &str) -> Result<(), ProviderError>;
    fn apply_security_rules(&self, rules: &Value) -> Result<(), ProviderError>;
    fn run_migrations(&self, migrations: &Value) -> Result<Value, ProviderError>;
    fn applied_migrations(&self) -> Result<Value, ProviderError>;

    fn capabilities(&self) -> ProviderCapabilities;
}

/// Compile-time classification of provider methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMethod {
    Init,
    Ping,
    Close,
    Query,
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    ApplySecurityRules,
    RunMigrations,
    AppliedMigrations,
}

impl ProviderMethod {
    /// Destructive methods get exactly one attempt.
    pub fn destructive(self) -> bool {
        matches!(self, Self::Delete | Self::DropTable)
    }

    /// Monitored methods execute inside the provider's breaker and feed the
    /// process health mesh.
    pub fn monitored(self) -> bool {
        matches!(
            self,
            Self::Init | Self::Ping | Self::Query | Self::Insert | Self::Update | Self::Delete
        )
    }

    /// Mutating methods are gated on safe mode.
    pub fn mutating(self) -> bool {
        matches!(
            self,
            Self::Insert
                | Self::Update
                | Self::Delete
                | Self::CreateTable
                | Self::DropTable
                | Self::ApplySecurityRules
                | Self::RunMigrations
        )
    }

    /// Reproducible, user-initiated mutations are DLQ-eligible on final
    /// failure.
    pub fn dlq_eligible(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Delete | Self::RunMigrations
        )
    }

    pub fn verb(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ping => "ping",
            Self::Close => "close",
            Self::Query => "query",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateTable => "create_table",
            Self::DropTable => "drop_table",
            Self::ApplySecurityRules => "apply_security_rules",
            Self::RunMigrations => "run_migrations",
            Self::AppliedMigrations => "applied_migrations",
        }
    }
}

/// The resilience façade over one provider.
pub struct ResilientWrapper<'a> {
    provider: Arc<dyn Provider>,
    breakers: &'a BreakerRegistry,
    mesh: &'a HealthMesh,
    dlq: Option<DeadLetterQueue<'a>>,
    retry: RetryConfig,
    cancel: CancelToken,
}

impl<'a> ResilientWrapper<'a> {
    pub fn new(
        provider: Arc<dyn Provider>,
        breakers: &'a BreakerRegistry,
        mesh: &'a HealthMesh,
        retry: RetryConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            provider,
            breakers,
            mesh,
            dlq: None,
            retry,
            cancel,
        }
    }

    /// Enable dead-letter capture for eligible failed operations.
    pub fn with_dlq(mut self, dlq: DeadLetterQueue<'a>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn init(&self) -> Result<(), ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        self.call(ProviderMethod::Init, json!({}), move || {
            provider.init().map(|_| Value::Null)
        })
        .map(|_| ())
    }

    pub fn ping(&self) -> Result<(), ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        self.call(ProviderMethod::Ping, json!({}), move || {
            provider.ping().map(|_| Value::Null)
        })
        .map(|_| ())
    }

    pub fn close(&self) -> Result<(), ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        self.call(ProviderMethod::Close, json!({}), move || {
            provider.close().map(|_| Value::Null)
        })
        .map(|_| ())
    }

    pub fn query(&self, table: &str, filter: &Value, opts: &Value) -> Result<Value, ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        let params = json!({"table": table, "filter": filter, "opts": opts});
        let (table, filter, opts) = (table.to_string(), filter.clone(), opts.clone());
        self.call(ProviderMethod::Query, params, move || {
            provider.query(&table, &filter, &opts)
        })
    }

    pub fn insert(&self, table: &str, rows: &Value) -> Result<Value, ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        let params = json!({"table": table, "rows": rows});
        let (table, rows) = (table.to_string(), rows.clone());
        self.call(ProviderMethod::Insert, params, move || {
            provider.insert(&table, &rows)
        })
    }

    pub fn update(
        &self,
        table: &str,
        filter: &Value,
        changes: &Value,
    ) -> Result<Value, ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        let params = json!({"table": table, "filter": filter, "changes": changes});
        let (table, filter, changes) = (table.to_string(), filter.clone(), changes.clone());
        self.call(ProviderMethod::Update, params, move || {
            provider.update(&table, &filter, &changes)
        })
    }

    pub fn delete(&self, table: &str, filter: &Value) -> Result<Value, ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        let params = json!({"table": table, "filter": filter});
        let (table, filter) = (table.to_string(), filter.clone());
        self.call(ProviderMethod::Delete, params, move || {
            provider.delete(&table, &filter)
        })
    }

    pub fn create_table(&self, table: &str, schema: &Value) -> Result<(), ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        let params = json!({"table": table, "schema": schema});
        let (table, schema) = (table.to_string(), schema.clone());
        self.call(ProviderMethod::CreateTable, params, move || {
            provider.create_table(&table, &schema).map(|_| Value::Null)
        })
        .map(|_| ())
    }

    pub fn drop_table(&self, table: &str) -> Result<(), ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        let params = json!({"table": table});
        let table = table.to_string();
        self.call(ProviderMethod::DropTable, params, move || {
            provider.drop_table(&table).map(|_| Value::Null)
        })
        .map(|_| ())
    }

    pub fn apply_security_rules(&self, rules: &Value) -> Result<(), ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        let params = json!({"rules": rules});
        let rules = rules.clone();
        self.call(ProviderMethod::ApplySecurityRules, params, move || {
            provider.apply_security_rules(&rules).map(|_| Value::Null)
        })
        .map(|_| ())
    }

    pub fn run_migrations(&self, migrations: &Value) -> Result<Value, ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        let params = json!({"migrations": migrations});
        let migrations = migrations.clone();
        self.call(ProviderMethod::RunMigrations, params, move || {
            provider.run_migrations(&migrations)
        })
    }

    pub fn applied_migrations(&self) -> Result<Value, ForgeFlowError> {
        let provider = Arc::clone(&self.provider);
        self.call(ProviderMethod::AppliedMigrations, json!({}), move || {
            provider.applied_migrations()
        })
    }

    /// Capability queries bypass all wrapping.
    pub fn capabilities(&self) -> ProviderCapabilities {
        self.provider.capabilities()
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.provider.capabilities().supports(feature)
    }

    fn call<F>(
        &self,
        method: ProviderMethod,
        params: Value,
        op: F,
    ) -> Result<Value, ForgeFlowError>
    where
        F: Fn() -> Result<Value, ProviderError> + Send + Sync + 'static,
    {
        if method.mutating() {
            Guard::new(self.mesh).enforce_safe_mode()?;
        }

        let breaker = self.breakers.get(self.provider.name());
        let monitored = method.monitored();
        let attempt = move || -> Result<Value, ForgeFlowError> {
            let exec = || op().map_err(ProviderError::into_error);
            if monitored { breaker.call(exec) } else { exec() }
        };

        let result = if method.destructive() {
            attempt()
        } else {
            with_retry(attempt, &self.retry, &self.cancel)
        };

        if monitored {
            self.feed_mesh(method, &result);
        }

        if let Err(error) = &result {
            if method.dlq_eligible() && error.kind() != ErrorKind::SafeModeReadOnly {
                self.enqueue_dead_letter(method, params, error);
            }
        }
        result
    }

    fn feed_mesh(&self, method: ProviderMethod, result: &Result<Value, ForgeFlowError>) {
        let outcome = match result {
            Ok(_) => {
                // Only touch the record when there is a streak to clear.
                match self.mesh.read() {
                    Ok(record) if record.consecutive_failures > 0 => self.mesh.record_success(),
                    _ => return,
                }
            }
            Err(error) => self.mesh.record_failure(&format!(
                "provider '{}' {} failed: {}",
                self.provider.name(),
                method.verb(),
                error.kind()
            )),
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "health mesh update failed");
        }
    }

    fn enqueue_dead_letter(&self, method: ProviderMethod, params: Value, error: &ForgeFlowError) {
        let Some(dlq) = &self.dlq else {
            return;
        };
        let operation = DlqOperation {
            verb: method.verb().to_string(),
            params,
            resource: self.provider.name().to_string(),
        };
        if let Err(e) = dlq.add(operation, error, json!({"provider": self.provider.name()})) {
            tracing::warn!(error = %e, "failed to quarantine operation in dead-letter queue");
        }
    }
}
