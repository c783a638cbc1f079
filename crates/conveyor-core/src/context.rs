//! Per-instance variable bag with tenant isolation
//!
//! The context store is the leaf dependency of every executor and gateway.
//! Variables are cached in memory per instance, backed by a
//! [`ContextRepository`], versioned on every write, and guarded by a tenant
//! check on every access.

use crate::domain::instance::{ProcessInstanceId, TenantId};
use crate::domain::repository::{ContextRepository, TenantContext};
use crate::domain::step::StepId;
use crate::EngineError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Default upper bound on the serialized size of one instance's context
pub const DEFAULT_MAX_CONTEXT_BYTES: usize = 256 * 1024;

/// Reserved prefix for engine-injected read-only values
pub const SYSTEM_PREFIX: &str = "system.";

fn variable_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap_or_else(|_| unreachable!())
    })
}

/// One named value with write metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextVariable {
    /// Current value
    pub value: Value,

    /// Timestamp of the last write
    pub updated_at: DateTime<Utc>,

    /// Step that performed the last write, if known
    pub updated_by_step: Option<StepId>,

    /// Value before the last write
    pub previous_value: Option<Value>,

    /// Monotonic write counter, 1 on first write
    pub version: u32,
}

/// The full variable bag of one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceContext {
    /// Owning tenant; every access is checked against the caller's
    pub tenant_id: TenantId,

    /// Variables by name
    pub variables: HashMap<String, ContextVariable>,
}

impl InstanceContext {
    /// Create an empty context owned by a tenant
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            variables: HashMap::new(),
        }
    }
}

/// Hook invoked after a variable write; failures are logged, not propagated
pub type ChangeHook =
    Arc<dyn Fn(&ProcessInstanceId, &str, &ContextVariable) -> Result<(), EngineError> + Send + Sync>;

/// Per-variable value validator, run before the write lands
pub type VariableValidator = Arc<dyn Fn(&Value) -> Result<(), EngineError> + Send + Sync>;

/// Tenant-scoped context manager with an in-memory cache over a durable store
pub struct ContextStore {
    repository: Arc<dyn ContextRepository>,
    tenant_context: Arc<dyn TenantContext>,
    cache: DashMap<String, InstanceContext>,
    change_hooks: Mutex<Vec<ChangeHook>>,
    validators: DashMap<String, VariableValidator>,
    max_context_bytes: usize,
}

impl ContextStore {
    /// Create a store over a repository and tenant accessor
    pub fn new(
        repository: Arc<dyn ContextRepository>,
        tenant_context: Arc<dyn TenantContext>,
    ) -> Self {
        Self {
            repository,
            tenant_context,
            cache: DashMap::new(),
            change_hooks: Mutex::new(Vec::new()),
            validators: DashMap::new(),
            max_context_bytes: DEFAULT_MAX_CONTEXT_BYTES,
        }
    }

    /// Override the serialized-size bound
    pub fn with_max_context_bytes(mut self, bytes: usize) -> Self {
        self.max_context_bytes = bytes;
        self
    }

    /// The tenant accessor this store checks against
    pub(crate) fn tenant_context(&self) -> &Arc<dyn TenantContext> {
        &self.tenant_context
    }

    /// Register a change hook fired after every successful write
    pub fn register_change_hook(&self, hook: ChangeHook) {
        if let Ok(mut hooks) = self.change_hooks.lock() {
            hooks.push(hook);
        }
    }

    /// Register a validator for one variable name
    pub fn register_validator(&self, name: impl Into<String>, validator: VariableValidator) {
        self.validators.insert(name.into(), validator);
    }

    /// Create the context for a new instance
    pub async fn initialize(
        &self,
        instance_id: &ProcessInstanceId,
        tenant_id: TenantId,
    ) -> Result<(), EngineError> {
        let context = InstanceContext::new(tenant_id);
        self.repository.save(instance_id, &context).await?;
        self.cache.insert(instance_id.0.clone(), context);
        Ok(())
    }

    /// Read one variable
    ///
    /// Returns `default` (or null) for a missing name unless `required`, in
    /// which case a [`EngineError::ContextManager`] is raised.
    pub async fn get(
        &self,
        instance_id: &ProcessInstanceId,
        name: &str,
        default: Option<Value>,
        required: bool,
    ) -> Result<Value, EngineError> {
        let context = self.load(instance_id).await?;
        match context.variables.get(name) {
            Some(variable) => Ok(variable.value.clone()),
            None if required => Err(EngineError::ContextManager(format!(
                "Required context variable '{}' is not set for instance '{}'",
                name, instance_id
            ))),
            None => Ok(default.unwrap_or(Value::Null)),
        }
    }

    /// Write one variable, versioned and validated
    pub async fn set(
        &self,
        instance_id: &ProcessInstanceId,
        name: &str,
        value: Value,
        step_id: Option<&StepId>,
    ) -> Result<(), EngineError> {
        if name.starts_with(SYSTEM_PREFIX) {
            return Err(EngineError::Validation(format!(
                "Context variable name '{}' uses the reserved '{}' prefix",
                name, SYSTEM_PREFIX
            )));
        }
        self.set_inner(instance_id, name, value, step_id).await
    }

    /// Write an engine-injected `system.` value, bypassing the prefix guard
    pub(crate) async fn set_system(
        &self,
        instance_id: &ProcessInstanceId,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        self.set_inner(instance_id, name, value, None).await
    }

    async fn set_inner(
        &self,
        instance_id: &ProcessInstanceId,
        name: &str,
        value: Value,
        step_id: Option<&StepId>,
    ) -> Result<(), EngineError> {
        if !variable_name_pattern().is_match(name) {
            return Err(EngineError::Validation(format!(
                "Invalid context variable name '{}'",
                name
            )));
        }

        if let Some(validator) = self.validators.get(name) {
            validator(&value)?;
        }

        let mut context = self.load(instance_id).await?;
        let variable = match context.variables.remove(name) {
            Some(previous) => ContextVariable {
                value,
                updated_at: Utc::now(),
                updated_by_step: step_id.cloned(),
                previous_value: Some(previous.value),
                version: previous.version + 1,
            },
            None => ContextVariable {
                value,
                updated_at: Utc::now(),
                updated_by_step: step_id.cloned(),
                previous_value: None,
                version: 1,
            },
        };
        context.variables.insert(name.to_string(), variable);

        let serialized_len = serde_json::to_vec(&context.variables)?.len();
        if serialized_len > self.max_context_bytes {
            return Err(EngineError::ContextManager(format!(
                "Context for instance '{}' exceeds {} bytes after writing '{}'",
                instance_id, self.max_context_bytes, name
            )));
        }

        self.repository.save(instance_id, &context).await?;
        let written = context
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ContextManager("Variable vanished during write".to_string()))?;
        self.cache.insert(instance_id.0.clone(), context);

        let hooks: Vec<ChangeHook> = match self.change_hooks.lock() {
            Ok(hooks) => hooks.clone(),
            Err(_) => Vec::new(),
        };
        for hook in hooks {
            if let Err(e) = hook(instance_id, name, &written) {
                tracing::warn!(
                    instance_id = %instance_id.0,
                    variable = name,
                    error = %e,
                    "Context change hook failed"
                );
            }
        }

        Ok(())
    }

    /// Read the whole variable bag as plain name/value pairs
    pub async fn get_all(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<HashMap<String, Value>, EngineError> {
        let context = self.load(instance_id).await?;
        Ok(context
            .variables
            .into_iter()
            .map(|(name, variable)| (name, variable.value))
            .collect())
    }

    /// Substitute `${name}` placeholders and coerce the result
    ///
    /// A text that is exactly one placeholder resolves to the variable's
    /// JSON value unchanged. Otherwise placeholders are substituted
    /// textually (unknown names become the empty string, with a warning)
    /// and the final string is coerced to a number or boolean when it
    /// parses as one.
    pub async fn resolve_expression(
        &self,
        instance_id: &ProcessInstanceId,
        text: &str,
    ) -> Result<Value, EngineError> {
        let context = self.load(instance_id).await?;

        static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
        let placeholder = PLACEHOLDER.get_or_init(|| {
            Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}").unwrap_or_else(|_| unreachable!())
        });

        let trimmed = text.trim();
        if let Some(captures) = placeholder.captures(trimmed) {
            if let Some(whole) = captures.get(0) {
                if whole.as_str() == trimmed {
                    let name = &captures[1];
                    return match context.variables.get(name) {
                        Some(variable) => Ok(variable.value.clone()),
                        None => {
                            tracing::warn!(
                                instance_id = %instance_id.0,
                                variable = name,
                                "Unknown context variable in expression"
                            );
                            Ok(Value::String(String::new()))
                        }
                    };
                }
            }
        }

        let mut resolved = String::with_capacity(text.len());
        let mut last_end = 0;
        for captures in placeholder.captures_iter(text) {
            let whole = match captures.get(0) {
                Some(m) => m,
                None => continue,
            };
            resolved.push_str(&text[last_end..whole.start()]);
            let name = &captures[1];
            match context.variables.get(name) {
                Some(variable) => resolved.push_str(&value_to_text(&variable.value)),
                None => {
                    tracing::warn!(
                        instance_id = %instance_id.0,
                        variable = name,
                        "Unknown context variable in expression"
                    );
                }
            }
            last_end = whole.end();
        }
        resolved.push_str(&text[last_end..]);

        Ok(coerce_text(&resolved))
    }

    /// Copy of the instance's full context for later restore
    pub async fn snapshot(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<InstanceContext, EngineError> {
        self.load(instance_id).await
    }

    /// Replace the instance's context with a previously taken snapshot
    pub async fn restore(
        &self,
        instance_id: &ProcessInstanceId,
        snapshot: InstanceContext,
    ) -> Result<(), EngineError> {
        self.check_tenant(instance_id, &snapshot.tenant_id)?;
        self.repository.save(instance_id, &snapshot).await?;
        self.cache.insert(instance_id.0.clone(), snapshot);
        Ok(())
    }

    /// Drop the cache entry when the instance reaches a final status
    ///
    /// The durable copy is retained; only the in-memory cache is evicted.
    pub fn evict(&self, instance_id: &ProcessInstanceId) {
        self.cache.remove(&instance_id.0);
    }

    async fn load(&self, instance_id: &ProcessInstanceId) -> Result<InstanceContext, EngineError> {
        if let Some(cached) = self.cache.get(&instance_id.0) {
            let context = cached.clone();
            drop(cached);
            self.check_tenant(instance_id, &context.tenant_id)?;
            return Ok(context);
        }

        let context = self
            .repository
            .load(instance_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("Context for instance '{}'", instance_id))
            })?;
        self.check_tenant(instance_id, &context.tenant_id)?;
        self.cache.insert(instance_id.0.clone(), context.clone());
        Ok(context)
    }

    fn check_tenant(
        &self,
        instance_id: &ProcessInstanceId,
        owner: &TenantId,
    ) -> Result<(), EngineError> {
        let active = self.tenant_context.active_tenant().ok_or_else(|| {
            EngineError::ContextIsolation(format!(
                "No active tenant while accessing context of instance '{}'",
                instance_id
            ))
        })?;
        if &active != owner {
            return Err(EngineError::ContextIsolation(format!(
                "Instance '{}' belongs to tenant '{}', caller is '{}'",
                instance_id, owner.0, active.0
            )));
        }
        Ok(())
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Coerce a resolved string to a number or boolean when it parses as one
fn coerce_text(text: &str) -> Value {
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    match trimmed {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}
