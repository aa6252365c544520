use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;

use reconverge_core::state::ValidationResult;
use reconverge_core::traits::{ActionContext, Validator};

use crate::actions::callable::{boxed, invoke, CallableFn};
use crate::actions::CallContext;

/// An async closure used as a condition check. Passes when it returns `Ok`.
pub struct CallableValidator {
    name: String,
    f: CallableFn,
    timeout: Duration,
}

impl CallableValidator {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: boxed(f),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Validator for CallableValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate<'a>(&'a self, ctx: ActionContext<'a>) -> BoxFuture<'a, ValidationResult> {
        Box::pin(async move {
            let timestamp = Utc::now();
            let outcome = invoke(&self.name, &self.f, ctx, self.timeout).await;
            ValidationResult {
                validator_name: self.name.clone(),
                success: outcome.success,
                output: outcome.output,
                stderr: outcome.stderr,
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                timestamp,
                metadata: Default::default(),
            }
            .with_metadata("callable", serde_json::json!(self.name))
        })
    }
}
