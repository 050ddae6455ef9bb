use std::future::Future;
use std::pin::Pin;

use sandbox_run_error::RunError;

pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<String, RunError>> + Send + 'a>>;

/// What the resolver knows about the run asking for a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveContext {
    pub installation_id: u64,
    pub repo: String,
}

/// Picks the model a run executes with.
pub trait ModelResolver: Send + Sync + 'static {
    fn resolve(&self, context: &ResolveContext, requested: Option<&str>) -> ResolveFuture<'_>;
}

/// Honors the requested model, falling back to a configured default.
#[derive(Debug, Clone)]
pub struct StaticModelResolver {
    default_model: Option<String>,
}

impl StaticModelResolver {
    pub fn new(default_model: Option<String>) -> Self {
        Self {
            default_model: default_model.filter(|model| !model.trim().is_empty()),
        }
    }
}

impl ModelResolver for StaticModelResolver {
    fn resolve(&self, context: &ResolveContext, requested: Option<&str>) -> ResolveFuture<'_> {
        let requested = requested
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string);
        let repo = context.repo.clone();
        Box::pin(async move {
            requested
                .or_else(|| self.default_model.clone())
                .ok_or_else(|| RunError::ModelResolution {
                    message: format!("no model requested for {repo} and no default configured"),
                })
        })
    }
}
