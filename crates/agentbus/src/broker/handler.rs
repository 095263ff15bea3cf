use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use agentbus_protocol::Event;

/// Subscriber callback.
///
/// Handlers receive a shared, read-only event. An error (or a panic) is
/// contained by the broker: it is logged and counted, never propagated.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()>;
}

/// Handler built from an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as an [`EventHandler`].
///
/// ```ignore
/// broker.subscribe(Matcher::kind("task.delegated"), handler_fn(|event| async move {
///     tracing::info!(id = %event.id, "delegated");
///     anyhow::Ok(())
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Match rule of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Matcher {
    /// Exact event kind
    Kind(String),
    /// Category name, expanded through the category registry
    Category(String),
}

impl Matcher {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Kind(kind.into())
    }

    pub fn category(category: impl Into<String>) -> Self {
        Self::Category(category.into())
    }
}

impl std::fmt::Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Matcher::Kind(kind) => write!(f, "kind:{}", kind),
            Matcher::Category(category) => write!(f, "category:{}", category),
        }
    }
}
