use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::session::{Claim, Session};

/// Callbacks a group client drives through each session.
///
/// `setup` runs once per join before any claim is delivered, `consume_claim`
/// runs once per assigned partition (concurrently across partitions), and
/// `cleanup` runs after every claim has returned.
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    async fn setup(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// Must return once the claim's messages end or the session is done.
    async fn consume_claim(&self, _session: Session, _claim: Claim) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type SessionFn = Arc<dyn Fn(Session) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type ClaimFn =
    Arc<dyn Fn(Session, Claim) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Optional user closures; a missing one is a no-op.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub setup: Option<SessionFn>,
    pub cleanup: Option<SessionFn>,
    pub consume_claim: Option<ClaimFn>,
}

impl Callbacks {
    pub(crate) fn session_fn<F, Fut>(f: F) -> SessionFn
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move |session| f(session).boxed())
    }

    pub(crate) fn claim_fn<F, Fut>(f: F) -> ClaimFn
    where
        F: Fn(Session, Claim) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move |session, claim| f(session, claim).boxed())
    }
}

#[async_trait]
impl ConsumerGroupHandler for Callbacks {
    async fn setup(&self, session: &Session) -> anyhow::Result<()> {
        match &self.setup {
            Some(f) => f(session.clone()).await,
            None => Ok(()),
        }
    }

    async fn cleanup(&self, session: &Session) -> anyhow::Result<()> {
        match &self.cleanup {
            Some(f) => f(session.clone()).await,
            None => Ok(()),
        }
    }

    async fn consume_claim(&self, session: Session, claim: Claim) -> anyhow::Result<()> {
        match &self.consume_claim {
            Some(f) => f(session, claim).await,
            // Hold the claim so the session lasts until rebalance or shutdown.
            None => {
                session.done().await;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("setup", &self.setup.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .field("consume_claim", &self.consume_claim.is_some())
            .finish()
    }
}
