//! Socket-closed notifications.

use hub_core::UserId;
use hub_rpc::EngineHandle;
use tokio::sync::broadcast;
use tracing::debug;

/// One item seen by a [`ClosedSubscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedEvent {
    /// This user's engine connection was lost.
    User(UserId),
    /// The subscriber fell behind and this many notifications were dropped.
    Missed(u64),
}

/// Receives the id of every user whose engine connection was lost.
///
/// Dropping the subscription unsubscribes.
pub struct ClosedSubscription {
    rx: broadcast::Receiver<UserId>,
}

impl ClosedSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<UserId>) -> Self {
        ClosedSubscription { rx }
    }

    /// Next event. `None` once the manager is gone.
    pub async fn recv(&mut self) -> Option<ClosedEvent> {
        match self.rx.recv().await {
            Ok(user) => Some(ClosedEvent::User(user)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "closed-socket subscriber lagged");
                Some(ClosedEvent::Missed(missed))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Resolves with true when `user`'s connection is reported closed or
    /// when notifications were dropped (it may have been among them). False
    /// once the manager is gone.
    pub async fn wait_for(&mut self, user: &UserId) -> bool {
        while let Some(event) = self.recv().await {
            match event {
                ClosedEvent::User(closed) if &closed == user => return true,
                ClosedEvent::User(_) => {}
                ClosedEvent::Missed(_) => return true,
            }
        }
        false
    }

    /// Resolves once `engine`, the connection `user` is bound to, is gone.
    ///
    /// Notifications about an older connection of the same user, or a lag,
    /// only end the wait if `engine` itself is closed.
    pub async fn until_lost(mut self, user: &UserId, engine: &EngineHandle) {
        let reported = async {
            loop {
                if !self.wait_for(user).await {
                    // Manager gone; the handle still tells us.
                    std::future::pending::<()>().await;
                }
                if !engine.is_connected() {
                    return;
                }
            }
        };
        tokio::select! {
            _ = engine.closed() => {}
            _ = reported => {}
        }
    }
}
