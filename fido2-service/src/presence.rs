use std::{convert::Infallible, fmt::Debug};

use async_trait::async_trait;
use tracing::info;

/// Asks the person at the machine to confirm an operation.
///
/// `relying_party` is whatever the protocol offers to show: the RP ID for CTAP2, the hex
/// encoded application parameter for U2F.
#[async_trait]
pub trait UserPresence: Send + Sync {
    type Error: Debug + Send;

    async fn approve_registration(&self, relying_party: &str) -> Result<bool, Self::Error>;
    async fn approve_authentication(&self, relying_party: &str) -> Result<bool, Self::Error>;
    async fn approve_reset(&self) -> Result<bool, Self::Error>;
    async fn wink(&self) -> Result<(), Self::Error>;
}

#[async_trait]
impl<U: UserPresence + ?Sized> UserPresence for Box<U> {
    type Error = U::Error;

    async fn approve_registration(&self, relying_party: &str) -> Result<bool, Self::Error> {
        (**self).approve_registration(relying_party).await
    }

    async fn approve_authentication(&self, relying_party: &str) -> Result<bool, Self::Error> {
        (**self).approve_authentication(relying_party).await
    }

    async fn approve_reset(&self) -> Result<bool, Self::Error> {
        (**self).approve_reset().await
    }

    async fn wink(&self) -> Result<(), Self::Error> {
        (**self).wink().await
    }
}

/// Answers every request the same way without asking anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoApprove {
    approve: bool,
}

impl AutoApprove {
    pub fn new(approve: bool) -> Self {
        Self { approve }
    }

    pub fn deny() -> Self {
        Self::new(false)
    }
}

impl Default for AutoApprove {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl UserPresence for AutoApprove {
    type Error = Infallible;

    async fn approve_registration(&self, relying_party: &str) -> Result<bool, Self::Error> {
        info!(relying_party, approved = self.approve, "Registration");
        Ok(self.approve)
    }

    async fn approve_authentication(&self, relying_party: &str) -> Result<bool, Self::Error> {
        info!(relying_party, approved = self.approve, "Authentication");
        Ok(self.approve)
    }

    async fn approve_reset(&self) -> Result<bool, Self::Error> {
        info!(approved = self.approve, "Reset");
        Ok(self.approve)
    }

    async fn wink(&self) -> Result<(), Self::Error> {
        info!("Wink");
        Ok(())
    }
}
