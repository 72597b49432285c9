use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::CapabilityFlags;

/// The authenticator behind the transport. MSG carries U2F APDUs, CBOR carries CTAP2 commands.
///
/// Both return the full response payload; failures that have no protocol-level encoding are
/// reported as `Err` and answered with `ERR_OTHER`.
#[async_trait]
pub trait CtapHidApi: Send + Sync + 'static {
    type Error: fmt::Debug + Send;

    fn version(&self) -> VersionInfo;
    async fn wink(&self) -> Result<(), Self::Error>;
    async fn msg(&self, msg: Vec<u8>) -> Result<Vec<u8>, Self::Error>;
    async fn cbor(&self, cbor: Vec<u8>) -> Result<Vec<u8>, Self::Error>;
}

#[async_trait]
impl<Api: CtapHidApi> CtapHidApi for Arc<Api> {
    type Error = Api::Error;

    fn version(&self) -> VersionInfo {
        self.as_ref().version()
    }

    async fn wink(&self) -> Result<(), Self::Error> {
        self.as_ref().wink().await
    }
    async fn msg(&self, msg: Vec<u8>) -> Result<Vec<u8>, Self::Error> {
        self.as_ref().msg(msg).await
    }
    async fn cbor(&self, cbor: Vec<u8>) -> Result<Vec<u8>, Self::Error> {
        self.as_ref().cbor(cbor).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub capabilities: CapabilityFlags,
}
