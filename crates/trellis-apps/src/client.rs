//! Host capabilities exposed to apps while they serve a call.

use std::fmt;
use std::sync::Arc;

use crate::error::ClientApiError;
use crate::protocol::ChainInfo;

/// Capabilities an app can use during a call.
pub trait ClientApi: Send + Sync {
    /// Describes the chain the host operates on.
    ///
    /// # Errors
    ///
    /// Fails when no chain is available or the host cannot be reached.
    fn chain_info(&self) -> Result<ChainInfo, ClientApiError>;
}

/// A chain the host can describe.
pub trait Chain: Send + Sync {
    /// Chain identifier.
    ///
    /// # Errors
    ///
    /// Fails when the chain configuration cannot be read.
    fn id(&self) -> Result<String, ClientApiError>;
    /// Root directory of the chain project.
    fn app_path(&self) -> String;
    /// Chain configuration file.
    fn config_path(&self) -> String;
    /// Node home directory.
    ///
    /// # Errors
    ///
    /// Fails when the home directory cannot be determined.
    fn home(&self) -> Result<String, ClientApiError>;
    /// RPC listen address.
    ///
    /// # Errors
    ///
    /// Fails when the chain configuration cannot be read.
    fn rpc_address(&self) -> Result<String, ClientApiError>;
}

/// Host-side [`ClientApi`] backed by an optional chain.
#[derive(Clone, Default)]
pub struct HostClientApi {
    chain: Option<Arc<dyn Chain>>,
}

impl HostClientApi {
    /// Creates an API with nothing bound.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the chain described by `chain_info`.
    #[must_use]
    pub fn with_chain(mut self, chain: Arc<dyn Chain>) -> Self {
        self.chain = Some(chain);
        self
    }
}

impl fmt::Debug for HostClientApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostClientApi")
            .field("chain", &self.chain.is_some())
            .finish()
    }
}

impl ClientApi for HostClientApi {
    fn chain_info(&self) -> Result<ChainInfo, ClientApiError> {
        let chain = self.chain.as_ref().ok_or(ClientApiError::NoChain)?;
        Ok(ChainInfo {
            chain_id: chain.id()?,
            app_path: chain.app_path(),
            config_path: chain.config_path(),
            home: chain.home()?,
            rpc_address: chain.rpc_address()?,
        })
    }
}

/// A chain with fixed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticChain(pub ChainInfo);

impl Chain for StaticChain {
    fn id(&self) -> Result<String, ClientApiError> {
        Ok(self.0.chain_id.clone())
    }

    fn app_path(&self) -> String {
        self.0.app_path.clone()
    }

    fn config_path(&self) -> String {
        self.0.config_path.clone()
    }

    fn home(&self) -> Result<String, ClientApiError> {
        Ok(self.0.home.clone())
    }

    fn rpc_address(&self) -> Result<String, ClientApiError> {
        Ok(self.0.rpc_address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_api_reports_no_chain() {
        let api = HostClientApi::new();
        assert_eq!(api.chain_info(), Err(ClientApiError::NoChain));
        assert_eq!(
            ClientApiError::NoChain.to_string(),
            "no chain is bound to the client API"
        );
    }

    #[test]
    fn bound_chain_is_described() {
        let info = ChainInfo {
            chain_id: "mars-1".to_owned(),
            app_path: "/src/mars".to_owned(),
            config_path: "/src/mars/config.yml".to_owned(),
            home: "/home/u/.mars".to_owned(),
            rpc_address: "127.0.0.1:26657".to_owned(),
        };
        let api = HostClientApi::new().with_chain(Arc::new(StaticChain(info.clone())));
        assert_eq!(api.chain_info(), Ok(info));
    }
}
