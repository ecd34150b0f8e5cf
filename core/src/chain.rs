use std::collections::HashMap;

use alloy::providers::RootProvider;
use alloy::transports::http::reqwest::Url;

use crate::error::RelayError;
use crate::rpc_clients::BundlerClient;

/// One chain the relay can broadcast to: a JSON-RPC node plus, for
/// account-abstraction senders, a bundler endpoint.
pub trait Chain: Send + Sync {
    fn chain_id(&self) -> u64;
    fn rpc_url(&self) -> Url;
    fn bundler_url(&self) -> Url;

    fn provider(&self) -> &RootProvider;
    fn bundler_client(&self) -> &BundlerClient;
}

pub struct RpcChainConfig<'a> {
    pub chain_id: u64,
    pub rpc_url: &'a str,
    pub bundler_url: &'a str,
}

#[derive(Clone)]
pub struct RpcChain {
    chain_id: u64,
    rpc_url: Url,
    bundler_url: Url,
    provider: RootProvider,
    bundler_client: BundlerClient,
}

impl RpcChainConfig<'_> {
    pub fn to_chain(&self) -> Result<RpcChain, RelayError> {
        let rpc_url: Url = self
            .rpc_url
            .parse()
            .map_err(|e| RelayError::RpcConfigError {
                message: format!("invalid RPC URL '{}': {e}", self.rpc_url),
            })?;
        let bundler_url: Url =
            self.bundler_url
                .parse()
                .map_err(|e| RelayError::RpcConfigError {
                    message: format!("invalid bundler URL '{}': {e}", self.bundler_url),
                })?;

        Ok(RpcChain {
            chain_id: self.chain_id,
            provider: RootProvider::new_http(rpc_url.clone()),
            bundler_client: BundlerClient::new(bundler_url.clone()),
            rpc_url,
            bundler_url,
        })
    }
}

impl Chain for RpcChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn rpc_url(&self) -> Url {
        self.rpc_url.clone()
    }

    fn bundler_url(&self) -> Url {
        self.bundler_url.clone()
    }

    fn provider(&self) -> &RootProvider {
        &self.provider
    }

    fn bundler_client(&self) -> &BundlerClient {
        &self.bundler_client
    }
}

/// Resolves a chain ID to a configured [`Chain`]. Constructed explicitly and
/// passed into workers; there is no ambient registry.
pub trait ChainService: Send + Sync {
    type Chain: Chain + Clone;

    fn get_chain(&self, chain_id: u64) -> Result<Self::Chain, RelayError>;
}

/// Fixed set of chains loaded at startup.
pub struct StaticChainService {
    chains: HashMap<u64, RpcChain>,
}

impl StaticChainService {
    pub fn new(configs: &[RpcChainConfig<'_>]) -> Result<Self, RelayError> {
        let mut chains = HashMap::with_capacity(configs.len());
        for config in configs {
            chains.insert(config.chain_id, config.to_chain()?);
        }
        Ok(Self { chains })
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chains.keys().copied()
    }
}

impl ChainService for StaticChainService {
    type Chain = RpcChain;

    fn get_chain(&self, chain_id: u64) -> Result<RpcChain, RelayError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| RelayError::RpcConfigError {
                message: format!("chain {chain_id} is not configured"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_chain_service_rejects_unknown_chains() {
        let service = StaticChainService::new(&[RpcChainConfig {
            chain_id: 137,
            rpc_url: "http://localhost:8545",
            bundler_url: "http://localhost:4337",
        }])
        .unwrap();

        assert!(service.get_chain(137).is_ok());
        assert!(matches!(
            service.get_chain(1),
            Err(RelayError::RpcConfigError { .. })
        ));
    }

    #[test]
    fn invalid_urls_fail_configuration() {
        let result = StaticChainService::new(&[RpcChainConfig {
            chain_id: 1,
            rpc_url: "not a url",
            bundler_url: "http://localhost:4337",
        }]);
        assert!(matches!(result, Err(RelayError::RpcConfigError { .. })));
    }
}
