//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use kestrel_chain::store::StoreOptions;
use kestrel_core::params::Network;
use kestrel_mempool::MempoolOptions;
use kestrel_net::pool::PoolOptions;

/// Non-consensus knobs for one node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    pub datadir: PathBuf,
    /// Listen address; `None` disables inbound connections.
    pub listen: Option<SocketAddr>,
    /// Outbound peers to dial at startup.
    pub connect: Vec<SocketAddr>,
    pub store: StoreOptions,
    pub mempool: MempoolOptions,
    pub pool: PoolOptions,
}

impl NodeConfig {
    pub fn new(network: Network, datadir: impl Into<PathBuf>) -> Self {
        Self {
            network,
            datadir: datadir.into(),
            listen: None,
            connect: Vec::new(),
            store: StoreOptions::default(),
            mempool: MempoolOptions::default(),
            pool: PoolOptions::default(),
        }
    }

    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    pub fn connect(mut self, addr: SocketAddr) -> Self {
        self.connect.push(addr);
        self
    }

    /// Headers-only chain without block bodies or coins.
    pub fn spv(mut self) -> Self {
        self.store.spv = true;
        self
    }

    /// Database subdirectory for the chain store.
    pub fn chain_dir(&self) -> PathBuf {
        let suffix = match self.network {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        self.datadir.join(suffix).join("chain")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = NodeConfig::new(Network::Regtest, "/tmp/kestrel")
            .listen("127.0.0.1:18444".parse().unwrap())
            .connect("127.0.0.1:18555".parse().unwrap())
            .spv();
        assert!(config.store.spv);
        assert_eq!(config.connect.len(), 1);
        assert!(config.chain_dir().ends_with("regtest/chain"));
    }
}
