//! Per-network chain parameters.
//!
//! Only the parameters the transaction-acceptance core consults are kept
//! here: the hard-fork schedule that gates script-flag selection and the
//! sanity rules derived from it.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet3,
    Testnet4,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet3 => "testnet3",
            Network::Testnet4 => "testnet4",
            Network::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ChainParams {
    pub network: Network,

    /// November 2018 hardfork height.
    pub magnetic_anomaly_fork_height: i32,

    /// May 2023 hardfork height (cash tokens).
    pub upgrade9_fork_height: i32,

    /// May 2025 hardfork activation, as a median-time-past timestamp.
    pub upgrade11_activation_time: u64,
}

impl ChainParams {
    /// The upgrade gates compare against the height the transaction would
    /// confirm at, exclusive of the fork block itself.
    pub fn magnetic_anomaly_active(&self, next_height: i32) -> bool {
        next_height > self.magnetic_anomaly_fork_height
    }

    pub fn upgrade9_active(&self, next_height: i32) -> bool {
        next_height > self.upgrade9_fork_height
    }

    pub fn upgrade11_active(&self, median_time_past: i64) -> bool {
        median_time_past >= self.upgrade11_activation_time as i64
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            magnetic_anomaly_fork_height: 556_766,
            upgrade9_fork_height: 792_772,
            upgrade11_activation_time: 1_747_310_400,
        },
        Network::Testnet3 => ChainParams {
            network,
            magnetic_anomaly_fork_height: 1_267_996,
            upgrade9_fork_height: 1_552_787,
            upgrade11_activation_time: 1_747_310_400,
        },
        Network::Testnet4 => ChainParams {
            network,
            magnetic_anomaly_fork_height: 3_999,
            upgrade9_fork_height: 148_043,
            upgrade11_activation_time: 1_747_310_400,
        },
        Network::Regtest => ChainParams {
            network,
            magnetic_anomaly_fork_height: 1_000,
            upgrade9_fork_height: 100_000_000,
            upgrade11_activation_time: 0,
        },
    }
}
