//! Network parameters: magic bytes, genesis blocks, proof-of-work limits,
//! deployment schedules, and checkpoints.

use crate::block::{Block, BlockHeader};
use crate::constants::{COIN, HALVING_INTERVAL, RETARGET_INTERVAL, TARGET_SPACING};
use crate::hash::Hash256;
use crate::merkle;
use crate::pow::U256;
use crate::tx::{OutPoint, TxBuilder};

/// Which chain this node follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network: min-difficulty blocks allowed after 20 minutes.
    Testnet,
    /// Local regression-test network: trivial difficulty, no retargeting.
    Regtest,
}

impl Network {
    /// Four-byte message-start magic.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Self::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Self::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8333,
            Self::Testnet => 18333,
            Self::Regtest => 18444,
        }
    }
}

/// A versionbits deployment window (BIP9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployment {
    pub name: &'static str,
    /// Version bit asserted while signalling.
    pub bit: u8,
    /// Median-time-past at which signalling may begin.
    pub start_time: u64,
    /// Median-time-past after which a non-locked-in deployment fails.
    pub timeout: u64,
}

impl Deployment {
    /// Start/timeout sentinel meaning "always active".
    pub const ALWAYS_ACTIVE: u64 = 0;
    /// Timeout sentinel meaning "no timeout".
    pub const NO_TIMEOUT: u64 = u64::MAX;
}

/// Consensus-relevant configuration for one network.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],

    /// Highest acceptable proof-of-work target.
    pub pow_limit: U256,
    /// Compact form of `pow_limit`.
    pub pow_limit_bits: u32,
    /// Blocks per difficulty retarget window.
    pub retarget_interval: u32,
    /// Target seconds between blocks.
    pub target_spacing: u32,
    /// Allow a min-difficulty block when spacing exceeds 2× the target.
    pub allow_min_difficulty: bool,
    /// Skip retargeting entirely (regtest).
    pub no_retarget: bool,

    pub halving_interval: u32,

    /// Heights at which buried deployments activate.
    pub bip34_height: u32,
    pub bip65_height: u32,
    pub bip66_height: u32,
    pub csv_height: u32,
    pub segwit_height: u32,

    /// Heights exempt from the BIP30 duplicate-txid rule, with the hashes of
    /// the historical blocks that triggered the exemptions.
    pub bip30_exceptions: &'static [(u32, &'static str)],

    /// Versionbits deployments still using signalling.
    pub deployments: &'static [Deployment],
    /// Signalling blocks required per window to lock in.
    pub versionbits_threshold: u32,

    /// `(height, hash)` pairs a valid chain must pass through.
    pub checkpoints: Vec<(u32, Hash256)>,

    /// Never prune blocks at or below this height.
    pub prune_after_height: u32,
    /// Number of most-recent blocks a pruning node retains.
    pub keep_blocks: u32,
}

const MAINNET_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
];

const TESTNET_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
];

const MAINNET_CHECKPOINTS: &[(u32, &str)] = &[
    (11_111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
    (33_333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
    (74_000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
    (105_000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
    (134_444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
    (168_000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
];

const MAINNET_BIP30_EXCEPTIONS: &[(u32, &str)] = &[
    (91_842, "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
    (91_880, "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
];

const REGTEST_DEPLOYMENTS: &[Deployment] = &[Deployment {
    name: "testdummy",
    bit: 28,
    start_time: Deployment::ALWAYS_ACTIVE,
    timeout: Deployment::NO_TIMEOUT,
}];

impl NetworkParams {
    pub fn new(network: Network) -> Self {
        let checkpoints = |table: &[(u32, &str)]| {
            table
                .iter()
                .map(|(height, hex)| (*height, Hash256::from_hex(hex).expect("checkpoint hex")))
                .collect()
        };
        match network {
            Network::Mainnet => Self {
                network,
                magic: network.magic(),
                default_port: network.default_port(),
                dns_seeds: MAINNET_SEEDS,
                pow_limit: U256::from_compact(0x1d00ffff).0,
                pow_limit_bits: 0x1d00ffff,
                retarget_interval: RETARGET_INTERVAL,
                target_spacing: TARGET_SPACING,
                allow_min_difficulty: false,
                no_retarget: false,
                halving_interval: HALVING_INTERVAL,
                bip34_height: 227_931,
                bip65_height: 388_381,
                bip66_height: 363_725,
                csv_height: 419_328,
                segwit_height: 481_824,
                bip30_exceptions: MAINNET_BIP30_EXCEPTIONS,
                deployments: &[],
                versionbits_threshold: 1916,
                checkpoints: checkpoints(MAINNET_CHECKPOINTS),
                prune_after_height: 1000,
                keep_blocks: 288,
            },
            Network::Testnet => Self {
                network,
                magic: network.magic(),
                default_port: network.default_port(),
                dns_seeds: TESTNET_SEEDS,
                pow_limit: U256::from_compact(0x1d00ffff).0,
                pow_limit_bits: 0x1d00ffff,
                retarget_interval: RETARGET_INTERVAL,
                target_spacing: TARGET_SPACING,
                allow_min_difficulty: true,
                no_retarget: false,
                halving_interval: HALVING_INTERVAL,
                bip34_height: 21_111,
                bip65_height: 581_885,
                bip66_height: 330_776,
                csv_height: 770_112,
                segwit_height: 834_624,
                bip30_exceptions: &[],
                deployments: &[],
                versionbits_threshold: 1512,
                checkpoints: Vec::new(),
                prune_after_height: 1000,
                keep_blocks: 288,
            },
            Network::Regtest => Self {
                network,
                magic: network.magic(),
                default_port: network.default_port(),
                dns_seeds: &[],
                pow_limit: U256::from_compact(0x207fffff).0,
                pow_limit_bits: 0x207fffff,
                retarget_interval: RETARGET_INTERVAL,
                target_spacing: TARGET_SPACING,
                allow_min_difficulty: true,
                no_retarget: true,
                halving_interval: 150,
                bip34_height: 0,
                bip65_height: 0,
                bip66_height: 0,
                csv_height: 0,
                segwit_height: 0,
                bip30_exceptions: &[],
                deployments: REGTEST_DEPLOYMENTS,
                versionbits_threshold: 108,
                checkpoints: Vec::new(),
                prune_after_height: 1000,
                keep_blocks: 288,
            },
        }
    }

    /// Build the genesis block for this network.
    pub fn genesis_block(&self) -> Block {
        let (time, nonce, bits) = match self.network {
            Network::Mainnet => (1_231_006_505, 2_083_236_893, 0x1d00ffffu32),
            Network::Testnet => (1_296_688_602, 414_098_458, 0x1d00ffff),
            Network::Regtest => (1_296_688_602, 2, 0x207fffff),
        };

        // "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks"
        let message: &[u8] =
            b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
        let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, 0x45];
        script_sig.extend_from_slice(message);

        let pubkey: [u8; 65] = [
            0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71,
            0x30, 0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0,
            0xea, 0x1f, 0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3,
            0x55, 0x04, 0xe5, 0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d,
            0x57, 0x8a, 0x4c, 0x70, 0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
        ];
        let mut script_pubkey = vec![0x41];
        script_pubkey.extend_from_slice(&pubkey);
        script_pubkey.push(0xac); // OP_CHECKSIG

        let coinbase = TxBuilder::new()
            .input(OutPoint::null(), script_sig, 0xffff_ffff)
            .output(50 * COIN, script_pubkey)
            .finalize();

        let (merkle_root, _) = merkle::block_merkle_root(std::slice::from_ref(&coinbase));
        Block {
            header: BlockHeader {
                version: 1,
                prev: Hash256::ZERO,
                merkle_root,
                time,
                bits,
                nonce,
            },
            txs: vec![coinbase],
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_block().hash()
    }

    /// Checkpoint hash at an exact height, if any.
    pub fn checkpoint_at(&self, height: u32) -> Option<Hash256> {
        self.checkpoints
            .iter()
            .find(|(h, _)| *h == height)
            .map(|(_, hash)| *hash)
    }

    /// Height of the highest compiled-in checkpoint.
    pub fn last_checkpoint_height(&self) -> u32 {
        self.checkpoints.iter().map(|(h, _)| *h).max().unwrap_or(0)
    }

    /// Block subsidy at a height under this network's halving schedule.
    pub fn subsidy(&self, height: u32) -> i64 {
        let halvings = height / self.halving_interval;
        if halvings >= 64 {
            return 0;
        }
        (50 * COIN) >> halvings
    }

    /// Whether a height/hash pair is exempt from BIP30.
    pub fn is_bip30_exception(&self, height: u32, hash: &Hash256) -> bool {
        self.bip30_exceptions.iter().any(|(h, hex)| {
            *h == height && Hash256::from_hex(hex).map(|e| e == *hash).unwrap_or(false)
        })
    }
}
