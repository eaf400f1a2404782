pub mod bundle_proposer;
pub mod bundle_sender;
pub mod relayer;
pub mod signer;

pub use bundle_proposer::{Bundle, BundleProposer, BundleProposerImpl};
pub use bundle_sender::{
    BundleSenderImpl, BundleTrigger, SendBundleRequest, SendBundleResult, Settings as BundleSenderSettings,
};
pub use relayer::{BundleRelayer, RelayError, Relayer};
pub use signer::LocalSigner;
