pub mod nat;
pub mod private;
pub mod proxy;
pub mod relay;
pub mod rule;
pub mod sniff;

pub use nat::NatMap;
pub use private::PrivateNetworks;
pub use rule::{Handler, RedirectRule, RuleError};
