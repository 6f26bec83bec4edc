pub mod engine;
pub mod fee;
pub mod locks;
pub mod onion;
pub mod provider;
pub mod provisioner;

pub use engine::{InterceptError, InterceptVerdict, InterceptionEngine, PeerReachability};
