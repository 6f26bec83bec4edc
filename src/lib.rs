pub mod cln_adapters;
pub mod core;
pub mod options;
pub mod proto;
