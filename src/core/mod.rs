pub mod intercept;
pub mod tlv;
