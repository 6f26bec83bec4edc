use std::time::Duration;

use serde::Deserialize;

use crate::core::intercept::fee::FeePolicy;

pub const DEFAULT_CHANNEL_FEE_PERMYRIAD: u64 = 10;
pub const DEFAULT_CHANNEL_MINIMUM_FEE_MSAT: u64 = 2_000_000;
pub const DEFAULT_ADDITIONAL_CHANNEL_CAPACITY_SAT: u64 = 100_000;
pub const DEFAULT_PUBLIC_CHANNEL_AMOUNT_SAT: u64 = 1_000_183;
pub const DEFAULT_TARGET_CONF: u32 = 6;
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_OPEN_CHANNEL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Failed to parse config: {source}")]
    Parse {
        #[from]
        source: serde_json::Error,
    },
}

/// Settings of the interception engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptConfig {
    pub fee_policy: FeePolicy,
    /// Added on top of the incoming amount when sizing a new channel
    pub additional_channel_capacity_sat: u64,
    /// Capacity used for our public channels. JIT channels never use it.
    pub public_channel_amount_sat: u64,
    pub target_conf: u32,
    /// Bound on lookups, connectivity checks and persistence
    pub lookup_timeout: Duration,
    pub open_channel_timeout: Duration,
    /// Limit for a detached operator notification before it is dropped
    pub notify_timeout: Duration,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            fee_policy: FeePolicy::new(
                DEFAULT_CHANNEL_FEE_PERMYRIAD,
                DEFAULT_CHANNEL_MINIMUM_FEE_MSAT,
            ),
            additional_channel_capacity_sat: DEFAULT_ADDITIONAL_CHANNEL_CAPACITY_SAT,
            public_channel_amount_sat: DEFAULT_PUBLIC_CHANNEL_AMOUNT_SAT,
            target_conf: DEFAULT_TARGET_CONF,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            open_channel_timeout: DEFAULT_OPEN_CHANNEL_TIMEOUT,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }
}

impl InterceptConfig {
    /// Parses a JSON object whose keys match the `ConfigBuilder` setters.
    /// Missing keys fall back to the defaults.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigValidationError> {
        let raw: RawConfig = serde_json::from_str(s)?;
        raw.into_builder().build()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    channel_fee_permyriad: Option<i64>,
    channel_minimum_fee_msat: Option<i64>,
    additional_channel_capacity_sat: Option<i64>,
    public_channel_amount_sat: Option<i64>,
    target_conf: Option<i64>,
    lookup_timeout_secs: Option<i64>,
    open_channel_timeout_secs: Option<i64>,
    notify_timeout_secs: Option<i64>,
}

impl RawConfig {
    fn into_builder(self) -> ConfigBuilder {
        ConfigBuilder::new()
            .channel_fee_permyriad(self.channel_fee_permyriad)
            .channel_minimum_fee_msat(self.channel_minimum_fee_msat)
            .additional_channel_capacity_sat(self.additional_channel_capacity_sat)
            .public_channel_amount_sat(self.public_channel_amount_sat)
            .target_conf(self.target_conf)
            .lookup_timeout_secs(self.lookup_timeout_secs)
            .open_channel_timeout_secs(self.open_channel_timeout_secs)
            .notify_timeout_secs(self.notify_timeout_secs)
    }
}

// Validation builder, unset fields take their defaults
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    channel_fee_permyriad: Option<i64>,
    channel_minimum_fee_msat: Option<i64>,
    additional_channel_capacity_sat: Option<i64>,
    public_channel_amount_sat: Option<i64>,
    target_conf: Option<i64>,
    lookup_timeout_secs: Option<i64>,
    open_channel_timeout_secs: Option<i64>,
    notify_timeout_secs: Option<i64>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_fee_permyriad(mut self, value: Option<i64>) -> Self {
        self.channel_fee_permyriad = value;
        self
    }

    pub fn channel_minimum_fee_msat(mut self, value: Option<i64>) -> Self {
        self.channel_minimum_fee_msat = value;
        self
    }

    pub fn additional_channel_capacity_sat(mut self, value: Option<i64>) -> Self {
        self.additional_channel_capacity_sat = value;
        self
    }

    pub fn public_channel_amount_sat(mut self, value: Option<i64>) -> Self {
        self.public_channel_amount_sat = value;
        self
    }

    pub fn target_conf(mut self, value: Option<i64>) -> Self {
        self.target_conf = value;
        self
    }

    pub fn lookup_timeout_secs(mut self, value: Option<i64>) -> Self {
        self.lookup_timeout_secs = value;
        self
    }

    pub fn open_channel_timeout_secs(mut self, value: Option<i64>) -> Self {
        self.open_channel_timeout_secs = value;
        self
    }

    pub fn notify_timeout_secs(mut self, value: Option<i64>) -> Self {
        self.notify_timeout_secs = value;
        self
    }

    pub fn build(self) -> Result<InterceptConfig, ConfigValidationError> {
        let defaults = InterceptConfig::default();

        let fee_permyriad = match self.channel_fee_permyriad {
            Some(v) => {
                let v = non_negative("channel_fee_permyriad", v)?;
                if v > 10_000 {
                    return Err(ConfigValidationError::InvalidValue {
                        field: "channel_fee_permyriad",
                        reason: "must be <= 10000".to_string(),
                    });
                }
                v
            }
            None => defaults.fee_policy.fee_permyriad,
        };

        let minimum_fee_msat = match self.channel_minimum_fee_msat {
            Some(v) => non_negative("channel_minimum_fee_msat", v)?,
            None => defaults.fee_policy.minimum_fee_msat,
        };

        let additional_channel_capacity_sat = match self.additional_channel_capacity_sat {
            Some(v) => non_negative("additional_channel_capacity_sat", v)?,
            None => defaults.additional_channel_capacity_sat,
        };

        let public_channel_amount_sat = match self.public_channel_amount_sat {
            Some(v) => non_negative("public_channel_amount_sat", v)?,
            None => defaults.public_channel_amount_sat,
        };

        let target_conf = match self.target_conf {
            Some(v) => {
                if v <= 0 {
                    return Err(ConfigValidationError::InvalidValue {
                        field: "target_conf",
                        reason: "must be positive".to_string(),
                    });
                }
                u32::try_from(v).map_err(|_| ConfigValidationError::InvalidValue {
                    field: "target_conf",
                    reason: format!("must be <= {}", u32::MAX),
                })?
            }
            None => defaults.target_conf,
        };

        let lookup_timeout = match self.lookup_timeout_secs {
            Some(v) => positive_secs("lookup_timeout_secs", v)?,
            None => defaults.lookup_timeout,
        };

        let open_channel_timeout = match self.open_channel_timeout_secs {
            Some(v) => positive_secs("open_channel_timeout_secs", v)?,
            None => defaults.open_channel_timeout,
        };

        let notify_timeout = match self.notify_timeout_secs {
            Some(v) => positive_secs("notify_timeout_secs", v)?,
            None => defaults.notify_timeout,
        };

        Ok(InterceptConfig {
            fee_policy: FeePolicy::new(fee_permyriad, minimum_fee_msat),
            additional_channel_capacity_sat,
            public_channel_amount_sat,
            target_conf,
            lookup_timeout,
            open_channel_timeout,
            notify_timeout,
        })
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<u64, ConfigValidationError> {
    u64::try_from(value).map_err(|_| ConfigValidationError::InvalidValue {
        field,
        reason: "must be non-negative".to_string(),
    })
}

fn positive_secs(field: &'static str, value: i64) -> Result<Duration, ConfigValidationError> {
    if value <= 0 {
        return Err(ConfigValidationError::InvalidValue {
            field,
            reason: "must be positive".to_string(),
        });
    }
    Ok(Duration::from_secs(value as u64))
}
