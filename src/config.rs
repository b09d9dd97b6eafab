use std::env;
use std::fmt;
use std::num::ParseFloatError;

const DEFAULT_SLIPPAGE_PCT: f64 = 1.0;

#[derive(Debug)]
pub enum RunMode {
    Dry,
    RealTrade,
}

#[derive(Debug)]
pub struct TraderApiConfig {
    pub wallet_address: String,
    pub api_key: Option<String>, // X-API-KEY header when the venue requires one
    pub slippage_pct: f64,
}

#[derive(Debug)]
pub enum ConfigError {
    ParseFloatError(ParseFloatError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseFloatError(e) => write!(f, "Parse float error: {}", e),
        }
    }
}

impl From<ParseFloatError> for ConfigError {
    fn from(err: ParseFloatError) -> ConfigError {
        ConfigError::ParseFloatError(err)
    }
}

pub fn get_trader_config_from_env(mode: RunMode) -> Result<TraderApiConfig, ConfigError> {
    let wallet_address = match mode {
        RunMode::Dry => env::var("TRADER_DRYRUN_WALLET_ADDRESS")
            .expect("TRADER_DRYRUN_WALLET_ADDRESS must be set"),
        RunMode::RealTrade => {
            env::var("TRADER_WALLET_ADDRESS").expect("TRADER_WALLET_ADDRESS must be set")
        }
    };

    let api_key = env::var("TRADER_API_KEY").ok().filter(|v| !v.is_empty());

    let slippage_pct = match env::var("TRADER_SLIPPAGE_PCT") {
        Ok(v) => v.parse::<f64>()?,
        Err(_) => DEFAULT_SLIPPAGE_PCT,
    };

    Ok(TraderApiConfig {
        wallet_address,
        api_key,
        slippage_pct,
    })
}
