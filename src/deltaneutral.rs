use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use crate::config::{get_trader_config_from_env, RunMode};
use crate::feed::FeedClient;
use crate::gateway::{ExchangeGateway, OrderRequest, OrderSide, PendingOrder};
use crate::pairs;
use crate::ports::paper_dex::PaperConnector;
use crate::schedule;
use crate::strategy::{self, EntryDirection};
use crate::trade::execution::rest_gateway::RestGateway;

const DEFAULT_REST_ENDPOINT: &str = "https://api.avantisfi.com";
const DEFAULT_FEED_ENDPOINT: &str = "https://feed.avantisfi.com";
const DEFAULT_PAIR_NAME: &str = "BTC/USD";
const DEFAULT_POSITION_SIZE_USDC: f64 = 10.0;
const DEFAULT_LEVERAGE: u32 = 75;
const DEFAULT_COLLATERAL_VARIANCE: f64 = 0.05;
const DEFAULT_COLLATERAL_STEP: f64 = 0.5;
const DEFAULT_TAKE_PROFIT_PNL: f64 = 0.80;
const DEFAULT_STOP_LOSS_PNL: f64 = 0.80;
const DEFAULT_ENTRY_OFFSET_MIN: f64 = 0.0025;
const DEFAULT_ENTRY_OFFSET_MAX: f64 = 0.01;
const DEFAULT_REPOSITION_THRESHOLD_PCT: f64 = 0.01;
const DEFAULT_REPOSITION_RANDOM: f64 = 0.002;
const DEFAULT_CHECK_INTERVAL_MIN_SECS: u64 = 10;
const DEFAULT_CHECK_INTERVAL_MAX_SECS: u64 = 30;
const DEFAULT_TRADING_START_HOUR: u32 = 8;
const DEFAULT_TRADING_END_HOUR: u32 = 24;
const DEFAULT_TRADING_HOURS_VARIANCE_MIN: u32 = 15;
const DEFAULT_TZ_OFFSET_SECS: i32 = 3 * 3600;
const DEFAULT_CYCLE_PAUSE_MIN_SECS: u64 = 3;
const DEFAULT_CYCLE_PAUSE_MAX_SECS: u64 = 8;
const WINDOW_POLL_SECS: u64 = 60;
const ORDER_STATUS_EVERY_SECS: u64 = 60;
const POSITION_STATUS_EVERY_SECS: u64 = 120;
const LEG_PAUSE_MIN_SECS: f64 = 2.0;
const LEG_PAUSE_MAX_SECS: f64 = 4.0;
const CANCEL_PAUSE_MIN_SECS: f64 = 1.0;
const CANCEL_PAUSE_MAX_SECS: f64 = 2.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct DeltaNeutralYaml {
    rest_endpoint: Option<String>,
    feed_endpoint: Option<String>,
    dry_run: Option<bool>,
    pair_name: Option<String>,
    pair_index: Option<u16>,
    position_size_usdc: Option<f64>,
    leverage: Option<u32>,
    collateral_variance: Option<f64>,
    collateral_step: Option<f64>,
    take_profit_pnl: Option<f64>,
    stop_loss_pnl: Option<f64>,
    entry_offset_min: Option<f64>,
    entry_offset_max: Option<f64>,
    reposition_threshold_pct: Option<f64>,
    reposition_random: Option<f64>,
    check_interval_min_secs: Option<u64>,
    check_interval_max_secs: Option<u64>,
    trading_start_hour: Option<u32>,
    trading_end_hour: Option<u32>,
    trading_hours_variance_min: Option<u32>,
    tz_offset_secs: Option<i32>,
    cycle_pause_min_secs: Option<u64>,
    cycle_pause_max_secs: Option<u64>,
    rng_seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DeltaNeutralConfig {
    pub rest_endpoint: String,
    pub feed_endpoint: String,
    pub dry_run: bool,
    pub pair_name: String,
    pub pair_index: u16,
    pub position_size_usdc: f64,
    pub leverage: u32,
    pub collateral_variance: f64,
    pub collateral_step: f64,
    pub take_profit_pnl: f64,
    pub stop_loss_pnl: f64,
    pub entry_offset_min: f64,
    pub entry_offset_max: f64,
    pub reposition_threshold_pct: f64,
    pub reposition_random: f64,
    pub check_interval_min_secs: u64,
    pub check_interval_max_secs: u64,
    pub trading_start_hour: u32,
    pub trading_end_hour: u32,
    pub trading_hours_variance_min: u32,
    pub tz_offset: FixedOffset,
    pub cycle_pause_min_secs: u64,
    pub cycle_pause_max_secs: u64,
    pub rng_seed: Option<u64>,
}

fn fixed_offset_from_secs(secs: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(secs).ok_or_else(|| anyhow!("invalid timezone offset: {} seconds", secs))
}

impl DeltaNeutralConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("DELTANEUTRAL_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| {
                env::var("DNBOT_CONFIG")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
            });
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).with_context(|| {
            format!("failed to open delta-neutral config {}", path_ref.display())
        })?;
        let yaml: DeltaNeutralYaml = serde_yaml::from_reader(file).with_context(|| {
            format!("failed to parse delta-neutral config {}", path_ref.display())
        })?;

        let pair_name = yaml
            .pair_name
            .unwrap_or_else(|| DEFAULT_PAIR_NAME.to_string());
        let pair_index = match yaml.pair_index {
            Some(index) => index,
            None => pairs::pair_index(&pair_name)
                .ok_or_else(|| anyhow!("unknown trading pair: {}", pair_name))?,
        };
        let tz_offset_secs = yaml.tz_offset_secs.unwrap_or(DEFAULT_TZ_OFFSET_SECS);

        let mut cfg = DeltaNeutralConfig {
            rest_endpoint: yaml
                .rest_endpoint
                .unwrap_or_else(|| DEFAULT_REST_ENDPOINT.to_string()),
            feed_endpoint: yaml
                .feed_endpoint
                .unwrap_or_else(|| DEFAULT_FEED_ENDPOINT.to_string()),
            dry_run: yaml.dry_run.unwrap_or(true),
            pair_name,
            pair_index,
            position_size_usdc: yaml
                .position_size_usdc
                .unwrap_or(DEFAULT_POSITION_SIZE_USDC),
            leverage: yaml.leverage.unwrap_or(DEFAULT_LEVERAGE),
            collateral_variance: yaml
                .collateral_variance
                .unwrap_or(DEFAULT_COLLATERAL_VARIANCE),
            collateral_step: yaml.collateral_step.unwrap_or(DEFAULT_COLLATERAL_STEP),
            take_profit_pnl: yaml.take_profit_pnl.unwrap_or(DEFAULT_TAKE_PROFIT_PNL),
            stop_loss_pnl: yaml.stop_loss_pnl.unwrap_or(DEFAULT_STOP_LOSS_PNL),
            entry_offset_min: yaml.entry_offset_min.unwrap_or(DEFAULT_ENTRY_OFFSET_MIN),
            entry_offset_max: yaml.entry_offset_max.unwrap_or(DEFAULT_ENTRY_OFFSET_MAX),
            reposition_threshold_pct: yaml
                .reposition_threshold_pct
                .unwrap_or(DEFAULT_REPOSITION_THRESHOLD_PCT),
            reposition_random: yaml.reposition_random.unwrap_or(DEFAULT_REPOSITION_RANDOM),
            check_interval_min_secs: yaml
                .check_interval_min_secs
                .unwrap_or(DEFAULT_CHECK_INTERVAL_MIN_SECS),
            check_interval_max_secs: yaml
                .check_interval_max_secs
                .unwrap_or(DEFAULT_CHECK_INTERVAL_MAX_SECS),
            trading_start_hour: yaml
                .trading_start_hour
                .unwrap_or(DEFAULT_TRADING_START_HOUR),
            trading_end_hour: yaml.trading_end_hour.unwrap_or(DEFAULT_TRADING_END_HOUR),
            trading_hours_variance_min: yaml
                .trading_hours_variance_min
                .unwrap_or(DEFAULT_TRADING_HOURS_VARIANCE_MIN),
            tz_offset: fixed_offset_from_secs(tz_offset_secs)?,
            cycle_pause_min_secs: yaml
                .cycle_pause_min_secs
                .unwrap_or(DEFAULT_CYCLE_PAUSE_MIN_SECS),
            cycle_pause_max_secs: yaml
                .cycle_pause_max_secs
                .unwrap_or(DEFAULT_CYCLE_PAUSE_MAX_SECS),
            rng_seed: yaml.rng_seed,
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let rest_endpoint =
            env::var("REST_ENDPOINT").unwrap_or_else(|_| DEFAULT_REST_ENDPOINT.to_string());
        let feed_endpoint =
            env::var("FEED_ENDPOINT").unwrap_or_else(|_| DEFAULT_FEED_ENDPOINT.to_string());
        let dry_run = env::var("DRY_RUN")
            .unwrap_or_else(|_| "true".to_string())
            .to_lowercase()
            == "true";
        let pair_name = env::var("PAIR_NAME")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_PAIR_NAME.to_string());
        let pair_index = match env::var("PAIR_INDEX").ok().and_then(|v| v.parse().ok()) {
            Some(index) => index,
            None => pairs::pair_index(&pair_name)
                .ok_or_else(|| anyhow!("unknown trading pair: {}", pair_name))?,
        };
        let position_size_usdc = env::var("POSITION_SIZE_USDC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_POSITION_SIZE_USDC);
        let leverage = env::var("LEVERAGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LEVERAGE);
        let collateral_variance = env::var("COLLATERAL_VARIANCE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_COLLATERAL_VARIANCE);
        let collateral_step = env::var("COLLATERAL_STEP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_COLLATERAL_STEP);
        let take_profit_pnl = env::var("TAKE_PROFIT_PNL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TAKE_PROFIT_PNL);
        let stop_loss_pnl = env::var("STOP_LOSS_PNL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_STOP_LOSS_PNL);
        let entry_offset_min = env::var("ENTRY_OFFSET_MIN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ENTRY_OFFSET_MIN);
        let entry_offset_max = env::var("ENTRY_OFFSET_MAX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ENTRY_OFFSET_MAX);
        let reposition_threshold_pct = env::var("REPOSITION_THRESHOLD_PCT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REPOSITION_THRESHOLD_PCT);
        let reposition_random = env::var("REPOSITION_RANDOM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REPOSITION_RANDOM);
        let check_interval_min_secs = env::var("CHECK_INTERVAL_MIN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CHECK_INTERVAL_MIN_SECS);
        let check_interval_max_secs = env::var("CHECK_INTERVAL_MAX_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CHECK_INTERVAL_MAX_SECS);
        let trading_start_hour = env::var("TRADING_START_HOUR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TRADING_START_HOUR);
        let trading_end_hour = env::var("TRADING_END_HOUR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TRADING_END_HOUR);
        let trading_hours_variance_min = env::var("TRADING_HOURS_VARIANCE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TRADING_HOURS_VARIANCE_MIN);
        let tz_offset_secs = env::var("TZ_OFFSET_SECS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(DEFAULT_TZ_OFFSET_SECS);
        let cycle_pause_min_secs = env::var("CYCLE_PAUSE_MIN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CYCLE_PAUSE_MIN_SECS);
        let cycle_pause_max_secs = env::var("CYCLE_PAUSE_MAX_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CYCLE_PAUSE_MAX_SECS);
        let rng_seed = env::var("RNG_SEED").ok().and_then(|v| v.parse().ok());

        let cfg = Self {
            rest_endpoint,
            feed_endpoint,
            dry_run,
            pair_name,
            pair_index,
            position_size_usdc,
            leverage,
            collateral_variance,
            collateral_step,
            take_profit_pnl,
            stop_loss_pnl,
            entry_offset_min,
            entry_offset_max,
            reposition_threshold_pct,
            reposition_random,
            check_interval_min_secs,
            check_interval_max_secs,
            trading_start_hour,
            trading_end_hour,
            trading_hours_variance_min,
            tz_offset: fixed_offset_from_secs(tz_offset_secs)?,
            cycle_pause_min_secs,
            cycle_pause_max_secs,
            rng_seed,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("REST_ENDPOINT") {
            if !value.trim().is_empty() {
                self.rest_endpoint = value;
            }
        }
        if let Ok(value) = env::var("FEED_ENDPOINT") {
            if !value.trim().is_empty() {
                self.feed_endpoint = value;
            }
        }
        if let Ok(value) = env::var("DRY_RUN") {
            self.dry_run = value.to_lowercase() == "true";
        }
        let mut pair_name_overridden = false;
        if let Ok(value) = env::var("PAIR_NAME") {
            if !value.trim().is_empty() {
                self.pair_name = value;
                pair_name_overridden = true;
            }
        }
        let mut pair_index_overridden = false;
        if let Ok(value) = env::var("PAIR_INDEX") {
            if let Ok(parsed) = value.parse() {
                self.pair_index = parsed;
                pair_index_overridden = true;
            }
        }
        if pair_name_overridden && !pair_index_overridden {
            self.pair_index = pairs::pair_index(&self.pair_name)
                .ok_or_else(|| anyhow!("unknown trading pair: {}", self.pair_name))?;
        }
        if let Ok(value) = env::var("POSITION_SIZE_USDC") {
            if let Ok(parsed) = value.parse() {
                self.position_size_usdc = parsed;
            }
        }
        if let Ok(value) = env::var("LEVERAGE") {
            if let Ok(parsed) = value.parse() {
                self.leverage = parsed;
            }
        }
        if let Ok(value) = env::var("COLLATERAL_VARIANCE") {
            if let Ok(parsed) = value.parse() {
                self.collateral_variance = parsed;
            }
        }
        if let Ok(value) = env::var("COLLATERAL_STEP") {
            if let Ok(parsed) = value.parse() {
                self.collateral_step = parsed;
            }
        }
        if let Ok(value) = env::var("TAKE_PROFIT_PNL") {
            if let Ok(parsed) = value.parse() {
                self.take_profit_pnl = parsed;
            }
        }
        if let Ok(value) = env::var("STOP_LOSS_PNL") {
            if let Ok(parsed) = value.parse() {
                self.stop_loss_pnl = parsed;
            }
        }
        if let Ok(value) = env::var("ENTRY_OFFSET_MIN") {
            if let Ok(parsed) = value.parse() {
                self.entry_offset_min = parsed;
            }
        }
        if let Ok(value) = env::var("ENTRY_OFFSET_MAX") {
            if let Ok(parsed) = value.parse() {
                self.entry_offset_max = parsed;
            }
        }
        if let Ok(value) = env::var("REPOSITION_THRESHOLD_PCT") {
            if let Ok(parsed) = value.parse() {
                self.reposition_threshold_pct = parsed;
            }
        }
        if let Ok(value) = env::var("REPOSITION_RANDOM") {
            if let Ok(parsed) = value.parse() {
                self.reposition_random = parsed;
            }
        }
        if let Ok(value) = env::var("CHECK_INTERVAL_MIN_SECS") {
            if let Ok(parsed) = value.parse() {
                self.check_interval_min_secs = parsed;
            }
        }
        if let Ok(value) = env::var("CHECK_INTERVAL_MAX_SECS") {
            if let Ok(parsed) = value.parse() {
                self.check_interval_max_secs = parsed;
            }
        }
        if let Ok(value) = env::var("TRADING_START_HOUR") {
            if let Ok(parsed) = value.parse() {
                self.trading_start_hour = parsed;
            }
        }
        if let Ok(value) = env::var("TRADING_END_HOUR") {
            if let Ok(parsed) = value.parse() {
                self.trading_end_hour = parsed;
            }
        }
        if let Ok(value) = env::var("TRADING_HOURS_VARIANCE") {
            if let Ok(parsed) = value.parse() {
                self.trading_hours_variance_min = parsed;
            }
        }
        if let Ok(value) = env::var("TZ_OFFSET_SECS") {
            if let Ok(parsed) = value.parse::<i32>() {
                self.tz_offset = fixed_offset_from_secs(parsed)?;
            }
        }
        if let Ok(value) = env::var("CYCLE_PAUSE_MIN_SECS") {
            if let Ok(parsed) = value.parse() {
                self.cycle_pause_min_secs = parsed;
            }
        }
        if let Ok(value) = env::var("CYCLE_PAUSE_MAX_SECS") {
            if let Ok(parsed) = value.parse() {
                self.cycle_pause_max_secs = parsed;
            }
        }
        if let Ok(value) = env::var("RNG_SEED") {
            if let Ok(parsed) = value.parse() {
                self.rng_seed = Some(parsed);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.leverage < 1 {
            return Err(anyhow!("leverage must be at least 1"));
        }
        if self.position_size_usdc <= 0.0 {
            return Err(anyhow!("position_size_usdc must be positive"));
        }
        if self.entry_offset_min < 0.0 || self.entry_offset_min > self.entry_offset_max {
            return Err(anyhow!("entry offset bounds must satisfy 0 <= min <= max"));
        }
        if self.check_interval_min_secs > self.check_interval_max_secs {
            return Err(anyhow!(
                "check_interval_min_secs must not exceed check_interval_max_secs"
            ));
        }
        if self.cycle_pause_min_secs > self.cycle_pause_max_secs {
            return Err(anyhow!(
                "cycle_pause_min_secs must not exceed cycle_pause_max_secs"
            ));
        }
        if self.trading_start_hour > 23 || self.trading_end_hour > 24 {
            return Err(anyhow!(
                "trading hours must satisfy start <= 23 and end <= 24"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    WaitWindow,
    Placing,
    MonitoringOrders,
    PositionsOpen,
    WindowClosedCleanup,
}

#[derive(Debug, Clone)]
struct Cycle {
    anchor_price: f64,
    entry_price: f64,
    direction: EntryDirection,
    offset: f64,
    collateral: f64,
    reposition_threshold: f64,
}

pub struct DeltaNeutralEngine {
    cfg: DeltaNeutralConfig,
    gateway: Arc<dyn ExchangeGateway + Send + Sync>,
    rng: StdRng,
    state: CycleState,
    cycle: Option<Cycle>,
    cycle_count: u64,
    last_order_status: Option<Instant>,
    last_position_status: Option<Instant>,
}

fn decimal_from(value: f64, what: &str) -> Result<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| anyhow!("{} {} does not convert to a decimal", what, value))
}

impl DeltaNeutralEngine {
    pub fn new(cfg: DeltaNeutralConfig) -> Result<Self> {
        let feed = Arc::new(FeedClient::new(&cfg.feed_endpoint));
        let run_mode = if cfg.dry_run {
            RunMode::Dry
        } else {
            RunMode::RealTrade
        };
        log::info!("[CONFIG] run mode: {:?}", run_mode);

        let gateway: Arc<dyn ExchangeGateway + Send + Sync> = if cfg.dry_run {
            Arc::new(PaperConnector::new(feed))
        } else {
            let trader = get_trader_config_from_env(run_mode)
                .map_err(|e| anyhow!("failed to load trader credentials: {}", e))?;
            Arc::new(
                RestGateway::create(&cfg.rest_endpoint, trader, feed)
                    .context("failed to initialize trading gateway")?,
            )
        };

        let rng = match cfg.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            cfg,
            gateway,
            rng,
            state: CycleState::WaitWindow,
            cycle: None,
            cycle_count: 0,
            last_order_status: None,
            last_position_status: None,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.prepare().await?;
        loop {
            if let Err(e) = self.step().await {
                log::error!("[CYCLE] cycle attempt failed: {:?}", e);
                self.cycle = None;
                self.state = CycleState::WaitWindow;
                self.sleep_check_interval().await;
            }
        }
    }

    async fn prepare(&mut self) -> Result<()> {
        let mode = if self.cfg.dry_run { "dry run" } else { "live" };
        log::info!(
            "[CONFIG] delta-neutral bot v{} ({})",
            env!("CARGO_PKG_VERSION"),
            mode
        );
        log::info!(
            "[CONFIG] pair: {} (index {}, {})",
            self.cfg.pair_name,
            self.cfg.pair_index,
            pairs::pair_category(&self.cfg.pair_name)
        );
        log::info!(
            "[CONFIG] margin {} USDC x{}, tp {}% / sl {}% on collateral",
            self.cfg.position_size_usdc,
            self.cfg.leverage,
            self.cfg.take_profit_pnl * 100.0,
            self.cfg.stop_loss_pnl * 100.0
        );
        log::info!(
            "[CONFIG] entry offset {:.2}%-{:.2}%, reposition {:.2}% +-{:.2}%",
            self.cfg.entry_offset_min * 100.0,
            self.cfg.entry_offset_max * 100.0,
            self.cfg.reposition_threshold_pct * 100.0,
            self.cfg.reposition_random * 100.0
        );
        log::info!(
            "[CONFIG] trading hours {:02}:00-{:02}:00 +-{}min, checks every {}-{}s",
            self.cfg.trading_start_hour,
            self.cfg.trading_end_hour,
            self.cfg.trading_hours_variance_min,
            self.cfg.check_interval_min_secs,
            self.cfg.check_interval_max_secs
        );

        if !self.cfg.dry_run {
            // Cover both legs of a cycle up front
            let allowance = decimal_from(self.cfg.position_size_usdc * 2.0, "allowance amount")?;
            self.gateway
                .ensure_allowance(allowance)
                .await
                .context("allowance check failed")?;
        }
        Ok(())
    }

    async fn step(&mut self) -> Result<()> {
        match self.state {
            CycleState::WaitWindow => self.step_wait_window().await,
            CycleState::Placing => self.step_place_orders().await,
            CycleState::MonitoringOrders => self.step_monitor_orders().await,
            CycleState::PositionsOpen => self.step_positions_open().await,
            CycleState::WindowClosedCleanup => self.step_cleanup().await,
        }
    }

    async fn step_wait_window(&mut self) -> Result<()> {
        if !self.window_open() {
            log::info!(
                "[WINDOW] outside trading hours, next check in {}s",
                WINDOW_POLL_SECS
            );
            sleep(Duration::from_secs(WINDOW_POLL_SECS)).await;
            return Ok(());
        }

        if !self.cfg.dry_run {
            // Pick up whatever an earlier run left behind before starting fresh
            let open = match self.gateway.get_open_trades().await {
                Ok(open) => open,
                Err(e) => {
                    log::warn!("[CYCLE] trade snapshot failed, retrying: {}", e);
                    self.sleep_check_interval().await;
                    return Ok(());
                }
            };
            if !open.positions.is_empty() {
                log::info!(
                    "[CYCLE] adopting {} open positions from a previous run",
                    open.positions.len()
                );
                self.cycle = None;
                self.last_position_status = None;
                self.state = CycleState::PositionsOpen;
                return Ok(());
            }
            if !open.pending.is_empty() {
                let price = match self.usable_price().await {
                    Some(price) => price,
                    None => {
                        self.sleep_check_interval().await;
                        return Ok(());
                    }
                };
                let first = &open.pending[0];
                let entry = first.limit_price.to_f64().unwrap_or(price);
                let direction = if entry < price {
                    EntryDirection::Below
                } else {
                    EntryDirection::Above
                };
                let threshold = strategy::reposition_threshold(
                    self.cfg.reposition_threshold_pct,
                    self.cfg.reposition_random,
                    &mut self.rng,
                );
                log::info!(
                    "[CYCLE] adopting {} resting orders from a previous run (entry {:.4})",
                    open.pending.len(),
                    entry
                );
                self.cycle = Some(Cycle {
                    anchor_price: price,
                    entry_price: entry,
                    direction,
                    offset: if price > 0.0 {
                        (entry - price).abs() / price
                    } else {
                        0.0
                    },
                    collateral: self.cfg.position_size_usdc,
                    reposition_threshold: threshold,
                });
                self.last_order_status = None;
                self.state = CycleState::MonitoringOrders;
                return Ok(());
            }
        }

        self.state = CycleState::Placing;
        Ok(())
    }

    async fn step_place_orders(&mut self) -> Result<()> {
        let anchor = match self.usable_price().await {
            Some(price) => price,
            None => {
                self.sleep_check_interval().await;
                return Ok(());
            }
        };

        self.cycle_count += 1;
        let offset = strategy::random_offset(
            self.cfg.entry_offset_min,
            self.cfg.entry_offset_max,
            &mut self.rng,
        );
        let direction = strategy::random_direction(&mut self.rng);
        let entry = strategy::entry_price(anchor, offset, direction);
        let collateral = strategy::vary_collateral(
            self.cfg.position_size_usdc,
            self.cfg.collateral_variance,
            self.cfg.collateral_step,
            &mut self.rng,
        );
        let threshold = strategy::reposition_threshold(
            self.cfg.reposition_threshold_pct,
            self.cfg.reposition_random,
            &mut self.rng,
        );
        let leverage = self.cfg.leverage as f64;
        let (long_tp, long_sl) = strategy::calc_tp_sl_price(
            entry,
            leverage,
            self.cfg.take_profit_pnl,
            self.cfg.stop_loss_pnl,
            true,
        );
        let (short_tp, short_sl) = strategy::calc_tp_sl_price(
            entry,
            leverage,
            self.cfg.take_profit_pnl,
            self.cfg.stop_loss_pnl,
            false,
        );

        log::info!("[CYCLE] === cycle {} ===", self.cycle_count);
        log::info!(
            "[CYCLE] anchor {:.4}, entry {:.4} ({} {:.2}%), collateral {} USDC x{}",
            anchor,
            entry,
            direction,
            offset * 100.0,
            collateral,
            self.cfg.leverage
        );
        log::info!(
            "[CYCLE] long tp/sl {:.4}/{:.4}, short tp/sl {:.4}/{:.4}",
            long_tp,
            long_sl,
            short_tp,
            short_sl
        );

        let long_req =
            self.build_order(OrderSide::Long, entry, collateral, long_tp, long_sl, direction)?;
        let short_req = self.build_order(
            OrderSide::Short,
            entry,
            collateral,
            short_tp,
            short_sl,
            direction,
        )?;

        let long_ticket = self
            .gateway
            .place_limit_order(&long_req)
            .await
            .context("long leg submission failed")?;
        if !self.cfg.dry_run {
            self.sleep_uniform(LEG_PAUSE_MIN_SECS, LEG_PAUSE_MAX_SECS).await;
        }
        match self.gateway.place_limit_order(&short_req).await {
            Ok(_) => {}
            Err(e) => {
                log::error!("[ORDER] short leg failed, cancelling the long leg: {}", e);
                if let Err(cancel_err) = self
                    .gateway
                    .cancel_order(long_req.pair_index, long_ticket.order_index)
                    .await
                {
                    log::error!("[CANCEL] failed to cancel the long leg: {}", cancel_err);
                }
                return Err(e).context("short leg submission failed");
            }
        }

        log::info!(
            "[MONITOR] both legs resting at {:.4}, reposition threshold {:.2}%",
            entry,
            threshold * 100.0
        );
        self.cycle = Some(Cycle {
            anchor_price: anchor,
            entry_price: entry,
            direction,
            offset,
            collateral,
            reposition_threshold: threshold,
        });
        self.last_order_status = None;
        self.state = CycleState::MonitoringOrders;
        Ok(())
    }

    async fn step_monitor_orders(&mut self) -> Result<()> {
        if !self.window_open() {
            log::info!("[WINDOW] trading window closed with orders resting");
            self.state = CycleState::WindowClosedCleanup;
            return Ok(());
        }

        self.sleep_check_interval().await;

        let price = match self.usable_price().await {
            Some(price) => price,
            None => return Ok(()),
        };
        let cycle = self
            .cycle
            .clone()
            .context("monitoring without an active cycle")?;
        let open = match self.gateway.get_open_trades().await {
            Ok(open) => open,
            Err(e) => {
                log::warn!("[MONITOR] trade snapshot failed: {}", e);
                return Ok(());
            }
        };

        let drift = if cycle.anchor_price > 0.0 {
            (price - cycle.anchor_price).abs() / cycle.anchor_price
        } else {
            0.0
        };
        if self.order_status_due() {
            log::info!(
                "[MONITOR] {} {:.2}% entry {:.4} ({} USDC): price {:.4}, drift {:.2}% of {:.2}% allowed, {} pending / {} open",
                cycle.direction,
                cycle.offset * 100.0,
                cycle.entry_price,
                cycle.collateral,
                price,
                drift * 100.0,
                cycle.reposition_threshold * 100.0,
                open.pending.len(),
                open.positions.len()
            );
        }

        // Fill check comes before the drift check; a filled pair is never repositioned.
        if open.positions.len() >= 2 {
            log::info!("[POSITION] both legs filled at {:.4}", cycle.entry_price);
            self.last_position_status = None;
            self.state = CycleState::PositionsOpen;
            return Ok(());
        }

        if drift > cycle.reposition_threshold {
            log::info!(
                "[CYCLE] price drifted {:.2}% from anchor {:.4}, repositioning",
                drift * 100.0,
                cycle.anchor_price
            );
            self.cancel_pending_orders(&open.pending).await;
            self.finish_cycle("repositioned").await;
        }

        Ok(())
    }

    async fn step_positions_open(&mut self) -> Result<()> {
        self.sleep_check_interval().await;

        let open = match self.gateway.get_open_trades().await {
            Ok(open) => open,
            Err(e) => {
                log::warn!("[POSITION] trade snapshot failed: {}", e);
                return Ok(());
            }
        };

        if open.positions.is_empty() {
            log::info!("[POSITION] all positions closed");
            self.finish_cycle("all positions closed").await;
            return Ok(());
        }

        if self.position_status_due() {
            log::info!(
                "[POSITION] {} still open, waiting for tp/sl",
                open.positions.len()
            );
        }
        Ok(())
    }

    async fn step_cleanup(&mut self) -> Result<()> {
        match self.gateway.get_open_trades().await {
            Ok(open) => self.cancel_pending_orders(&open.pending).await,
            Err(e) => log::warn!("[CANCEL] trade snapshot failed, orders may remain: {}", e),
        }
        log::info!("[WINDOW] session over, waiting for the next trading window");
        self.finish_cycle("window closed").await;
        Ok(())
    }

    async fn cancel_pending_orders(&mut self, pending: &[PendingOrder]) {
        for order in pending {
            match self
                .gateway
                .cancel_order(order.pair_index, order.order_index)
                .await
            {
                Ok(()) => log::info!(
                    "[CANCEL] order {} at {} cancelled",
                    order.order_index,
                    order.limit_price
                ),
                Err(e) => log::error!("[CANCEL] order {} failed: {}", order.order_index, e),
            }
            if !self.cfg.dry_run {
                self.sleep_uniform(CANCEL_PAUSE_MIN_SECS, CANCEL_PAUSE_MAX_SECS)
                    .await;
            }
        }
    }

    async fn finish_cycle(&mut self, reason: &str) {
        log::info!("[CYCLE] cycle {} finished ({})", self.cycle_count, reason);
        self.cycle = None;
        self.state = CycleState::WaitWindow;
        self.sleep_uniform(
            self.cfg.cycle_pause_min_secs as f64,
            self.cfg.cycle_pause_max_secs as f64,
        )
        .await;
    }

    fn build_order(
        &self,
        side: OrderSide,
        entry: f64,
        collateral: f64,
        tp: f64,
        sl: f64,
        direction: EntryDirection,
    ) -> Result<OrderRequest> {
        Ok(OrderRequest {
            pair: self.cfg.pair_name.clone(),
            pair_index: self.cfg.pair_index,
            side,
            collateral: decimal_from(collateral, "collateral")?,
            leverage: self.cfg.leverage,
            limit_price: decimal_from(entry, "entry price")?,
            tp_price: decimal_from(tp, "take-profit price")?,
            sl_price: decimal_from(sl, "stop-loss price")?,
            kind: strategy::order_kind(direction, side),
        })
    }

    async fn usable_price(&self) -> Option<f64> {
        match self.gateway.get_price(&self.cfg.pair_name).await {
            Ok(price) => {
                let price = price.to_f64().filter(|p| *p > 0.0);
                if price.is_none() {
                    log::warn!("[FEED] no usable price for {}", self.cfg.pair_name);
                }
                price
            }
            Err(e) => {
                log::warn!("[FEED] price fetch failed: {}", e);
                None
            }
        }
    }

    fn window_open(&mut self) -> bool {
        let now_minutes = schedule::minutes_of_day(&self.cfg.tz_offset);
        schedule::is_trading_hours(
            now_minutes,
            self.cfg.trading_start_hour,
            self.cfg.trading_end_hour,
            self.cfg.trading_hours_variance_min,
            &mut self.rng,
        )
    }

    fn order_status_due(&mut self) -> bool {
        let due = self
            .last_order_status
            .map(|at| at.elapsed() >= Duration::from_secs(ORDER_STATUS_EVERY_SECS))
            .unwrap_or(true);
        if due {
            self.last_order_status = Some(Instant::now());
        }
        due
    }

    fn position_status_due(&mut self) -> bool {
        let due = self
            .last_position_status
            .map(|at| at.elapsed() >= Duration::from_secs(POSITION_STATUS_EVERY_SECS))
            .unwrap_or(true);
        if due {
            self.last_position_status = Some(Instant::now());
        }
        due
    }

    async fn sleep_check_interval(&mut self) {
        self.sleep_uniform(
            self.cfg.check_interval_min_secs as f64,
            self.cfg.check_interval_max_secs as f64,
        )
        .await;
    }

    async fn sleep_uniform(&mut self, min_secs: f64, max_secs: f64) {
        let secs = strategy::random_interval_secs(min_secs, max_secs, &mut self.rng);
        if secs > 0.0 {
            sleep(Duration::from_secs_f64(secs)).await;
        }
    }
}

#[cfg(test)]
impl DeltaNeutralEngine {
    fn test_config() -> DeltaNeutralConfig {
        DeltaNeutralConfig {
            rest_endpoint: "http://localhost".to_string(),
            feed_endpoint: "http://localhost".to_string(),
            dry_run: true,
            pair_name: "BTC/USD".to_string(),
            pair_index: 1,
            position_size_usdc: 10.0,
            leverage: 75,
            collateral_variance: 0.05,
            collateral_step: 0.5,
            take_profit_pnl: 0.8,
            stop_loss_pnl: 0.8,
            entry_offset_min: 0.0025,
            entry_offset_max: 0.01,
            reposition_threshold_pct: 0.01,
            reposition_random: 0.002,
            check_interval_min_secs: 0,
            check_interval_max_secs: 0,
            trading_start_hour: 0,
            trading_end_hour: 24,
            trading_hours_variance_min: 0,
            tz_offset: FixedOffset::east_opt(0).unwrap(),
            cycle_pause_min_secs: 0,
            cycle_pause_max_secs: 0,
            rng_seed: Some(7),
        }
    }

    fn test_instance(gateway: Arc<dyn ExchangeGateway + Send + Sync>) -> Self {
        Self {
            cfg: Self::test_config(),
            gateway,
            rng: StdRng::seed_from_u64(7),
            state: CycleState::WaitWindow,
            cycle: None,
            cycle_count: 0,
            last_order_status: None,
            last_position_status: None,
        }
    }
}
