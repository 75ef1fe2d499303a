use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::config::FeeSourceConfig;
use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::settings::{TO_COLD_FEE_RATE, TO_USER_FEE_RATE};

/// Recommended rates in sat/vbyte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RecommendedFees {
    #[serde(rename = "fastestFee")]
    pub fastest: u64,
    #[serde(rename = "halfHourFee")]
    pub half_hour: u64,
    #[serde(rename = "hourFee")]
    pub hour: u64,
}

pub trait FeeRateSource: Send + Sync {
    fn recommended(&self) -> Result<RecommendedFees, CustodyError>;
}

/// A mempool.space style `GET /fees/recommended` endpoint.
pub struct HttpFeeRateSource {
    http: reqwest::blocking::Client,
    url: String,
}

impl HttpFeeRateSource {
    pub fn new(config: &FeeSourceConfig) -> Result<Self, CustodyError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CustodyError::FeeSource(e.to_string()))?;
        Ok(Self {
            http,
            url: config.url.clone(),
        })
    }
}

impl FeeRateSource for HttpFeeRateSource {
    fn recommended(&self) -> Result<RecommendedFees, CustodyError> {
        self.http
            .get(&self.url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| CustodyError::FeeSource(format!("{}: {e}", self.url)))?
            .json()
            .map_err(|e| CustodyError::FeeSource(format!("decode: {e}")))
    }
}

/// Copies the current recommendation into the fee-rate settings.
pub struct FeeRateRefresher {
    ctx: CustodyContext,
    source: Box<dyn FeeRateSource>,
}

impl FeeRateRefresher {
    pub fn new(ctx: CustodyContext, source: Box<dyn FeeRateSource>) -> Self {
        Self { ctx, source }
    }

    pub fn refresh_fee_rates(&self) -> Result<RecommendedFees, CustodyError> {
        let fees = self.source.recommended()?;
        if fees.fastest == 0 || fees.half_hour == 0 {
            return Err(CustodyError::FeeSource(format!("zero fee rate in {fees:?}")));
        }

        let to_user = to_setting(fees.fastest)?;
        let to_cold = to_setting(fees.half_hour)?;
        self.ctx.settings.set_int(TO_USER_FEE_RATE, to_user);
        self.ctx.settings.set_int(TO_COLD_FEE_RATE, to_cold);
        info!(to_user, to_cold, "fee rates refreshed");
        Ok(fees)
    }
}

fn to_setting(rate: u64) -> Result<i64, CustodyError> {
    i64::try_from(rate)
        .map_err(|_| CustodyError::FeeSource(format!("fee rate {rate} out of range")))
}
