//! Wire protocol: newline-delimited JSON requests and replies.
//!
//! Each request is one JSON object tagged by `type`. Market ids travel as
//! `"<subject>,<threshold>"`; user-facing money fields are two-decimal
//! dollar strings while prices inside orders and trades stay integer cents.

use crate::book::DepthLevel;
use crate::coordinator::{Command, CoordinatorError, MarketView, Response, TradeView};
use crate::types::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetMarkets,
    GetSnapshot {
        market_id: String,
    },
    PlaceOrder {
        market_id: String,
        user_id: String,
        side: Side,
        price: i64,
        qty: i64,
        id: u32,
    },
    CancelOrder {
        id: u32,
        user_id: String,
    },
    Balance {
        user_id: String,
    },
    ProofOfWalk {
        user_id: String,
        steps: u64,
    },
    DoomscrollBurn {
        user_id: String,
        minutes: u64,
    },
    Settle {
        target_user_id: String,
        actual_value: u32,
    },
}

impl Request {
    pub fn into_command(self) -> Result<Command, CoordinatorError> {
        Ok(match self {
            Request::GetMarkets => Command::GetMarkets,
            Request::GetSnapshot { market_id } => {
                let (subject, threshold) = parse_market_id(&market_id)?;
                Command::GetSnapshot { subject, threshold }
            }
            Request::PlaceOrder {
                market_id,
                user_id,
                side,
                price,
                qty,
                id,
            } => {
                let (subject, threshold) = parse_market_id(&market_id)?;
                Command::PlaceOrder {
                    subject,
                    threshold,
                    user: user_id,
                    side,
                    price_cents: price,
                    qty,
                    order_id: id,
                }
            }
            Request::CancelOrder { id, user_id } => Command::CancelOrder {
                order_id: id,
                user: user_id,
            },
            Request::Balance { user_id } => Command::GetBalance { user: user_id },
            Request::ProofOfWalk { user_id, steps } => Command::MintByActivity {
                user: user_id,
                steps,
            },
            Request::DoomscrollBurn { user_id, minutes } => Command::BurnByUsage {
                user: user_id,
                minutes,
            },
            Request::Settle {
                target_user_id,
                actual_value,
            } => Command::Settle {
                subject: target_user_id,
                observed_value: actual_value,
            },
        })
    }
}

fn parse_market_id(raw: &str) -> Result<(String, u32), CoordinatorError> {
    let (subject, threshold) = raw
        .rsplit_once(',')
        .ok_or_else(|| CoordinatorError::InvalidArgument(format!("malformed market id {raw:?}")))?;
    let threshold: u32 = threshold
        .trim()
        .parse()
        .map_err(|_| CoordinatorError::InvalidArgument(format!("malformed market id {raw:?}")))?;
    if subject.is_empty() {
        return Err(CoordinatorError::InvalidArgument(format!(
            "malformed market id {raw:?}"
        )));
    }
    Ok((subject.to_string(), threshold))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Markets {
        status: &'static str,
        markets: Vec<MarketView>,
    },
    Snapshot {
        status: &'static str,
        bids: Vec<DepthLevel>,
        asks: Vec<DepthLevel>,
    },
    Placed {
        status: &'static str,
        trades: Vec<TradeView>,
        resting_qty: i64,
    },
    Canceled {
        status: &'static str,
        refunded: String,
    },
    Balance {
        status: &'static str,
        available: String,
        locked: String,
        positions: BTreeMap<String, i64>,
    },
    Minted {
        status: &'static str,
        minted: String,
    },
    Burned {
        status: &'static str,
        burned: String,
    },
    Settled {
        status: &'static str,
        trades: Vec<TradeView>,
    },
    Error {
        status: &'static str,
        code: &'static str,
        message: String,
    },
}

impl Reply {
    pub fn from_result(result: Result<Response, CoordinatorError>) -> Self {
        match result {
            Ok(response) => Self::from_response(response),
            Err(err) => Self::from_error(&err),
        }
    }

    pub fn from_response(response: Response) -> Self {
        match response {
            Response::Markets(markets) => Reply::Markets {
                status: "ok",
                markets,
            },
            Response::Depth { bids, asks } => Reply::Snapshot {
                status: "ok",
                bids,
                asks,
            },
            Response::Placed {
                trades,
                resting_qty,
            } => Reply::Placed {
                status: "ok",
                trades,
                resting_qty,
            },
            Response::Canceled { refunded } => Reply::Canceled {
                status: "ok",
                refunded: dollars(refunded),
            },
            Response::Balance {
                available,
                locked,
                positions,
            } => Reply::Balance {
                status: "ok",
                available: dollars(available),
                locked: dollars(locked),
                positions,
            },
            Response::Minted(minted) => Reply::Minted {
                status: "ok",
                minted: dollars(minted),
            },
            Response::Burned(burned) => Reply::Burned {
                status: "ok",
                burned: dollars(burned),
            },
            Response::Settled { trades } => Reply::Settled {
                status: "ok",
                trades,
            },
        }
    }

    pub fn from_error(err: &CoordinatorError) -> Self {
        Reply::Error {
            status: "error",
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// For requests that never made it to a `Command`.
    pub fn malformed(message: String) -> Self {
        Reply::Error {
            status: "error",
            code: "invalid_argument",
            message,
        }
    }
}

/// User-facing money is always a two-decimal dollar string.
fn dollars(amount: Decimal) -> String {
    format!("{amount:.2}")
}
