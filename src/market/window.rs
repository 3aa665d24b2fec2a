//! Market window gate.
//!
//! Maps an instrument category and a point in time to open/closed. Sessions
//! are evaluated in exchange-local time (WIB, UTC+7):
//! - Crypto trades continuously
//! - FX trades on weekdays except for the daily rollover hour
//! - Domestic equities trade two sessions per weekday with a pre-open grace
//!   window and a shortened Friday session
//!
//! Categories without a session table are treated as open.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Utc, Weekday};

use super::Category;

/// Exchange-local offset from UTC in seconds (WIB).
const EXCHANGE_UTC_OFFSET_SECS: i32 = 7 * 3600;

/// Local hour during which FX liquidity rolls over.
const FX_ROLLOVER_HOUR: u32 = 5;

/// Domestic equity sessions, Monday through Thursday (pre-open starts at 08:45).
const EQUITY_SESSIONS: [(u32, u32, u32, u32); 2] = [(8, 45, 12, 0), (13, 30, 15, 50)];

/// Domestic equity sessions on Friday.
const EQUITY_FRIDAY_SESSIONS: [(u32, u32, u32, u32); 2] = [(8, 45, 11, 30), (14, 0, 15, 50)];

/// Returns whether `category` is tradable at `now`.
pub fn is_open(category: Category, now: DateTime<Utc>) -> bool {
    let local = to_exchange_time(now);

    match category {
        Category::Crypto => true,
        Category::Fx => is_fx_open(&local),
        Category::EquityDomestic => is_domestic_equity_open(&local),
        Category::EquityForeign | Category::Unknown => true,
    }
}

fn to_exchange_time(now: DateTime<Utc>) -> DateTime<FixedOffset> {
    match FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS) {
        Some(offset) => now.with_timezone(&offset),
        None => now.fixed_offset(),
    }
}

fn is_weekend(local: &DateTime<FixedOffset>) -> bool {
    matches!(local.weekday(), Weekday::Sat | Weekday::Sun)
}

fn is_fx_open(local: &DateTime<FixedOffset>) -> bool {
    !is_weekend(local) && local.hour() != FX_ROLLOVER_HOUR
}

fn is_domestic_equity_open(local: &DateTime<FixedOffset>) -> bool {
    if is_weekend(local) {
        return false;
    }

    let sessions = if local.weekday() == Weekday::Fri {
        &EQUITY_FRIDAY_SESSIONS
    } else {
        &EQUITY_SESSIONS
    };

    let time = local.time();
    sessions.iter().any(|&(sh, sm, eh, em)| {
        match (
            NaiveTime::from_hms_opt(sh, sm, 0),
            NaiveTime::from_hms_opt(eh, em, 0),
        ) {
            (Some(start), Some(end)) => start <= time && time < end,
            _ => false,
        }
    })
}
