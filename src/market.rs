//! Trading-window computation: plain wall-clock hours in a market timezone,
//! weekends skipped. Holiday calendars stay outside this crate.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingWindow {
    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
}

impl TradingWindow {
    /// Half-open containment: `[opens_at, closes_at)`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        now >= self.opens_at && now < self.closes_at
    }
}

#[derive(Debug, Clone)]
pub struct MarketClock {
    tz: Tz,
    open_hour: u32,
    close_hour: u32,
}

impl MarketClock {
    /// Hours are wall-clock in `tz` and must satisfy `open < close`,
    /// both within `0..=23` (validated by config).
    pub fn new(tz: Tz, open_hour: u32, close_hour: u32) -> Self {
        Self {
            tz,
            open_hour,
            close_hour,
        }
    }

    /// The current window if `now` is before today's close on a weekday,
    /// otherwise the next weekday's window. `opens_at` may already be in
    /// the past when `now` sits inside the window.
    pub fn next_window(&self, now: DateTime<Utc>) -> TradingWindow {
        let local_now = now.with_timezone(&self.tz);
        let mut date = local_now.date_naive();

        loop {
            if is_weekday(date) {
                let closes_at = self.at_hour(date, self.close_hour);
                if now < closes_at {
                    return TradingWindow {
                        opens_at: self.at_hour(date, self.open_hour),
                        closes_at,
                    };
                }
            }
            date = date.succ_opt().unwrap_or(date + ChronoDuration::days(1));
        }
    }

    fn at_hour(&self, date: NaiveDate, hour: u32) -> DateTime<Utc> {
        // Hour is validated at config parse, so the naive time always exists.
        let naive = date
            .and_hms_opt(hour, 0, 0)
            .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).expect("midnight exists"));
        match self.tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            // DST spring-forward gap: shift into the next valid hour.
            chrono::LocalResult::None => self
                .tz
                .from_local_datetime(&(naive + ChronoDuration::hours(1)))
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
        }
    }
}

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn clock() -> MarketClock {
        MarketClock::new(New_York, 8, 15)
    }

    fn ny(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn inside_window_returns_today() {
        // Wednesday 2026-08-26, 10:00 New York
        let now = ny(2026, 8, 26, 10, 0);
        let w = clock().next_window(now);
        assert_eq!(w.opens_at, ny(2026, 8, 26, 8, 0));
        assert_eq!(w.closes_at, ny(2026, 8, 26, 15, 0));
        assert!(w.contains(now));
    }

    #[test]
    fn before_open_returns_today_not_yet_open() {
        let now = ny(2026, 8, 26, 6, 30);
        let w = clock().next_window(now);
        assert_eq!(w.opens_at, ny(2026, 8, 26, 8, 0));
        assert!(!w.contains(now));
    }

    #[test]
    fn after_close_rolls_to_next_weekday() {
        // Friday 2026-08-28 after close -> Monday 2026-08-31
        let now = ny(2026, 8, 28, 16, 0);
        let w = clock().next_window(now);
        assert_eq!(w.opens_at, ny(2026, 8, 31, 8, 0));
    }

    #[test]
    fn weekend_rolls_to_monday() {
        // Saturday 2026-08-29
        let now = ny(2026, 8, 29, 10, 0);
        let w = clock().next_window(now);
        assert_eq!(w.opens_at, ny(2026, 8, 31, 8, 0));
    }

    #[test]
    fn close_boundary_is_exclusive() {
        let now = ny(2026, 8, 26, 15, 0);
        let w = clock().next_window(now);
        // at close, today's window is over; next is Thursday
        assert_eq!(w.opens_at, ny(2026, 8, 27, 8, 0));
        assert!(!TradingWindow {
            opens_at: ny(2026, 8, 26, 8, 0),
            closes_at: ny(2026, 8, 26, 15, 0),
        }
        .contains(now));
    }
}
