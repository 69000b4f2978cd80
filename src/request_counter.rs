//! Requests served today (UTC), for the admin info endpoint.
//!
//! One `{ day, count }` record behind a mutex; the count restarts when the date changes.

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DailyCount {
    day: NaiveDate,
    count: u64,
}

#[derive(Debug)]
pub struct RequestCounter {
    current: Mutex<DailyCount>,
}

impl Default for RequestCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCounter {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(DailyCount {
                day: Utc::now().date_naive(),
                count: 0,
            }),
        }
    }

    pub fn increment(&self) {
        self.increment_on(Utc::now().date_naive());
    }

    pub fn count(&self) -> u64 {
        self.count_on(Utc::now().date_naive())
    }

    fn increment_on(&self, today: NaiveDate) {
        let mut current = self.current.lock();
        roll(&mut current, today);
        current.count += 1;
    }

    fn count_on(&self, today: NaiveDate) -> u64 {
        let mut current = self.current.lock();
        roll(&mut current, today);
        current.count
    }
}

fn roll(current: &mut DailyCount, today: NaiveDate) {
    if current.day != today {
        *current = DailyCount { day: today, count: 0 };
    }
}

/// Middleware: counts every request that reaches the router.
pub async fn count_requests(req: Request<Body>, next: Next, counter: Arc<RequestCounter>) -> Response {
    counter.increment();
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn counts_within_a_day() {
        let counter = RequestCounter::new();
        counter.increment();
        counter.increment();
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn resets_when_the_day_changes() {
        let counter = RequestCounter::new();
        counter.increment_on(day(1));
        counter.increment_on(day(1));
        assert_eq!(counter.count_on(day(1)), 2);
        assert_eq!(counter.count_on(day(2)), 0);
        counter.increment_on(day(2));
        assert_eq!(counter.count_on(day(2)), 1);
    }
}
