use std::time::{Duration, Instant};

/// Cost units are multiplied by this before they touch a bucket, so the token
/// count keeps three decimal digits of the caller's cost.
pub const TOKEN_SCALE: f64 = 1000.0;

/// Delay reported with every denial. It is a fixed penalty, independent of how
/// far over budget the request was.
pub const DENIAL_PENALTY: Duration = Duration::from_secs(120);

/// Outcome of a single reservation against a [`TokenBucket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// How long the caller must wait before proceeding.
    pub delay: Duration,
    /// `false` when the request can never be satisfied.
    pub admitted: bool,
}

impl Reservation {
    pub const fn admit(delay: Duration) -> Self {
        Self {
            delay,
            admitted: true,
        }
    }

    pub const fn deny() -> Self {
        Self {
            delay: DENIAL_PENALTY,
            admitted: false,
        }
    }
}

/// A reserving token bucket.
///
/// The bucket holds up to `capacity` tokens and refills continuously at `rate`
/// tokens per second. A reservation always debits its cost immediately, which
/// may drive the level negative; the caller then owes the returned delay. The
/// refill is computed lazily from the time of the last reservation, so an idle
/// bucket costs nothing.
///
/// A reservation is refused, and debits nothing, when its cost alone exceeds
/// the capacity or when granting it would leave more than one full bucket of
/// debt outstanding.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Scaled tokens per second.
    rate: f64,
    /// Scaled tokens.
    capacity: f64,
    tokens: f64,
    last_refill: Option<Instant>,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// * `rate`  - sustained budget in cost units per second
    /// * `burst` - capacity in cost units
    pub fn new(rate: f64, burst: f64) -> Self {
        let capacity = scale(burst) as f64;
        Self {
            rate: rate * TOKEN_SCALE,
            capacity,
            tokens: capacity,
            last_refill: None,
        }
    }

    /// Reserve `cost` units as of `now`.
    pub fn reserve(&mut self, now: Instant, cost: f64) -> Reservation {
        let needed = scale(cost) as f64;
        if needed > self.capacity || !(self.rate > 0.0) {
            return Reservation::deny();
        }

        let remaining = self.tokens_at(now) - needed;
        if -remaining > self.capacity {
            return Reservation::deny();
        }

        let wait = if remaining < 0.0 {
            -remaining / self.rate
        } else {
            0.0
        };
        let delay = match Duration::try_from_secs_f64(wait) {
            Ok(delay) => delay,
            Err(_) => return Reservation::deny(),
        };

        self.tokens = remaining;
        self.last_refill = Some(match self.last_refill {
            // Reservations can arrive with slightly older timestamps than the
            // last one; the refill clock never moves backwards.
            Some(last) if last > now => last,
            _ => now,
        });

        Reservation::admit(delay)
    }

    /// Tokens available at `now`, in cost units. Negative while in debt.
    pub fn available(&self, now: Instant) -> f64 {
        self.tokens_at(now) / TOKEN_SCALE
    }

    /// Refill rate in cost units per second.
    pub fn rate(&self) -> f64 {
        self.rate / TOKEN_SCALE
    }

    /// Capacity in cost units.
    pub fn capacity(&self) -> f64 {
        self.capacity / TOKEN_SCALE
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        match self.last_refill {
            None => self.capacity,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                (self.tokens + elapsed * self.rate).min(self.capacity)
            }
        }
    }
}

/// Convert cost units to whole tokens. Negative and non-finite costs are free.
fn scale(units: f64) -> u64 {
    if units.is_finite() && units > 0.0 {
        (units * TOKEN_SCALE).round() as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bucket_admits_small_cost_without_delay() {
        let mut bucket = TokenBucket::new(1.0, 30.0);
        let r = bucket.reserve(Instant::now(), 0.01);
        assert_eq!(r, Reservation::admit(Duration::ZERO));
    }

    #[test]
    fn fresh_bucket_admits_full_capacity() {
        let mut bucket = TokenBucket::new(1.0, 30.0);
        let r = bucket.reserve(Instant::now(), 30.0);
        assert!(r.admitted);
        assert_eq!(r.delay, Duration::ZERO);
    }

    #[test]
    fn cost_above_capacity_is_denied() {
        let mut bucket = TokenBucket::new(1.0, 30.0);
        let now = Instant::now();
        assert_eq!(bucket.reserve(now, 30.001), Reservation::deny());
        // Nothing was debited.
        assert_eq!(bucket.available(now), 30.0);
    }

    #[test]
    fn delay_grows_once_burst_is_spent() {
        let mut bucket = TokenBucket::new(1.0, 30.0);
        let now = Instant::now();

        for i in 0..30 {
            let r = bucket.reserve(now, 1.0);
            assert_eq!(r.delay, Duration::ZERO, "reservation {} should be free", i);
        }

        let r = bucket.reserve(now, 1.0);
        assert!(r.admitted);
        assert_eq!(r.delay, Duration::from_secs(1));

        let r = bucket.reserve(now, 1.0);
        assert!(r.admitted);
        assert_eq!(r.delay, Duration::from_secs(2));
    }

    #[test]
    fn debt_beyond_one_bucket_is_denied() {
        let mut bucket = TokenBucket::new(1.0, 30.0);
        let now = Instant::now();

        // 30 free, then 30 more owing up to 30 seconds.
        for _ in 0..60 {
            assert!(bucket.reserve(now, 1.0).admitted);
        }
        assert_eq!(bucket.available(now), -30.0);

        assert_eq!(bucket.reserve(now, 1.0), Reservation::deny());
        // A denial does not deepen the debt.
        assert_eq!(bucket.available(now), -30.0);
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(2.0, 10.0);
        let start = Instant::now();

        assert!(bucket.reserve(start, 10.0).admitted);
        assert_eq!(bucket.available(start), 0.0);

        let later = start + Duration::from_secs(3);
        assert!((bucket.available(later) - 6.0).abs() < 1e-9);

        let r = bucket.reserve(later, 6.0);
        assert_eq!(r, Reservation::admit(Duration::ZERO));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let mut bucket = TokenBucket::new(5.0, 10.0);
        let start = Instant::now();
        bucket.reserve(start, 1.0);

        let much_later = start + Duration::from_secs(3600);
        assert_eq!(bucket.available(much_later), 10.0);
    }

    #[test]
    fn older_timestamp_does_not_rewind_refill_clock() {
        let mut bucket = TokenBucket::new(1.0, 5.0);
        let start = Instant::now();
        let later = start + Duration::from_secs(2);

        assert!(bucket.reserve(later, 5.0).admitted);
        // An out-of-order caller sees no refill and owes one second.
        let r = bucket.reserve(start, 1.0);
        assert_eq!(r, Reservation::admit(Duration::from_secs(1)));
        // The clock is still anchored at `later`.
        assert_eq!(bucket.available(later + Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn zero_and_invalid_costs_are_free() {
        let mut bucket = TokenBucket::new(1.0, 1.0);
        let now = Instant::now();
        assert!(bucket.reserve(now, 1.0).admitted);

        for cost in [0.0, -3.0, f64::NAN] {
            let r = bucket.reserve(now, cost);
            assert_eq!(r, Reservation::admit(Duration::ZERO));
        }
    }

    #[test]
    fn preserves_three_decimal_digits() {
        let mut bucket = TokenBucket::new(1.0, 1.0);
        let now = Instant::now();
        assert!(bucket.reserve(now, 0.999).admitted);
        assert!((bucket.available(now) - 0.001).abs() < 1e-9);
    }

    #[test]
    fn accessors_report_cost_units() {
        let bucket = TokenBucket::new(2.5, 30.0);
        assert_eq!(bucket.rate(), 2.5);
        assert_eq!(bucket.capacity(), 30.0);
    }
}
