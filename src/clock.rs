use chrono::{DateTime, Utc};

// Traits

#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn utc(&self) -> DateTime<Utc>;
}

// DefaultClock

pub struct DefaultClock;

impl Clock for DefaultClock {
    fn utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
