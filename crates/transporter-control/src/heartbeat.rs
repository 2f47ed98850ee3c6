//! Heartbeat timers for both ends of a control channel

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Which end of the control channel this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Agent side: sends pings, expects pongs
    Initiator,
    /// Server side: answers pings, expects them regularly
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often the initiator sends `Ping`
    pub ping_interval: Duration,
    /// How long the initiator waits for `Pong` after a ping
    pub pong_timeout: Duration,
    /// How long the responder waits for the next `Ping`
    pub ping_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(30),
        }
    }
}

/// Deadline bookkeeping for one channel.
///
/// At most one deadline is armed at a time. The dispatch loop sleeps until
/// [`Heartbeat::deadline`] and treats its expiry as a heartbeat timeout.
#[derive(Debug)]
pub struct Heartbeat {
    role: Role,
    config: HeartbeatConfig,
    deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(role: Role, config: HeartbeatConfig, now: Instant) -> Self {
        let deadline = match role {
            Role::Initiator => None,
            Role::Responder => Some(now + config.ping_timeout),
        };
        Self {
            role,
            config,
            deadline,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Interval at which pings must be sent, if this end sends them
    pub fn ping_interval(&self) -> Option<Duration> {
        match self.role {
            Role::Initiator => Some(self.config.ping_interval),
            Role::Responder => None,
        }
    }

    /// A ping went out. An already armed pong deadline is left untouched so
    /// that a string of unanswered pings cannot push it forward.
    pub fn on_ping_sent(&mut self, now: Instant) {
        if self.role == Role::Initiator && self.deadline.is_none() {
            self.deadline = Some(now + self.config.pong_timeout);
        }
    }

    pub fn on_pong(&mut self) {
        if self.role == Role::Initiator {
            self.deadline = None;
        }
    }

    /// A ping arrived: start waiting for the next one
    pub fn on_ping(&mut self, now: Instant) {
        if self.role == Role::Responder {
            self.deadline = Some(now + self.config.ping_timeout);
        }
    }

    /// Latest instant a heartbeat write started at `now` may take to finish:
    /// the armed deadline, or one pong timeout when nothing is armed
    pub fn write_deadline(&self, now: Instant) -> Instant {
        self.deadline.unwrap_or(now + self.config.pong_timeout)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}
