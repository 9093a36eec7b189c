//! Entry/exit attendance policy over the stream of live recognitions.
//!
//! An identity must be accepted on `confirm_frames` consecutive recognitions
//! before anything is recorded. The first confirmed sighting of a day is an
//! entry; later ones on the same day alternate exit/entry, except that a
//! sighting within `reentry` of the previous event is ignored. Unknown faces
//! are recorded at most once per `unknown_interval`.
//!
//! A `Record` decision only takes effect once the caller has written it and
//! calls [`AttendancePolicy::commit`].

use chrono::{DateTime, Duration, FixedOffset, Utc};
use facegate_core::{Decision, IdentityId, Recognition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A streak restarts when its identity has not been seen for this many seconds.
const STREAK_GAP_SECS: i64 = 3;

/// How often stale streaks and history are swept, in seconds of capture time.
const SWEEP_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Entry,
    Exit,
    Unknown,
}

impl AccessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(Self::Entry),
            "exit" => Ok(Self::Exit),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown access kind '{other}'")),
        }
    }
}

/// The most recent entry/exit recorded for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastAccess {
    pub kind: AccessKind,
    pub at: DateTime<Utc>,
}

/// An access event the policy wants written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingAccess {
    pub identity_id: Option<IdentityId>,
    pub name: Option<String>,
    pub kind: AccessKind,
    pub score: f32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccessDecision {
    Record(PendingAccess),
    /// Confirmed again too soon after the previous event.
    Debounced {
        identity_id: IdentityId,
        since_last: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct AttendanceConfig {
    pub confirm_frames: u32,
    pub reentry: Duration,
    pub unknown_interval: Duration,
    /// Offset used to decide which calendar day an event falls on.
    pub offset: FixedOffset,
}

#[derive(Debug, Clone, Copy)]
struct Streak {
    count: u32,
    last_seen: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AttendancePolicy {
    config: AttendanceConfig,
    streaks: HashMap<IdentityId, Streak>,
    /// `None` caches "no prior event" so history is looked up once.
    history: HashMap<IdentityId, Option<LastAccess>>,
    last_unknown: Option<DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
}

impl AttendancePolicy {
    pub fn new(config: AttendanceConfig) -> Self {
        Self {
            config,
            streaks: HashMap::new(),
            history: HashMap::new(),
            last_unknown: None,
            last_sweep: None,
        }
    }

    /// Whether the caller must [`seed`](Self::seed) history for `id` before
    /// the next [`observe`](Self::observe).
    pub fn needs_history(&self, id: &IdentityId) -> bool {
        !self.history.contains_key(id)
    }

    pub fn seed(&mut self, id: IdentityId, last: Option<LastAccess>) {
        self.history.insert(id, last);
    }

    /// Mark `pending` as written to the ledger. Until then the policy behaves
    /// as if the event never happened.
    pub fn commit(&mut self, pending: &PendingAccess) {
        match &pending.identity_id {
            Some(id) => {
                self.history.insert(
                    id.clone(),
                    Some(LastAccess {
                        kind: pending.kind,
                        at: pending.at,
                    }),
                );
            }
            None => self.last_unknown = Some(pending.at),
        }
    }

    pub fn observe(&mut self, recognition: &Recognition) -> Option<AccessDecision> {
        let at = recognition.captured_at;
        let result = &recognition.result;
        self.sweep(at);

        match (result.decision, &result.identity) {
            (Decision::Accept, Some(candidate)) => {
                let streak = self
                    .streaks
                    .entry(candidate.identity_id.clone())
                    .or_insert(Streak { count: 0, last_seen: at });
                if at - streak.last_seen > Duration::seconds(STREAK_GAP_SECS) {
                    streak.count = 0;
                }
                streak.count = streak.count.saturating_add(1);
                streak.last_seen = at;
                if streak.count != self.config.confirm_frames {
                    return None;
                }
                Some(self.decide(&candidate.identity_id, &candidate.name, candidate.score, at))
            }
            _ => {
                if let Some(best) = &result.best {
                    self.streaks.remove(&best.identity_id);
                }
                self.observe_unknown(result.score, at)
            }
        }
    }

    fn decide(&mut self, id: &IdentityId, name: &str, score: f32, at: DateTime<Utc>) -> AccessDecision {
        let last = self.history.get(id).copied().flatten();
        let kind = match last {
            None => AccessKind::Entry,
            Some(last) if self.day_of(last.at) < self.day_of(at) => AccessKind::Entry,
            Some(last) => {
                let since_last = at - last.at;
                if since_last < self.config.reentry {
                    return AccessDecision::Debounced {
                        identity_id: id.clone(),
                        since_last,
                    };
                }
                match last.kind {
                    AccessKind::Entry => AccessKind::Exit,
                    _ => AccessKind::Entry,
                }
            }
        };

        AccessDecision::Record(PendingAccess {
            identity_id: Some(id.clone()),
            name: Some(name.to_string()),
            kind,
            score,
            at,
        })
    }

    fn observe_unknown(&mut self, score: f32, at: DateTime<Utc>) -> Option<AccessDecision> {
        if let Some(previous) = self.last_unknown {
            if at - previous <= self.config.unknown_interval {
                return None;
            }
        }
        Some(AccessDecision::Record(PendingAccess {
            identity_id: None,
            name: None,
            kind: AccessKind::Unknown,
            score,
            at,
        }))
    }

    /// Drops streaks that would restart anyway and, once a new day begins,
    /// history from earlier days. Identities removed from the gallery are
    /// never observed again, so this is what forgets them.
    fn sweep(&mut self, at: DateTime<Utc>) {
        if let Some(previous) = self.last_sweep {
            if at - previous < Duration::seconds(SWEEP_INTERVAL_SECS) {
                return;
            }
        }

        let gap = Duration::seconds(STREAK_GAP_SECS);
        self.streaks.retain(|_, streak| at - streak.last_seen <= gap);

        let offset = self.config.offset;
        let today = self.day_of(at);
        if self.last_sweep.is_some_and(|previous| self.day_of(previous) < today) {
            // Earlier-day history decides the same way as none; it is reloaded on demand.
            self.history.retain(|_, last| {
                last.is_some_and(|last| last.at.with_timezone(&offset).date_naive() == today)
            });
        }
        self.last_sweep = Some(at);
    }

    fn day_of(&self, at: DateTime<Utc>) -> chrono::NaiveDate {
        at.with_timezone(&self.config.offset).date_naive()
    }
}
