//! Novelty detection against the previously sent state.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use ornitho_core::{SentState, Sighting};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_NOTIFICATIONS: usize = 20;

/// How the sent state is interpreted and updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Stored state is the newest sighting of the previous run. The feed is
    /// read newest-first until that exact sighting shows up again.
    SingleCursor { max_notifications: usize },
    /// Stored state is every sighting seen in the previous run; only species
    /// missing from the stored sighting with the same key are notified.
    FullSet,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        ReconcilePolicy::SingleCursor {
            max_notifications: DEFAULT_MAX_NOTIFICATIONS,
        }
    }
}

impl ReconcilePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ReconcilePolicy::SingleCursor { .. } => "cursor",
            ReconcilePolicy::FullSet => "full-set",
        }
    }

    /// Same policy kind with a different notification bound. No effect on
    /// the full-set policy.
    pub fn with_max_notifications(self, max_notifications: usize) -> Self {
        match self {
            ReconcilePolicy::SingleCursor { .. } => ReconcilePolicy::SingleCursor { max_notifications },
            other => other,
        }
    }
}

impl fmt::Display for ReconcilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReconcilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cursor" | "single-cursor" | "single_cursor" => Ok(ReconcilePolicy::default()),
            "full-set" | "full_set" | "fullset" => Ok(ReconcilePolicy::FullSet),
            other => Err(format!("unknown reconcile policy {other:?} (expected cursor or full-set)")),
        }
    }
}

/// Decision for one observed sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Notify(Sighting),
    Skip,
    /// Nothing further needs to be read.
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub notify: Vec<Sighting>,
    pub state: SentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: SentState,
    pub observed: usize,
    pub notified: usize,
    /// The new state differs from the one the run started with.
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine {
    policy: ReconcilePolicy,
}

impl ReconciliationEngine {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    pub fn begin(&self, prior: SentState) -> ReconcileRun {
        ReconcileRun {
            policy: self.policy,
            prior,
            observed: 0,
            notified: 0,
            stopped: false,
            first: None,
            pending_save: None,
            seen: Vec::new(),
        }
    }

    /// Batch form: reconcile a whole merged sequence at once. Iteration stops
    /// as soon as the policy says so, so a lazy iterator is not drained.
    pub fn reconcile<I>(&self, merged: I, prior: SentState) -> Reconciliation
    where
        I: IntoIterator<Item = Sighting>,
    {
        let mut run = self.begin(prior);
        let mut notify = Vec::new();
        for sighting in merged {
            match run.observe(sighting) {
                Step::Notify(s) => notify.push(s),
                Step::Skip => {}
                Step::Stop => break,
            }
            if run.is_stopped() {
                break;
            }
        }
        Reconciliation {
            notify,
            state: run.finish().state,
        }
    }
}

/// State of one reconciliation pass, fed one sighting at a time.
#[derive(Debug, Clone)]
pub struct ReconcileRun {
    policy: ReconcilePolicy,
    prior: SentState,
    observed: usize,
    notified: usize,
    stopped: bool,
    first: Option<Sighting>,
    pending_save: Option<SentState>,
    seen: Vec<Sighting>,
}

impl ReconcileRun {
    pub fn observe(&mut self, sighting: Sighting) -> Step {
        if self.stopped {
            return Step::Stop;
        }
        self.observed += 1;
        match self.policy {
            ReconcilePolicy::SingleCursor { max_notifications } => {
                self.observe_cursor(sighting, max_notifications)
            }
            ReconcilePolicy::FullSet => self.observe_full_set(sighting),
        }
    }

    fn observe_cursor(&mut self, sighting: Sighting, max_notifications: usize) -> Step {
        if self.first.is_none() {
            if self.prior.cursor() != Some(&sighting) {
                self.pending_save = Some(SentState::Cursor(sighting.clone()));
            }
            self.first = Some(sighting.clone());
        }
        if self.prior.cursor() == Some(&sighting) {
            self.stopped = true;
            return Step::Stop;
        }
        if self.notified >= max_notifications {
            self.stopped = true;
            return Step::Stop;
        }
        self.notified += 1;
        if self.notified >= max_notifications {
            self.stopped = true;
        }
        Step::Notify(sighting)
    }

    fn observe_full_set(&mut self, sighting: Sighting) -> Step {
        let key = sighting.key();
        // Species sent by a previous run or earlier in this one.
        let already: BTreeSet<&str> = self
            .prior
            .history()
            .iter()
            .chain(self.seen.iter())
            .filter(|s| s.has_key(&key))
            .flat_map(|s| s.species.iter().map(String::as_str))
            .collect();
        let novel: BTreeSet<String> = sighting
            .species
            .iter()
            .filter(|sp| !already.contains(sp.as_str()))
            .cloned()
            .collect();
        self.seen.push(sighting);
        if novel.is_empty() {
            return Step::Skip;
        }
        self.notified += 1;
        Step::Notify(Sighting {
            location: key.location,
            date: key.date,
            species: novel.into_iter().collect(),
        })
    }

    /// The cursor to persist right now, handed out once, right after the
    /// first observation under the single-cursor policy.
    pub fn take_pending_save(&mut self) -> Option<SentState> {
        self.pending_save.take()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn notified(&self) -> usize {
        self.notified
    }

    pub fn finish(self) -> RunOutcome {
        let state = match self.policy {
            ReconcilePolicy::SingleCursor { .. } => match self.first {
                Some(first) => SentState::Cursor(first),
                None => self.prior.clone(),
            },
            ReconcilePolicy::FullSet => {
                if self.observed == 0 {
                    self.prior.clone()
                } else {
                    SentState::History(self.seen)
                }
            }
        };
        RunOutcome {
            changed: state != self.prior,
            state,
            observed: self.observed,
            notified: self.notified,
        }
    }
}
