use super::Outcome;
use crate::encoding;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// The number of recent outcomes retained per client session.
pub const SESSION_OUTCOMES: usize = 16;

/// A client session: the highest applied sequence number for the client, and
/// the outcomes of its most recent transactions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// The highest applied sequence number.
    pub seq: u64,
    /// The last SESSION_OUTCOMES (seq, outcome) pairs, in application order.
    pub outcomes: VecDeque<(u64, Outcome)>,
}

impl encoding::Value for Session {}

impl Session {
    /// Returns the stored outcome for the sequence number, if retained.
    pub fn outcome(&self, seq: u64) -> Option<&Outcome> {
        self.outcomes.iter().rev().find(|(s, _)| *s == seq).map(|(_, outcome)| outcome)
    }
}

/// Tracks client sessions, to detect resubmitted transactions. A client tags
/// each logical write with increasing sequence numbers, and retries it with
/// the same tag after an unknown outcome (e.g. a timeout). A transaction whose
/// sequence number is at or below the client's highest applied sequence
/// number is a duplicate, and is not applied again.
///
/// Sessions are reference counted, so cloning the progress for a snapshot is
/// cheap and unaffected by later writes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientProgress {
    sessions: Arc<BTreeMap<String, Arc<Session>>>,
}

impl ClientProgress {
    /// Creates an empty client progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks if a transaction is a duplicate, returning the outcome to report
    /// for it. This is the original outcome if still retained, otherwise
    /// Outcome::Duplicate.
    pub fn check(&self, client_id: &str, seq: u64) -> Option<Outcome> {
        let session = self.sessions.get(client_id)?;
        if seq > session.seq {
            return None;
        }
        Some(session.outcome(seq).cloned().unwrap_or(Outcome::Duplicate { seq }))
    }

    /// Records the outcome of an applied transaction.
    pub fn record(&mut self, client_id: &str, seq: u64, outcome: Outcome) {
        let sessions = Arc::make_mut(&mut self.sessions);
        let session = Arc::make_mut(sessions.entry(client_id.to_string()).or_default());
        session.seq = session.seq.max(seq);
        session.outcomes.push_back((seq, outcome));
        while session.outcomes.len() > SESSION_OUTCOMES {
            session.outcomes.pop_front();
        }
    }

    /// Returns a client's session, if any.
    pub fn session(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id).map(Arc::as_ref)
    }

    /// Returns the number of client sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if there are no client sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn check_record() {
        let mut progress = ClientProgress::new();
        assert_eq!(progress.check("a", 1), None);

        progress.record("a", 1, Outcome::Applied { index: 3 });
        progress.record("a", 2, Outcome::Rejected { index: 4, path: "/x".into() });
        assert_eq!(progress.check("a", 1), Some(Outcome::Applied { index: 3 }));
        assert_eq!(progress.check("a", 2), Some(Outcome::Rejected { index: 4, path: "/x".into() }));
        assert_eq!(progress.check("a", 3), None);
        assert_eq!(progress.check("b", 1), None);

        // Skipped sequence numbers are considered applied.
        progress.record("a", 5, Outcome::Applied { index: 6 });
        assert_eq!(progress.check("a", 4), Some(Outcome::Duplicate { seq: 4 }));
        assert_eq!(progress.session("a").map(|s| s.seq), Some(5));
        assert_eq!(progress.len(), 1);
    }

    #[test]
    /// Only the most recent outcomes are retained.
    fn window() {
        let mut progress = ClientProgress::new();
        for seq in 1..=20 {
            progress.record("a", seq, Outcome::Applied { index: seq + 10 });
        }
        let session = progress.session("a").expect("no session");
        assert_eq!(session.outcomes.len(), SESSION_OUTCOMES);
        assert_eq!(session.outcomes.front(), Some(&(5, Outcome::Applied { index: 15 })));
        assert_eq!(progress.check("a", 4), Some(Outcome::Duplicate { seq: 4 }));
        assert_eq!(progress.check("a", 5), Some(Outcome::Applied { index: 15 }));
    }

    #[test]
    /// Clones don't see later records.
    fn clone_isolation() {
        let mut progress = ClientProgress::new();
        progress.record("a", 1, Outcome::Applied { index: 1 });
        let capture = progress.clone();
        progress.record("a", 2, Outcome::Applied { index: 2 });
        progress.record("b", 1, Outcome::Applied { index: 3 });
        assert_eq!(capture.session("a").map(|s| s.seq), Some(1));
        assert_eq!(capture.len(), 1);
        assert_eq!(progress.len(), 2);
    }
}
