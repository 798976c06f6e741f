use std::time::Duration;

use chrono::{DateTime, Utc};

/// The latest latency measurement towards a single peer IP.
///
/// All three fields are updated together by a single read-modify-write on the owning store. A
///  partially filled entry is valid: a send time without a matching receive time means a probe
///  is outstanding (or was never answered), and an entry without a send time was created by a
///  reply that arrived without a preceding send from this process.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LatencyEntry {
    pub last_send_time: Option<DateTime<Utc>>,
    pub last_recv_time: Option<DateTime<Utc>>,
    pub last_measured_rtt: Option<Duration>,
}

/// Liveness of a peer as far as it can be told from the latest entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerStatus {
    /// no probe was sent yet
    Unprobed,
    /// the latest probe has not been answered (yet)
    Outstanding,
    /// the latest probe was answered
    Answered,
}

impl LatencyEntry {
    pub fn status(&self) -> PeerStatus {
        match (self.last_send_time, self.last_recv_time) {
            (None, _) => PeerStatus::Unprobed,
            (Some(_), None) => PeerStatus::Outstanding,
            (Some(sent), Some(received)) => {
                if received >= sent {
                    PeerStatus::Answered
                }
                else {
                    PeerStatus::Outstanding
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use chrono::{TimeDelta, Utc};
    use rstest::rstest;
    use crate::stats::latency_entry::{LatencyEntry, PeerStatus};

    #[rstest]
    #[case::unprobed(None, None, PeerStatus::Unprobed)]
    #[case::reply_without_send(None, Some(0), PeerStatus::Unprobed)]
    #[case::outstanding(Some(0), None, PeerStatus::Outstanding)]
    #[case::answered(Some(0), Some(3), PeerStatus::Answered)]
    #[case::resent_after_answer(Some(10), Some(3), PeerStatus::Outstanding)]
    fn test_status(#[case] sent_millis: Option<i64>, #[case] received_millis: Option<i64>, #[case] expected: PeerStatus) {
        let base = Utc::now();
        let entry = LatencyEntry {
            last_send_time: sent_millis.map(|m| base + TimeDelta::milliseconds(m)),
            last_recv_time: received_millis.map(|m| base + TimeDelta::milliseconds(m)),
            last_measured_rtt: Some(Duration::from_millis(3)),
        };
        assert_eq!(entry.status(), expected);
    }
}
