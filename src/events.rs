use crate::models::channel::{ChannelId, ChannelSnapshot};
use chrono::{DateTime, Local};
use log::{debug, info};

/// A digital input transition, as written to the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub timestamp: DateTime<Local>,
    pub channel_id: ChannelId,
    pub event_status: bool,
    pub channel_name: String,
}

/// One record per digital input whose transition flag is set in `snapshot`.
///
/// Acknowledging the flags is left to the channel source.
pub fn collect(snapshot: &ChannelSnapshot, now: DateTime<Local>) -> Vec<EventRecord> {
    snapshot
        .digital_inputs
        .iter()
        .filter(|din| din.has_pending_event())
        .map(|din| {
            info!("Event on digital input {} (id {}), status {:?}", din.name, din.id, din.status);
            EventRecord {
                timestamp: now,
                channel_id: din.id,
                event_status: true,
                channel_name: din.name.clone(),
            }
        })
        .inspect(|ev| debug!("Event record {:?}", ev))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::ChannelReading;

    fn snapshot(flags: &[bool]) -> ChannelSnapshot {
        ChannelSnapshot {
            digital_inputs: flags
                .iter()
                .enumerate()
                .map(|(i, f)| ChannelReading::digital(i as u32 + 1, format!("DI{}", i + 1), Some(*f), *f))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn only_flagged_inputs_produce_records() {
        let events = collect(&snapshot(&[false, true, false, true]), Local::now());
        let ids = events.iter().map(|e| e.channel_id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 4]);
        assert!(events.iter().all(|e| e.event_status));
    }

    #[test]
    fn one_record_per_tick_while_flagged() {
        let flagged = snapshot(&[true]);
        let cleared = snapshot(&[false]);
        let total = [&flagged, &flagged, &cleared, &cleared]
            .iter()
            .map(|s| collect(s, Local::now()).len())
            .collect::<Vec<_>>();
        assert_eq!(total, vec![1, 1, 0, 0]);
    }

    #[test]
    fn unknown_event_flag_is_ignored() {
        let mut snap = snapshot(&[true]);
        snap.digital_inputs[0].status_event = None;
        assert!(collect(&snap, Local::now()).is_empty());
    }
}
