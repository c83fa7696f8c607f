//! Provider change detection by snapshot diff.

use crate::terminal::{PositionId, ProviderPosition};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// A change on the provider account between two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Opened(ProviderPosition),
    Modified {
        position: ProviderPosition,
        old_stop_loss: Option<Decimal>,
        old_take_profit: Option<Decimal>,
    },
    Closed {
        position_id: PositionId,
    },
}

impl PositionEvent {
    pub fn position_id(&self) -> PositionId {
        match self {
            PositionEvent::Opened(position) => position.position_id,
            PositionEvent::Modified { position, .. } => position.position_id,
            PositionEvent::Closed { position_id } => *position_id,
        }
    }
}

/// Drop the engine's own duplicates from a provider snapshot.
pub fn without_engine_duplicates(positions: Vec<ProviderPosition>) -> Vec<ProviderPosition> {
    positions
        .into_iter()
        .filter(|p| !p.is_engine_duplicate())
        .collect()
}

/// Diff `current` against `previous`, keyed by position id.
///
/// Events come out grouped as Opened, Modified, Closed, each group in
/// ascending position id order. A ticket the broker reuses after a close
/// is a fresh Opened; when the old and the new trade fall into the same
/// diff (same id, different open time) it is reported as both Closed and
/// Opened.
pub fn diff(
    previous: &HashMap<PositionId, ProviderPosition>,
    current: &[ProviderPosition],
) -> Vec<PositionEvent> {
    let mut opened = Vec::new();
    let mut modified = Vec::new();
    let mut replaced = Vec::new();

    for position in current {
        match previous.get(&position.position_id) {
            None => opened.push(PositionEvent::Opened(position.clone())),
            Some(before) if before.opened_at != position.opened_at => {
                replaced.push(position.position_id);
                opened.push(PositionEvent::Opened(position.clone()));
            }
            Some(before) if before.protective_levels_differ(position) => {
                modified.push(PositionEvent::Modified {
                    position: position.clone(),
                    old_stop_loss: before.stop_loss,
                    old_take_profit: before.take_profit,
                })
            }
            Some(_) => {}
        }
    }

    let current_ids: std::collections::HashSet<PositionId> =
        current.iter().map(|p| p.position_id).collect();
    let mut closed: Vec<PositionEvent> = previous
        .keys()
        .filter(|id| !current_ids.contains(id))
        .chain(replaced.iter())
        .map(|&position_id| PositionEvent::Closed { position_id })
        .collect();

    opened.sort_by_key(PositionEvent::position_id);
    modified.sort_by_key(PositionEvent::position_id);
    closed.sort_by_key(PositionEvent::position_id);

    opened.into_iter().chain(modified).chain(closed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(id: PositionId) -> ProviderPosition {
        ProviderPosition::new(id, "EURUSD", Side::Buy, dec!(1), dec!(1.08), Utc::now())
    }

    fn snapshot(positions: &[ProviderPosition]) -> HashMap<PositionId, ProviderPosition> {
        positions.iter().map(|p| (p.position_id, p.clone())).collect()
    }

    #[test]
    fn test_first_snapshot_opens_everything() {
        let events = diff(&HashMap::new(), &[position(3), position(1)]);
        assert_eq!(
            events.iter().map(PositionEvent::position_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert!(events.iter().all(|e| matches!(e, PositionEvent::Opened(_))));
    }

    #[test]
    fn test_unchanged_snapshot_is_quiet() {
        let positions = vec![position(1), position(2)];
        assert!(diff(&snapshot(&positions), &positions).is_empty());
    }

    #[test]
    fn test_protective_change_is_modified() {
        let before = position(1).with_stop_loss(dec!(1.07));
        let after = position(1).with_stop_loss(dec!(1.075)).with_take_profit(dec!(1.1));

        let events = diff(&snapshot(&[before]), &[after.clone()]);
        assert_eq!(
            events,
            vec![PositionEvent::Modified {
                position: after,
                old_stop_loss: Some(dec!(1.07)),
                old_take_profit: None,
            }]
        );
    }

    #[test]
    fn test_mixed_changes_are_grouped() {
        let previous = snapshot(&[position(1), position(2)]);
        let current = vec![position(2).with_take_profit(dec!(1.2)), position(5)];

        let events = diff(&previous, &current);
        assert!(matches!(events[0], PositionEvent::Opened(ref p) if p.position_id == 5));
        assert!(matches!(events[1], PositionEvent::Modified { ref position, .. } if position.position_id == 2));
        assert_eq!(events[2], PositionEvent::Closed { position_id: 1 });
    }

    #[test]
    fn test_engine_duplicates_are_filtered() {
        let positions = vec![position(1), position(2).with_comment("DUPLICATE_OF:1")];
        let filtered = without_engine_duplicates(positions);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].position_id, 1);
    }

    #[test]
    fn test_reused_ticket_within_one_poll_is_closed_and_opened() {
        let earlier = Utc::now() - chrono::Duration::minutes(30);
        let old = ProviderPosition::new(4, "EURUSD", Side::Buy, dec!(1), dec!(1.08), earlier);
        let reused = position(4);

        let events = diff(&snapshot(&[old]), &[reused.clone()]);
        assert_eq!(
            events,
            vec![PositionEvent::Opened(reused), PositionEvent::Closed { position_id: 4 }]
        );
    }
}
