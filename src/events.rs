//! Ordered event log.
//!
//! Events are appended inside the same atomic unit as the state change they
//! describe; there is no outbox and no after-commit publication of record.
//! Sequence numbers come from a counter row locked by the writing unit, so
//! committed numbers are exactly `{1..N}` with no gaps: an aborted unit rolls
//! its increment back together with everything else.

use crate::error::{PayoutError, Result};
use crate::models::EventRecord;
use crate::store::{ignore_no_rows, now_rfc3339};
use rusqlite::{params, Connection, Row};
use serde_json::Value;

/// Source of the next event sequence number.
///
/// The default allocator is gapless. A deployment that prefers throughput
/// over density (e.g. a database-native sequence) can substitute its own
/// implementation; consumers must then treat sequence numbers as strictly
/// increasing rather than dense.
pub trait SequenceAllocator: Send + Sync {
    fn next_sequence(&self, conn: &Connection) -> Result<i64>;
}

/// Gapless allocator backed by the `event_sequence` counter row.
#[derive(Debug, Default)]
pub struct GaplessCounter;

impl SequenceAllocator for GaplessCounter {
    fn next_sequence(&self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "UPDATE event_sequence SET value = value + 1 WHERE id = 1",
            [],
        )?;
        let value: i64 = conn.query_row(
            "SELECT value FROM event_sequence WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(value)
    }
}

#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub event_id: &'a str,
    pub aggregate_type: &'a str,
    pub aggregate_id: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

/// Appends an event, assigning the next sequence number.
///
/// Idempotent on `event_id`: a duplicate append returns the stored event
/// unchanged and consumes no sequence number.
pub fn append_event(
    conn: &Connection,
    allocator: &dyn SequenceAllocator,
    event: NewEvent<'_>,
) -> Result<EventRecord> {
    if let Some(existing) = get_by_event_id(conn, event.event_id)? {
        return Ok(existing);
    }

    let sequence = allocator.next_sequence(conn)?;
    let created_at = now_rfc3339();
    let payload_json = serde_json::to_string(&event.payload)
        .map_err(|e| PayoutError::Validation(format!("unserializable event payload: {e}")))?;

    conn.execute(
        "INSERT INTO events
             (sequence_number, event_id, aggregate_type, aggregate_id, event_type, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            sequence,
            event.event_id,
            event.aggregate_type,
            event.aggregate_id,
            event.event_type,
            payload_json,
            created_at,
        ],
    )?;

    Ok(EventRecord {
        sequence_number: sequence,
        event_id: event.event_id.to_string(),
        aggregate_type: event.aggregate_type.to_string(),
        aggregate_id: event.aggregate_id.to_string(),
        event_type: event.event_type.to_string(),
        payload: event.payload,
        created_at: crate::ledger::parse_ts(&created_at),
    })
}

pub fn get_by_event_id(conn: &Connection, event_id: &str) -> Result<Option<EventRecord>> {
    conn.query_row(
        "SELECT sequence_number, event_id, aggregate_type, aggregate_id, event_type, payload, created_at
         FROM events WHERE event_id = ?1",
        params![event_id],
        event_from_row,
    )
    .map(Some)
    .or_else(ignore_no_rows)
}

/// Events with sequence strictly greater than `since`, ascending.
pub fn events_since(conn: &Connection, since: i64, limit: usize) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sequence_number, event_id, aggregate_type, aggregate_id, event_type, payload, created_at
         FROM events WHERE sequence_number > ?1
         ORDER BY sequence_number
         LIMIT ?2",
    )?;
    let events = stmt
        .query_map(params![since, limit as i64], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Full ordered history of one aggregate.
pub fn aggregate_history(
    conn: &Connection,
    aggregate_type: &str,
    aggregate_id: &str,
) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sequence_number, event_id, aggregate_type, aggregate_id, event_type, payload, created_at
         FROM events WHERE aggregate_type = ?1 AND aggregate_id = ?2
         ORDER BY sequence_number",
    )?;
    let events = stmt
        .query_map(params![aggregate_type, aggregate_id], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Highest committed sequence number, 0 when the log is empty.
pub fn max_sequence(conn: &Connection) -> Result<i64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence_number), 0) FROM events",
        [],
        |row| row.get(0),
    )?;
    Ok(max)
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let payload_json: String = row.get(5)?;
    Ok(EventRecord {
        sequence_number: row.get(0)?,
        event_id: row.get(1)?,
        aggregate_type: row.get(2)?,
        aggregate_id: row.get(3)?,
        event_type: row.get(4)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        created_at: crate::ledger::parse_ts(&row.get::<_, String>(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    fn append(store: &Store, event_id: &str, aggregate_id: &str) -> EventRecord {
        store
            .with_txn(|txn| {
                append_event(
                    txn,
                    &GaplessCounter,
                    NewEvent {
                        event_id,
                        aggregate_type: "payout",
                        aggregate_id,
                        event_type: "PayoutCreated",
                        payload: json!({"k": aggregate_id}),
                    },
                )
            })
            .unwrap()
    }

    #[test]
    fn sequence_numbers_are_dense_from_one() {
        let store = Store::open_in_memory().unwrap();
        for i in 1..=5 {
            let ev = append(&store, &format!("e{i}"), "p1");
            assert_eq!(ev.sequence_number, i);
        }

        let all = store.read(|conn| events_since(conn, 0, 100)).unwrap();
        let seqs: Vec<i64> = all.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn duplicate_event_id_returns_existing_without_consuming_sequence() {
        let store = Store::open_in_memory().unwrap();
        let first = append(&store, "dup", "p1");
        let replay = append(&store, "dup", "p1");
        assert_eq!(first.sequence_number, replay.sequence_number);

        let next = append(&store, "after-dup", "p1");
        assert_eq!(next.sequence_number, first.sequence_number + 1);
    }

    #[test]
    fn aborted_unit_does_not_skip_sequence_numbers() {
        let store = Store::open_in_memory().unwrap();
        append(&store, "e1", "p1");

        let result: crate::error::Result<()> = store.with_txn(|txn| {
            append_event(
                txn,
                &GaplessCounter,
                NewEvent {
                    event_id: "doomed",
                    aggregate_type: "payout",
                    aggregate_id: "p1",
                    event_type: "PayoutCreated",
                    payload: json!({}),
                },
            )?;
            Err(PayoutError::Conflict("forced abort".to_string()))
        });
        assert!(result.is_err());

        // The next committed event reuses the rolled-back number.
        let next = append(&store, "e2", "p1");
        assert_eq!(next.sequence_number, 2);
    }

    #[test]
    fn aggregate_history_is_ordered_and_scoped() {
        let store = Store::open_in_memory().unwrap();
        append(&store, "a1", "p1");
        append(&store, "b1", "p2");
        append(&store, "a2", "p1");

        let history = store
            .read(|conn| aggregate_history(conn, "payout", "p1"))
            .unwrap();
        let ids: Vec<&str> = history.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert!(history.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
    }

    #[test]
    fn since_cursor_is_exclusive_and_limited() {
        let store = Store::open_in_memory().unwrap();
        for i in 1..=10 {
            append(&store, &format!("e{i}"), "p1");
        }

        let page = store.read(|conn| events_since(conn, 3, 4)).unwrap();
        let seqs: Vec<i64> = page.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);
    }
}
