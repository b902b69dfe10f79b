use std::time::Duration;

use rusqlite::params;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink};
use crate::db::Database;

/// Maximum number of records to buffer before flushing, regardless of timer.
const BATCH_SIZE: usize = 100;

/// How often to flush buffered records even if the batch is not full.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Audit sink that hands records to the background SQLite writer.
///
/// `send` on an unbounded channel never blocks, so this sink is safe to call
/// from inside the admission critical section.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl ChannelAuditSink {
    pub fn new(tx: mpsc::UnboundedSender<AuditRecord>) -> Self {
        Self { tx }
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, record: AuditRecord) {
        if let Err(e) = self.tx.send(record) {
            tracing::error!(event = %e.0.event, "Audit logger is gone, dropping record");
        }
    }
}

/// Spawn a background task that reads `AuditRecord` values from the channel
/// and batch-writes them to the `audit_log` table.
///
/// The returned `JoinHandle` can be used to wait for graceful shutdown (the
/// task exits when every sender is dropped and remaining records are
/// flushed).
pub fn spawn_audit_logger(
    db: Database,
    mut rx: mpsc::UnboundedReceiver<AuditRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<AuditRecord> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        // Don't pile up ticks while we're busy flushing.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                record = rx.recv() => {
                    match record {
                        Some(r) => {
                            buffer.push(r);
                            if buffer.len() >= BATCH_SIZE {
                                flush_batch(&db, &mut buffer);
                            }
                        }
                        None => {
                            // Channel closed -- flush remaining and exit.
                            if !buffer.is_empty() {
                                flush_batch(&db, &mut buffer);
                            }
                            tracing::info!("Audit logger shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        flush_batch(&db, &mut buffer);
                    }
                }
            }
        }
    })
}

/// Write a batch of audit records to the database in a single transaction.
fn flush_batch(db: &Database, buffer: &mut Vec<AuditRecord>) {
    let records = std::mem::take(buffer);
    let count = records.len();

    if let Err(e) = write_records(db, &records) {
        tracing::error!(count, error = %e, "Failed to flush audit batch");
        // Put records back so we can retry on the next tick.
        buffer.extend(records);
    } else {
        tracing::debug!(count, "Flushed audit batch");
    }
}

fn write_records(db: &Database, records: &[AuditRecord]) -> Result<(), rusqlite::Error> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;

        {
            let mut insert_stmt = tx.prepare_cached(
                "INSERT INTO audit_log (id, timestamp, request_id, symbol, event, \
                 call_count_snapshot, reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for record in records {
                insert_stmt.execute(params![
                    Uuid::new_v4().to_string(),
                    record.timestamp.to_rfc3339(),
                    record.request_id,
                    record.symbol,
                    record.event.as_str(),
                    record.call_count_snapshot,
                    record.reason,
                ])?;
            }
        }

        tx.commit()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
