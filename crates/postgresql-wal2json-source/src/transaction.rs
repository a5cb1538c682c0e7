//! Transaction framing of slot rows.
//!
//! A slot hands out whole transactions in commit order, but every row carries
//! the LSN of its own change. When transactions interleave, change LSNs are
//! not monotonic, so only the commit LSN tells whether a transaction was read
//! before. Rows are held back until their `C` row arrives and are then
//! released or dropped together.

use checkpoint::Lsn;
use tracing::{debug, warn};

use crate::change::Action;
use crate::source::WalMessage;

/// Releases the transactions a read starting at `start` still needs.
///
/// A transaction is needed when it committed at or after `start` and after
/// the last transaction already released, which keeps a re-read of the slot
/// from repeating what was handed out.
#[derive(Debug)]
pub struct TransactionBuffer {
    start: Lsn,
    /// Commit LSN of the newest released transaction.
    released_through: Option<Lsn>,
    open: Option<Vec<WalMessage>>,
}

impl TransactionBuffer {
    pub fn new(start: Lsn) -> Self {
        Self {
            start,
            released_through: None,
            open: None,
        }
    }

    /// Feed the next slot row and get back the rows it releases.
    pub fn push(&mut self, message: WalMessage) -> Vec<WalMessage> {
        match Action::of_payload(&message.payload) {
            Some(Action::Begin) => {
                if let Some(unfinished) = self.open.replace(vec![message]) {
                    warn!(
                        "Dropping {} rows of a transaction that never committed",
                        unfinished.len()
                    );
                }
                Vec::new()
            }
            Some(Action::Commit) => {
                let commit = message.data_start;
                let Some(mut rows) = self.open.take() else {
                    warn!("Commit at {} without a begin", commit);
                    return self.release_unframed(message);
                };
                rows.push(message);
                if !self.needs(commit) {
                    debug!(
                        "Skipping transaction committed at {} ({} rows)",
                        commit,
                        rows.len()
                    );
                    return Vec::new();
                }
                self.released_through = Some(commit);
                rows
            }
            _ => match &mut self.open {
                Some(rows) => {
                    rows.push(message);
                    Vec::new()
                }
                None => self.release_unframed(message),
            },
        }
    }

    /// Forget a transaction left open when a read window ends.
    pub fn end_window(&mut self) {
        if let Some(rows) = self.open.take() {
            warn!(
                "Read window ended inside a transaction, {} rows will be read again",
                rows.len()
            );
        }
    }

    /// Rows outside a transaction (logical decoding messages, output without
    /// framing) only have their own LSN to go by.
    fn release_unframed(&self, message: WalMessage) -> Vec<WalMessage> {
        if message.data_start < self.start {
            return Vec::new();
        }
        vec![message]
    }

    fn needs(&self, commit: Lsn) -> bool {
        commit >= self.start && self.released_through.map_or(true, |released| commit > released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{begin_message as begin, commit_message as commit, user_insert};

    fn feed(buffer: &mut TransactionBuffer, rows: Vec<WalMessage>) -> Vec<u64> {
        rows.into_iter()
            .flat_map(|row| buffer.push(row))
            .map(|row| row.data_start.as_u64())
            .collect()
    }

    #[test]
    fn test_transaction_is_released_on_commit() {
        let mut buffer = TransactionBuffer::new(Lsn(100));
        assert!(buffer.push(begin(150)).is_empty());
        assert!(buffer
            .push(user_insert(160, "public", "users", 1, "a"))
            .is_empty());
        let released = buffer.push(commit(170));
        assert_eq!(released.len(), 3);
    }

    #[test]
    fn test_interleaved_transaction_committed_after_start_is_kept() {
        // T1 wrote at 100 but committed at 400, after T2 (commit 250) had
        // been bookmarked
        let mut buffer = TransactionBuffer::new(Lsn(250));
        let released = feed(
            &mut buffer,
            vec![
                begin(180),
                user_insert(200, "public", "users", 2, "t2"),
                commit(250),
                begin(90),
                user_insert(100, "public", "users", 1, "t1"),
                commit(400),
            ],
        );
        assert_eq!(released, vec![180, 200, 250, 90, 100, 400]);
    }

    #[test]
    fn test_transactions_committed_before_start_are_skipped() {
        let mut buffer = TransactionBuffer::new(Lsn(300));
        let released = feed(
            &mut buffer,
            vec![
                begin(100),
                user_insert(120, "public", "users", 1, "a"),
                commit(200),
                begin(260),
                user_insert(280, "public", "users", 2, "b"),
                commit(320),
            ],
        );
        assert_eq!(released, vec![260, 280, 320]);
    }

    #[test]
    fn test_reread_window_does_not_repeat_released_transactions() {
        let mut buffer = TransactionBuffer::new(Lsn(100));
        let window = || {
            vec![
                begin(100),
                user_insert(110, "public", "users", 1, "a"),
                commit(120),
            ]
        };
        assert_eq!(feed(&mut buffer, window()), vec![100, 110, 120]);
        buffer.end_window();
        assert!(feed(&mut buffer, window()).is_empty());

        let mut next = window();
        next.extend([
            begin(130),
            user_insert(140, "public", "users", 2, "b"),
            commit(150),
        ]);
        assert_eq!(feed(&mut buffer, next), vec![130, 140, 150]);
    }

    #[test]
    fn test_unframed_rows_go_by_their_own_lsn() {
        let mut buffer = TransactionBuffer::new(Lsn(200));
        let released = feed(
            &mut buffer,
            vec![
                user_insert(150, "public", "users", 1, "a"),
                user_insert(200, "public", "users", 2, "b"),
                user_insert(200, "public", "users", 3, "c"),
            ],
        );
        assert_eq!(released, vec![200, 200]);
    }
}
