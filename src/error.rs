// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Return-value vocabulary for the slot queue's data path, plus the
// `io::Error`-based result type used by setup/handshake paths.

use std::fmt;

/// Outcome of a single producer or consumer operation on a [`crate::queue::SlotQueue`].
///
/// These are plain return values, never panics: the data path never retries
/// autonomously — `force_push` resolves any CAS failure in a single
/// additional step, never a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// The queue has never been written to.
    NoMessage,
    /// The queue has not advanced since the caller's last read.
    NoUpdate,
    /// A single new message was delivered.
    Success,
    /// One or more messages were dropped; the returned slot is the newest
    /// the consumer could recover.
    Discarded,
    /// `try_push` only: the queue is full and the caller chose
    /// non-overwriting mode. No state was mutated.
    Fail,
    /// Invariant violation (index out of range). Fatal for the channel.
    Error,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueStatus::NoMessage => "no message",
            QueueStatus::NoUpdate => "no update",
            QueueStatus::Success => "success",
            QueueStatus::Discarded => "discarded",
            QueueStatus::Fail => "fail",
            QueueStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl QueueStatus {
    pub fn is_success(self) -> bool {
        matches!(self, QueueStatus::Success | QueueStatus::Discarded)
    }
}

/// Result type for setup/handshake paths (shm creation, socket I/O, header
/// and protocol validation). Matches the corpus's own `std::io::Error` idiom;
/// no `thiserror`/`anyhow` dependency is introduced.
pub type IpcResult<T> = std::io::Result<T>;

pub(crate) fn invalid_data(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

pub(crate) fn other(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, msg.into())
}
