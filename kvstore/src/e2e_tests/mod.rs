//! End-to-end tests driving the frontend, store and replication master
//! together, with an in-memory replica on the other end of the stream.
//!
//! Each test file covers one scenario. Clocks are manual so timestamps are
//! deterministic.

#![cfg(test)]

mod helpers;

mod test_backfill;
mod test_backfill_stall;
mod test_heartbeat;
mod test_incr_decr_codes;
mod test_nop_barrier;
mod test_ordering;
mod test_registration;
mod test_replacement;
mod test_shutdown;
mod test_stalled_replica;
mod test_value_forwarding;
