//! Utility Functions Module
//!
//! Small helpers shared by the transaction layers:
//! - the [`generate_custom_enum!`](crate::generate_custom_enum) macro for
//!   enumerations with vendor ranges
//! - modulo-256 arithmetic on segment sequence numbers
//! - segment count calculation
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::util::{seq_distance, seq_in_window};
//!
//! // window of 10 starting at 250 wraps past 255
//! assert!(seq_in_window(3, 250, 10));
//! assert_eq!(seq_distance(3, 250), 9);
//! ```

mod enum_macros;

/// Next segment sequence number, wrapping at 256
pub fn seq_next(seq: u8) -> u8 {
    seq.wrapping_add(1)
}

/// Forward distance from `base` to `seq` on the 8-bit sequence ring
pub fn seq_distance(seq: u8, base: u8) -> u8 {
    seq.wrapping_sub(base)
}

/// True iff `seq` falls in `[base, base + window)` modulo 256
pub fn seq_in_window(seq: u8, base: u8, window: u8) -> bool {
    seq_distance(seq, base) < window
}

/// Number of segments needed to carry `payload_len` bytes in pieces of
/// `segment_size`. An empty payload still occupies one segment.
pub fn segment_count(payload_len: usize, segment_size: usize) -> usize {
    if payload_len == 0 || segment_size == 0 {
        return 1;
    }
    payload_len.div_ceil(segment_size)
}
