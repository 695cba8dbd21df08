use crate::model::Ms;

// Hard caps. Input that crosses these is rejected with `LimitExceeded`
// before anything is journaled.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_REQUESTERS: usize = 100_000;
pub const MAX_WAITLIST: usize = 10_000;

pub const MAX_NAME_LEN: usize = 120;
pub const MAX_ROOM_NUMBER_LEN: usize = 16;
pub const MAX_NOTE_LEN: usize = 500;
pub const MAX_REASON_LEN: usize = 200;
pub const MAX_LABEL_LEN: usize = 100;

pub const MAX_ROOM_CAPACITY: u32 = 12;
pub const MIN_FLOOR: i32 = 0;
pub const MAX_FLOOR: i32 = 200;

pub const MAX_HOSTELS: usize = 64;
pub const MAX_HOSTEL_NAME_LEN: usize = 256;

/// 2000-01-01T00:00:00Z — expiry timestamps before this are garbage.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
