// Hard limits on user-supplied text, enforced by the engine.

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_PROFILE_LINK_LEN: usize = 256;
pub const MAX_DECLINE_REASON_LEN: usize = 512;
pub const MAX_BLACKLIST_IDENTITY_LEN: usize = 128;

// Fixed calendar constants.

/// Days offered for booking, counted from the Monday of the current week.
pub const BOOKING_WINDOW_DAYS: i64 = 14;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

// Cache keys. Every booking-derived key shares the `bookings:` prefix so one
// pattern invalidation drops them all.

pub const BOOKINGS_KEY: &str = "bookings:all";
pub const BOOKINGS_PREFIX: &str = "bookings:";
pub const SCHEDULE_KEY: &str = "schedule:all";
pub const BLACKLIST_KEY: &str = "blacklist:all";
