//! Hard limits on inputs and stored state.

/// Maximum number of games in the catalog.
pub const MAX_RESOURCES: usize = 1_024;

/// Maximum length of a game name.
pub const MAX_NAME_LEN: usize = 128;

/// Maximum length of a user handle (RFC 5321 path limit).
pub const MAX_HANDLE_LEN: usize = 254;

/// Maximum number of registered users.
pub const MAX_USERS: usize = 100_000;

/// Maximum number of reservation rows a single user may accumulate.
pub const MAX_RESERVATIONS_PER_USER: usize = 10_000;

/// Maximum length of one protocol request line in bytes.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Number of civil days covered by a week board.
pub const WEEK_BOARD_DAYS: u32 = 7;
