/// How long a broadcast transaction may wait for a receipt before the
/// watcher escalates fees, when the caller did not set a timeout.
pub const DEFAULT_CONFIRMATION_TIMEOUT_SECONDS: u64 = 300;

/// Gas limit of a plain value transfer; cancellation transactions are
/// self-transfers and never need more.
pub const NOOP_GAS_LIMIT: u64 = 21_000;

/// Percent applied to gas estimates before broadcast. 110 = 10% headroom.
pub const GAS_LIMIT_HEADROOM_PERCENT: u64 = 110;
