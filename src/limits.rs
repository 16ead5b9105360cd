/// Slots accepted in one ad-hoc allocation.
pub const MAX_BATCH_SIZE: usize = 48;

/// Rows created by one recurring-series request (courts × days × slots).
pub const MAX_SERIES_ROWS: usize = 512;

pub const MAX_LABEL_LEN: usize = 200;

pub const MAX_NAME_LEN: usize = 256;

/// Capacity of the group-commit channel in front of the WAL writer.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
