//! Hard input-size limits. These bound what a single request or deployment
//! may carry; they are not tunable at runtime.

/// Longest accepted raw student-identifier list (the comma-separated string).
pub const MAX_STUDENT_IDS_LEN: usize = 512;

/// Longest accepted date label.
pub const MAX_DATE_NAME_LEN: usize = 64;

/// Most dates a single deployment may configure.
pub const MAX_DATES: usize = 64;

/// Largest configurable per-date slot capacity.
pub const MAX_SLOTS_PER_DATE_CAP: u32 = 100_000;

/// Largest configurable group size.
pub const MAX_GROUP_SIZE: u32 = 64;
