use crate::result::*;

pub const RESULT_MODULE: u32 = 504;

result_define_group!(RESULT_MODULE => {
    InvalidMemoryRegion: 1,
    InvalidGranularity: 2,
    RangeOutOfBounds: 3,
    UnmappedRange: 4
});
