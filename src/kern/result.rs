use crate::result::*;

pub const RESULT_MODULE: u32 = 1;

result_define_group!(RESULT_MODULE => {
    TerminationRequested: 59,

    OutOfResource: 103,
    OutOfMemory: 104,
    OutOfHandles: 105,

    InvalidMemoryRegion: 110,

    InvalidPriority: 112,
    InvalidCoreId: 113,
    InvalidHandle: 114,
    InvalidCombination: 116,
    TimedOut: 117,
    Cancelled: 118,
    OutOfRange: 119,
    NotFound: 121,
    Busy: 122,
    InvalidState: 125,
    LimitReached: 132
});
