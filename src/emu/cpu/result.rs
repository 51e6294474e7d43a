use crate::result::*;

pub const RESULT_MODULE: u32 = 505;

result_define_group!(RESULT_MODULE => {
    InvalidEntry: 1,
    UnknownSvc: 2,
    InvalidRegister: 3
});
