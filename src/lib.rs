#![allow(non_snake_case)]

#[macro_use]
pub mod result;

#[macro_use]
pub mod util;

pub mod emu;

pub mod kern;

pub mod mem;
