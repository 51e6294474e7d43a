pub mod cfg;

pub mod cpu;

pub mod kern;
