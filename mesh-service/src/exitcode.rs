//! Process exit codes (spec §6 "Exit codes"), sysexits-flavored the way the
//! teacher's own `exitcode` module is referenced from `main.rs`.

pub const OK: i32 = 0;
pub const ERR_USAGE: i32 = 64;
pub const ERR_CONFIG: i32 = 78;
pub const ERR_IOERR: i32 = 74;
