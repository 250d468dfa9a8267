pub mod charset;
pub mod classify;
pub mod codec;
pub mod constants;
pub mod error_codes;
pub mod packet;
pub mod session_track;
