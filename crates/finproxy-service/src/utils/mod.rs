pub mod clock;
pub mod futures;
pub mod http;
