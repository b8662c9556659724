pub mod frame;
pub mod session;
pub mod tcp;
pub mod udp;
