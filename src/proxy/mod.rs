pub mod handler;
pub mod session;
pub mod transport;
pub mod upstream;
