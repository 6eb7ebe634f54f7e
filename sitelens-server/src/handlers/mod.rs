pub mod reports;
pub mod scan;
pub mod websocket;
