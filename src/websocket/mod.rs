pub mod handler;
pub mod room_manager;

pub use handler::ws_handler;
pub use room_manager::{ClientConn, Outbox, RoomManager};
