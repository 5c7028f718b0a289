pub mod manager;


pub use manager::{JoinReceipt, RoomManager, RoomReceipt};
