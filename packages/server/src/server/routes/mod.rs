pub mod health;
pub mod sessions;
pub mod stream;

pub use health::health_handler;
pub use sessions::{cancel_session_handler, create_session_handler, session_snapshot_handler};
pub use stream::stream_handler;
