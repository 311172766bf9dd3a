//! 릴레이 동작: 연결 수명, 방 참여/탈퇴, 메시지 중계, TURN 자격증명

pub mod connection;
pub mod room;
pub mod signaling;
pub mod turn;

pub use connection::{handle_connection, handle_disconnect};
pub use room::{handle_join, handle_leave};
pub use signaling::{handle_relay, handle_text};
pub use turn::turn_credentials_handler;
