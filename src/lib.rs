//! 분당 결제 P2P 영상 통화: 시그널링 릴레이와 통화 수명주기

pub mod call;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ice;
pub mod protocol;
pub mod server;
pub mod state;

pub use error::{CallError, ConnectionError, MediaAcquisitionError, PaymentError, ProtocolError};
