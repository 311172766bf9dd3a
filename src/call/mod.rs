//! 통화 수명주기: 피어 연결, 과금, 세션

pub mod billing;
pub mod connection;
pub mod media;
pub mod payment;
pub mod room;
pub mod session;
pub mod signaling;
pub mod split;
pub mod transport;

pub use billing::{
    BillingEngine, BillingHandle, BillingReport, BillingState, PaymentOutcome, PaymentRecord,
};
pub use connection::{ConnectionState, PeerConnectionManager};
pub use room::{Capabilities, Role, Room};
pub use session::{CallControl, CallEnd, CallSession, CallSummary, SessionDeps, SessionEvent};
pub use split::{prepayment_amount, split, PaymentSplit};
