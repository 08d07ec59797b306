//! Account credentials and the session gate.

pub mod password;
pub mod session;

pub use password::{hash_password, verify_password};
pub use session::{Session, SessionGate, SessionState, session_cookie, token_from_headers};
