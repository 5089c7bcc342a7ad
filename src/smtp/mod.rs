//! SMTP transport: connection pooling, retry classification and MIME
//! composition.

pub mod classifier;
pub mod compose;
pub mod pool;

pub use classifier::{classify, Outcome};
pub use pool::SmtpConnectionPool;
