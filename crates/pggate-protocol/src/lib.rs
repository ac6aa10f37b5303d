pub mod codec;
pub mod frontend;
pub mod message;
pub mod transport;
pub mod types;

pub use frontend::{DescribeTarget, FrontendMessage};
pub use message::{ErrorFields, Message};
pub use transport::{TransactionState, Transport};
